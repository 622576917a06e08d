use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::OnceCell;
use zbus::Connection;
use zbus::fdo::ObjectManagerProxy;
use zbus::zvariant::OwnedValue;

use crate::reading::Percent;

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FallbackResult {
    /// Percentage and the name the host knows the device by.
    Success(Percent, String),
    Unavailable,
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn read_battery(&self, name_hint: &str) -> FallbackResult;
}

#[async_trait]
impl<T: DeviceStore + ?Sized> DeviceStore for std::sync::Arc<T> {
    async fn read_battery(&self, name_hint: &str) -> FallbackResult {
        (**self).read_battery(name_hint).await
    }
}

/// Case-insensitive: the candidate must contain the hint, so a hint of
/// "MX Master" matches "MX Master 3S" but "MX" never matches a longer hint.
pub fn name_matches(candidate: &str, hint: &str) -> bool {
    let candidate = candidate.trim().to_lowercase();
    let hint = hint.trim().to_lowercase();
    if candidate.is_empty() || hint.is_empty() {
        return false;
    }
    candidate.contains(&hint)
}

/// Battery values the host already knows about: BlueZ's `Battery1`
/// interface first, then the kernel power_supply class.
pub struct HostDeviceStore {
    connection: OnceCell<Connection>,
    power_supply_root: PathBuf,
}

impl Default for HostDeviceStore {
    fn default() -> Self {
        HostDeviceStore::new(PathBuf::from(POWER_SUPPLY_ROOT))
    }
}

impl HostDeviceStore {
    pub fn new(power_supply_root: PathBuf) -> Self {
        HostDeviceStore {
            connection: OnceCell::new(),
            power_supply_root,
        }
    }

    async fn read_bluez(&self, name_hint: &str) -> zbus::Result<Option<(Percent, String)>> {
        let conn = self.connection.get_or_try_init(Connection::system).await?;
        let om = ObjectManagerProxy::builder(conn)
            .destination("org.bluez")?
            .path("/")?
            .build()
            .await?;

        let objects = om.get_managed_objects().await?;

        for (path, ifaces) in objects {
            let mut device = None;
            let mut battery = None;
            for (iface, props) in &ifaces {
                match iface.as_str() {
                    "org.bluez.Device1" => device = Some(props),
                    "org.bluez.Battery1" => battery = Some(props),
                    _ => {}
                }
            }
            let (Some(device), Some(battery)) = (device, battery) else {
                continue;
            };

            let Some(name) = get_string(device, "Alias").or_else(|| get_string(device, "Name"))
            else {
                continue;
            };
            if !name_matches(&name, name_hint) {
                continue;
            }
            match get_u8(battery, "Percentage").and_then(Percent::new) {
                Some(percent) => return Ok(Some((percent, name))),
                None => debug!("{} ({}) reports no usable Percentage", name, path.as_str()),
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl DeviceStore for HostDeviceStore {
    async fn read_battery(&self, name_hint: &str) -> FallbackResult {
        match self.read_bluez(name_hint).await {
            Ok(Some((percent, name))) => {
                info!("BlueZ battery: {} ({})", percent, name);
                return FallbackResult::Success(percent, name);
            }
            Ok(None) => debug!("BlueZ knows no battery for {:?}", name_hint),
            Err(err) => debug!("BlueZ query failed: {}", err),
        }

        let root = self.power_supply_root.clone();
        let hint = name_hint.to_string();
        let scanned = tokio::task::spawn_blocking(move || read_power_supply(&root, &hint)).await;
        let Ok(scanned) = scanned else {
            warn!("power_supply scan for {:?} did not complete", name_hint);
            return FallbackResult::Unavailable;
        };

        match scanned {
            Ok(Some((percent, name))) => {
                info!("power_supply battery: {} ({})", percent, name);
                FallbackResult::Success(percent, name)
            }
            Ok(None) => {
                debug!("No power_supply entry for {:?}", name_hint);
                FallbackResult::Unavailable
            }
            Err(err) => {
                debug!("Reading {} failed: {}", self.power_supply_root.display(), err);
                FallbackResult::Unavailable
            }
        }
    }
}

fn get_string(props: &HashMap<String, OwnedValue>, key: &str) -> Option<String> {
    props
        .get(key)
        .and_then(|v| <&str>::try_from(v).ok())
        .map(str::to_owned)
}

fn get_u8(props: &HashMap<String, OwnedValue>, key: &str) -> Option<u8> {
    props.get(key).and_then(|v| u8::try_from(v).ok())
}

/// Find a power_supply entry whose `model_name` matches and read its
/// `capacity`. HID++ receivers expose paired mice this way.
pub fn read_power_supply(root: &Path, name_hint: &str) -> std::io::Result<Option<(Percent, String)>> {
    for entry in fs::read_dir(root)? {
        let dir = match entry {
            Ok(entry) => entry.path(),
            Err(err) => {
                debug!("Skipping unreadable power_supply entry: {}", err);
                continue;
            }
        };

        let Ok(model) = fs::read_to_string(dir.join("model_name")) else {
            continue;
        };
        let model = model.trim();
        if !name_matches(model, name_hint) {
            continue;
        }
        // Host batteries are scope=System; peripherals are scope=Device.
        if let Ok(scope) = fs::read_to_string(dir.join("scope")) {
            if scope.trim().eq_ignore_ascii_case("system") {
                continue;
            }
        }

        let Ok(capacity) = fs::read_to_string(dir.join("capacity")) else {
            continue;
        };
        if let Some(percent) = parse_capacity(&capacity) {
            return Ok(Some((percent, model.to_string())));
        }
    }

    Ok(None)
}

fn parse_capacity(text: &str) -> Option<Percent> {
    text.trim().parse::<u8>().ok().and_then(Percent::new)
}
