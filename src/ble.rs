use std::pin::Pin;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{BDAddr, Central as _, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt as _};
use log::{debug, info, warn};
use mac_address::MacAddress;
use tokio::time::{Instant, timeout, timeout_at};
use uuid::Uuid;

use crate::cache::DeviceIdentity;
use crate::identity::{Discovered, Scanner, matches_keywords};
use crate::reading::Percent;

pub const BATTERY_SERVICE: Uuid = uuid_from_u16(0x180F);
pub const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2A19);

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LowEnergyResult {
    Success(Percent),
    /// The peripheral could not be reached within the timeout.
    Unavailable(String),
    /// Connected, but the exchange failed.
    Error(String),
}

#[async_trait]
pub trait LowEnergyReader: Send + Sync {
    async fn read_battery(&self, identity: &DeviceIdentity, timeout: Duration) -> LowEnergyResult;
}

#[async_trait]
impl<T: LowEnergyReader + ?Sized> LowEnergyReader for std::sync::Arc<T> {
    async fn read_battery(&self, identity: &DeviceIdentity, timeout: Duration) -> LowEnergyResult {
        (**self).read_battery(identity, timeout).await
    }
}

pub fn to_mac(address: BDAddr) -> MacAddress {
    MacAddress::new(address.into_inner())
}

pub fn to_bdaddr(address: MacAddress) -> BDAddr {
    BDAddr::from(address.bytes())
}

/// Interpret the Battery Level characteristic value: one unsigned byte.
pub fn parse_battery_level(value: &[u8]) -> Result<Percent, String> {
    let byte = *value
        .first()
        .ok_or_else(|| "empty battery level value".to_string())?;
    Percent::new(byte).ok_or_else(|| format!("battery level {byte} is out of range"))
}

#[derive(Clone)]
pub struct BleTransport {
    adapter: Adapter,
}

impl BleTransport {
    /// Use the first Bluetooth adapter on the system.
    pub async fn first_adapter() -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        info!("Using adapter {}", adapter.adapter_info().await?);
        Ok(BleTransport { adapter })
    }

    async fn first_match(
        &self,
        events: &mut Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
        keywords: &[String],
    ) -> anyhow::Result<Option<Discovered>> {
        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let peripheral = self.adapter.peripheral(&id).await?;
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            let Some(name) = properties.local_name else {
                continue;
            };
            debug!("DeviceDiscovered: {:?} Name: {}", id, name);
            if matches_keywords(&name, keywords) {
                return Ok(Some(Discovered {
                    address: to_mac(properties.address),
                    name,
                }));
            }
        }
        Ok(None)
    }

    async fn find_peripheral(&self, address: BDAddr) -> anyhow::Result<Option<Peripheral>> {
        Ok(self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address() == address))
    }
}

#[async_trait]
impl Scanner for BleTransport {
    async fn discover(
        &self,
        keywords: &[String],
        window: Duration,
    ) -> anyhow::Result<Option<Discovered>> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let found = timeout(window, self.first_match(&mut events, keywords)).await;

        if let Err(err) = self.adapter.stop_scan().await {
            warn!("Error stopping scan: {:?}", err);
        }
        match found {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl LowEnergyReader for BleTransport {
    async fn read_battery(&self, identity: &DeviceIdentity, timeout: Duration) -> LowEnergyResult {
        let address = to_bdaddr(identity.address);
        match self.find_peripheral(address).await {
            Ok(Some(peripheral)) => read_within(peripheral, timeout).await,
            Ok(None) => LowEnergyResult::Unavailable(format!("{address} is not known to the adapter")),
            Err(err) => LowEnergyResult::Unavailable(format!("listing peripherals: {err}")),
        }
    }
}

/// Stands in for [`BleTransport`] on hosts without a Bluetooth adapter, so
/// every cycle goes straight to the device store.
pub struct NoAdapter;

#[async_trait]
impl Scanner for NoAdapter {
    async fn discover(
        &self,
        _keywords: &[String],
        _window: Duration,
    ) -> anyhow::Result<Option<Discovered>> {
        Ok(None)
    }
}

#[async_trait]
impl LowEnergyReader for NoAdapter {
    async fn read_battery(&self, _identity: &DeviceIdentity, _timeout: Duration) -> LowEnergyResult {
        LowEnergyResult::Unavailable("no Bluetooth adapter".to_string())
    }
}

/// The steps of one direct read against a single peripheral.
#[async_trait]
trait BatteryLink: Send + Sync + 'static {
    fn label(&self) -> String;
    async fn connect(&self) -> anyhow::Result<()>;
    async fn read_level(&self) -> anyhow::Result<Percent>;
    async fn disconnect(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl BatteryLink for Peripheral {
    fn label(&self) -> String {
        self.address().to_string()
    }

    async fn connect(&self) -> anyhow::Result<()> {
        Ok(btleplug::api::Peripheral::connect(self).await?)
    }

    async fn read_level(&self) -> anyhow::Result<Percent> {
        btleplug::api::Peripheral::discover_services(self).await?;
        let characteristic = btleplug::api::Peripheral::characteristics(self)
            .into_iter()
            .find(|c| c.service_uuid == BATTERY_SERVICE && c.uuid == BATTERY_LEVEL)
            .ok_or_else(|| anyhow!("battery service not found"))?;
        let value = btleplug::api::Peripheral::read(self, &characteristic).await?;
        parse_battery_level(&value).map_err(|detail| anyhow!(detail))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(btleplug::api::Peripheral::disconnect(self).await?)
    }
}

/// Connect, read and disconnect, with connect and read sharing one deadline.
async fn read_within<P: BatteryLink>(link: P, limit: Duration) -> LowEnergyResult {
    let deadline = Instant::now() + limit;
    let connection = ConnectionGuard::new(link);
    let result = read_connected(&connection, deadline, limit).await;
    connection.release().await;
    result
}

async fn read_connected<P: BatteryLink>(
    connection: &ConnectionGuard<P>,
    deadline: Instant,
    limit: Duration,
) -> LowEnergyResult {
    let Some(link) = connection.link() else {
        return LowEnergyResult::Unavailable("connection already released".to_string());
    };

    debug!("Connecting to {}", link.label());
    match timeout_at(deadline, link.connect()).await {
        Err(_) => return LowEnergyResult::Unavailable(format!("connect timed out after {limit:?}")),
        Ok(Err(err)) => return LowEnergyResult::Unavailable(format!("connect failed: {err:#}")),
        Ok(Ok(())) => {}
    }

    match timeout_at(deadline, link.read_level()).await {
        Err(_) => LowEnergyResult::Error(format!("read not finished within {limit:?}")),
        Ok(Err(err)) => LowEnergyResult::Error(format!("{err:#}")),
        Ok(Ok(percent)) => {
            info!("BLE battery: {}", percent);
            LowEnergyResult::Success(percent)
        }
    }
}

/// Holds a link for the duration of one read and disconnects it on every
/// exit path. When the owning future is dropped mid-read the disconnect is
/// spawned onto the runtime.
struct ConnectionGuard<P: BatteryLink> {
    link: Option<P>,
}

impl<P: BatteryLink> ConnectionGuard<P> {
    fn new(link: P) -> Self {
        ConnectionGuard { link: Some(link) }
    }

    fn link(&self) -> Option<&P> {
        self.link.as_ref()
    }

    async fn release(mut self) {
        if let Some(link) = self.link.take() {
            disconnect(link).await;
        }
    }
}

impl<P: BatteryLink> Drop for ConnectionGuard<P> {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(disconnect(link));
            }
            Err(_) => warn!("No runtime to release connection to {}", link.label()),
        }
    }
}

async fn disconnect<P: BatteryLink>(link: P) {
    match timeout(DISCONNECT_TIMEOUT, link.disconnect()).await {
        Ok(Ok(())) => debug!("Disconnected from {}", link.label()),
        Ok(Err(err)) => debug!("Disconnect from {} failed: {:#}", link.label(), err),
        Err(_) => warn!("Disconnect from {} timed out", link.label()),
    }
}
