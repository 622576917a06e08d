use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context as _;
use log::{debug, info, warn};
use mac_address::MacAddress;
use serde_derive::{Deserialize, Serialize};

use crate::reading::BatteryReading;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub address: MacAddress,
    pub resolved_at: SystemTime,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct CacheContents {
    device: Option<DeviceIdentity>,
    last_reading: Option<BatteryReading>,
}

/// Device address and last reading, persisted as JSON.
///
/// Constructed once at startup and passed explicitly to whoever needs it.
/// A store without a path keeps everything in memory.
#[derive(Debug)]
pub struct CacheStore {
    path: Option<PathBuf>,
    contents: CacheContents,
}

impl CacheStore {
    pub fn in_memory() -> Self {
        CacheStore {
            path: None,
            contents: CacheContents::default(),
        }
    }

    /// Load from `path`. A missing or unreadable file yields an empty cache.
    pub fn load(path: PathBuf) -> Self {
        let contents = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                warn!("Ignoring corrupt cache file {}: {}", path.display(), err);
                CacheContents::default()
            }),
            Err(err) => {
                debug!("No cache loaded from {}: {}", path.display(), err);
                CacheContents::default()
            }
        };
        CacheStore {
            path: Some(path),
            contents,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn device(&self) -> Option<&DeviceIdentity> {
        self.contents.device.as_ref()
    }

    pub fn last_reading(&self) -> Option<&BatteryReading> {
        self.contents.last_reading.as_ref()
    }

    pub fn set_device(&mut self, identity: DeviceIdentity) {
        info!("Caching device {} [{}]", identity.name, identity.address);
        self.contents.device = Some(identity);
        self.persist();
    }

    pub fn clear_device(&mut self) {
        if self.contents.device.take().is_some() {
            info!("Cleared cached device address");
        }
        self.persist();
    }

    pub fn set_last_reading(&mut self, reading: &BatteryReading) {
        self.contents.last_reading = Some(reading.clone());
        self.persist();
    }

    /// Write failures are logged, never fatal.
    fn persist(&self) {
        if let Err(err) = self.save() {
            warn!("Could not save cache: {:?}", err);
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(&self.contents)?;
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}
