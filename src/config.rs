use std::path::PathBuf;
use std::time::Duration;

use mac_address::MacAddress;
use serde_derive::Deserialize;

pub const DEFAULT_KEYWORDS: [&str; 3] = ["MX Anywhere", "MX Master", "Logitech"];
pub const DEFAULT_THRESHOLDS: [u8; 3] = [20, 10, 5];

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    pub device: Option<DeviceConfig>,
    pub poll: Option<PollConfig>,
    pub alerts: Option<AlertConfig>,
    pub cache: Option<CacheConfig>,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DeviceConfig {
    /// Case-insensitive substrings matched against advertised names
    pub keywords: Option<Vec<String>>,
    /// Pinned address, used to seed an empty cache
    pub address: Option<MacAddress>,
    pub name: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PollConfig {
    pub interval_seconds: Option<u64>,
    pub scan_timeout_seconds: Option<u64>,
    pub connect_timeout_seconds: Option<u64>,
    pub fallback_timeout_seconds: Option<u64>,
    pub failure_limit: Option<u32>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AlertConfig {
    pub thresholds: Option<Vec<u8>>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct CacheConfig {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

impl AppConfig {
    pub fn keywords(&self) -> Vec<String> {
        self.device
            .as_ref()
            .and_then(|d| d.keywords.clone())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect())
    }

    pub fn device_name(&self) -> Option<String> {
        self.device.as_ref().and_then(|d| d.name.clone())
    }

    pub fn pinned_address(&self) -> Option<MacAddress> {
        self.device.as_ref().and_then(|d| d.address)
    }

    pub fn poll(&self) -> PollConfig {
        self.poll.clone().unwrap_or_default()
    }

    /// Thresholds in descending order, deduplicated, clamped to 0..=100.
    pub fn thresholds(&self) -> Vec<u8> {
        let mut thresholds = self
            .alerts
            .as_ref()
            .and_then(|a| a.thresholds.clone())
            .unwrap_or_else(|| DEFAULT_THRESHOLDS.to_vec());
        thresholds.retain(|t| *t <= 100);
        thresholds.sort_unstable_by(|a, b| b.cmp(a));
        thresholds.dedup();
        thresholds
    }

    pub fn cache_path(&self) -> Option<PathBuf> {
        self.cache
            .as_ref()
            .and_then(|c| c.path.clone())
            .or_else(default_cache_path)
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.unwrap_or(300).max(1))
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_seconds.unwrap_or(8))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds.unwrap_or(5))
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_timeout_seconds.unwrap_or(5))
    }

    pub fn failure_limit(&self) -> u32 {
        self.failure_limit.unwrap_or(3).max(1)
    }

    /// A reading older than twice the polling interval is stale.
    pub fn stale_after(&self) -> Duration {
        self.interval() * 2
    }
}

fn default_cache_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))?;
    Some(base.join("battery-monitor-rs").join("cache.json"))
}
