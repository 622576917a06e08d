use std::fmt;
use std::time::{Duration, SystemTime};

use serde_derive::{Deserialize, Serialize};

/// Battery charge in percent, always within 0..=100.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Percent(u8);

impl Percent {
    pub fn new(value: u8) -> Option<Self> {
        (value <= 100).then_some(Percent(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Percent {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Percent::new(value).ok_or_else(|| format!("battery level {value} is out of range"))
    }
}

impl From<Percent> for u8 {
    fn from(percent: Percent) -> u8 {
        percent.0
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    LowEnergy,
    Fallback,
    Cached,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Status {
    Good,
    Ok,
    Low,
    Critical,
    Unknown,
}

impl Status {
    pub fn from_percent(percent: Option<Percent>) -> Self {
        match percent.map(Percent::value) {
            None => Status::Unknown,
            Some(p) if p > 30 => Status::Good,
            Some(p) if p > 20 => Status::Ok,
            Some(p) if p > 10 => Status::Low,
            Some(_) => Status::Critical,
        }
    }
}

/// One cycle's result. Never mutated; the next cycle supersedes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    pub percent: Option<Percent>,
    pub device_name: String,
    pub source: Source,
    pub observed_at: SystemTime,
    pub stale: bool,
}

impl BatteryReading {
    pub fn fresh(percent: Percent, device_name: String, source: Source, at: SystemTime) -> Self {
        BatteryReading {
            percent: Some(percent),
            device_name,
            source,
            observed_at: at,
            stale: false,
        }
    }

    pub fn unknown(device_name: String, at: SystemTime) -> Self {
        BatteryReading {
            percent: None,
            device_name,
            source: Source::None,
            observed_at: at,
            stale: false,
        }
    }

    /// The same observation re-issued as last known good. `observed_at` is
    /// kept so the age keeps growing across repeated failures.
    pub fn as_stale(&self) -> Self {
        BatteryReading {
            source: Source::Cached,
            stale: true,
            ..self.clone()
        }
    }

    pub fn age_at(&self, now: SystemTime) -> Duration {
        now.duration_since(self.observed_at).unwrap_or_default()
    }

    pub fn is_fresh_source(&self) -> bool {
        matches!(self.source, Source::LowEnergy | Source::Fallback)
    }

    pub fn status(&self) -> Status {
        Status::from_percent(self.percent)
    }
}

impl fmt::Display for BatteryReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.percent {
            Some(percent) => write!(f, "{}: {} ({:?} ", self.device_name, percent, self.status())?,
            None => write!(f, "{}: unknown (", self.device_name)?,
        }
        write!(f, "via {:?}", self.source)?;
        if self.stale {
            write!(f, ", stale")?;
        }
        write!(f, ")")
    }
}
