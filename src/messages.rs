use serde_derive::Serialize;
use tokio::sync::oneshot;

use crate::reading::BatteryReading;

#[derive(Debug)]
pub enum Command {
    /// Run a cycle now. The reply, if any, receives the cycle's reading.
    Refresh(Option<oneshot::Sender<BatteryReading>>),
    /// Forget the cached identity and rediscover on the next cycle.
    Rescan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Severity {
    Low,
    VeryLow,
    Critical,
}

impl Severity {
    pub fn for_threshold(threshold: u8) -> Self {
        match threshold {
            t if t <= 5 => Severity::Critical,
            t if t <= 10 => Severity::VeryLow,
            _ => Severity::Low,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertEvent {
    pub threshold: u8,
    pub severity: Severity,
    pub reading: BatteryReading,
}
