use std::collections::BTreeSet;

use log::debug;

use crate::messages::{AlertEvent, Severity};
use crate::reading::BatteryReading;

/// Tracks which thresholds have already produced a notification.
///
/// A threshold fires once when the level falls to or below it and is armed
/// again only after the level has risen above it.
#[derive(Debug, Clone)]
pub struct AlertState {
    thresholds: Vec<u8>,
    notified: BTreeSet<u8>,
}

impl AlertState {
    pub fn new(mut thresholds: Vec<u8>) -> Self {
        thresholds.sort_unstable_by(|a, b| b.cmp(a));
        thresholds.dedup();
        AlertState {
            thresholds,
            notified: BTreeSet::new(),
        }
    }

    pub fn last_notified_threshold(&self) -> Option<u8> {
        self.notified.first().copied()
    }

    /// Feed the next reading. Returns at most one event: when several
    /// thresholds are crossed at once they are all marked and only the most
    /// severe one is reported.
    pub fn observe(&mut self, reading: &BatteryReading) -> Option<AlertEvent> {
        let level = reading.percent?.value();

        let before = self.notified.len();
        self.notified.retain(|&threshold| level <= threshold);
        if self.notified.len() != before {
            debug!("Battery recovered to {level}%, re-arming alerts");
        }

        let crossed: Vec<u8> = self
            .thresholds
            .iter()
            .copied()
            .filter(|&threshold| level <= threshold && !self.notified.contains(&threshold))
            .collect();
        self.notified.extend(crossed.iter().copied());

        let threshold = crossed.into_iter().min()?;
        Some(AlertEvent {
            threshold,
            severity: Severity::for_threshold(threshold),
            reading: reading.clone(),
        })
    }
}
