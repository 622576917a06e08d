use std::time::Duration;

use anyhow::anyhow;
use futures::Stream;
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::alerts::AlertState;
use crate::ble::LowEnergyReader;
use crate::device_store::DeviceStore;
use crate::identity::Scanner;
use crate::messages::{AlertEvent, Command};
use crate::orchestrator::Orchestrator;
use crate::reading::BatteryReading;

const COMMAND_QUEUE: usize = 8;
const ALERT_QUEUE: usize = 16;

/// The single worker that owns the orchestrator. Cycles run one at a time.
pub struct Scheduler<S, L, F> {
    orchestrator: Orchestrator<S, L, F>,
    alerts: AlertState,
    interval: Duration,
    commands: mpsc::Receiver<Command>,
    readings: watch::Sender<BatteryReading>,
    events: broadcast::Sender<AlertEvent>,
}

/// Cheap, cloneable access to a running [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    readings: watch::Receiver<BatteryReading>,
    events: broadcast::Sender<AlertEvent>,
}

impl<S, L, F> Scheduler<S, L, F>
where
    S: Scanner,
    L: LowEnergyReader,
    F: DeviceStore,
{
    pub fn new(
        orchestrator: Orchestrator<S, L, F>,
        alerts: AlertState,
        interval: Duration,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let initial = BatteryReading::unknown(orchestrator.device_name(), std::time::SystemTime::now());
        let (reading_tx, reading_rx) = watch::channel(initial);
        let (event_tx, _) = broadcast::channel(ALERT_QUEUE);

        let scheduler = Scheduler {
            orchestrator,
            alerts,
            interval,
            commands: command_rx,
            readings: reading_tx,
            events: event_tx.clone(),
        };
        let handle = SchedulerHandle {
            commands: command_tx,
            readings: reading_rx,
            events: event_tx,
        };
        (scheduler, handle)
    }

    /// Poll on the interval and on request until every handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rerun = false;
        // Waiters queued behind a rescan belong to the cycle that follows it.
        let mut pending = Vec::new();

        loop {
            let mut waiters = std::mem::take(&mut pending);

            if !std::mem::take(&mut rerun) {
                tokio::select! {
                    _ = ticker.tick() => debug!("Scheduled refresh"),
                    command = self.commands.recv() => match command {
                        Some(Command::Refresh(reply)) => {
                            debug!("Manual refresh");
                            waiters.extend(reply);
                        }
                        Some(Command::Rescan) => self.orchestrator.rescan(),
                        None => break,
                    },
                }
            }

            info!("Refreshing battery level");
            let reading = self.orchestrator.acquire().await;
            ticker.reset();

            // Requests that arrived while the cycle was in flight share its
            // result, unless a rescan came in ahead of them.
            while let Ok(command) = self.commands.try_recv() {
                match command {
                    Command::Refresh(reply) if rerun => pending.extend(reply),
                    Command::Refresh(reply) => waiters.extend(reply),
                    Command::Rescan => {
                        self.orchestrator.rescan();
                        rerun = true;
                    }
                }
            }

            self.publish(reading, waiters);
        }
        info!("Scheduler stopped");
    }

    fn publish(&mut self, reading: BatteryReading, waiters: Vec<oneshot::Sender<BatteryReading>>) {
        info!("Battery: {}", reading);

        if let Some(event) = self.alerts.observe(&reading) {
            debug!(
                "Alert at {}%, lowest notified threshold now {:?}",
                event.threshold,
                self.alerts.last_notified_threshold()
            );
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        for waiter in waiters {
            let _ = waiter.send(reading.clone());
        }
        self.readings.send_replace(reading);
    }
}

impl SchedulerHandle {
    /// Ask for a cycle without waiting for it. Dropped when one is already
    /// queued.
    pub fn refresh(&self) {
        match self.commands.try_send(Command::Refresh(None)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => debug!("Refresh already pending"),
            Err(mpsc::error::TrySendError::Closed(_)) => warn!("Scheduler is not running"),
        }
    }

    /// Run a cycle, or join the one in flight, and return its reading.
    pub async fn acquire(&self) -> anyhow::Result<BatteryReading> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Refresh(Some(reply)))
            .await
            .map_err(|_| anyhow!("scheduler is not running"))?;
        response
            .await
            .map_err(|_| anyhow!("scheduler stopped before replying"))
    }

    pub async fn rescan(&self) -> anyhow::Result<()> {
        self.commands
            .send(Command::Rescan)
            .await
            .map_err(|_| anyhow!("scheduler is not running"))
    }

    /// The last computed reading. Never blocks.
    pub fn current_reading(&self) -> BatteryReading {
        self.readings.borrow().clone()
    }

    pub fn readings(&self) -> watch::Receiver<BatteryReading> {
        self.readings.clone()
    }

    /// A new stream of threshold events, starting from now.
    pub fn alerts(&self) -> impl Stream<Item = AlertEvent> + Send + 'static {
        futures::stream::unfold(self.events.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Alert stream lagged by {skipped}");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }
}
