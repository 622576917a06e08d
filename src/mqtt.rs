use std::time::{Duration, SystemTime};

use futures::StreamExt as _;
use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;

use crate::config;
use crate::messages::{AlertEvent, Severity};
use crate::reading::{BatteryReading, Source, Status};
use crate::scheduler::SchedulerHandle;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct StateMqttMessage<'a> {
    name: &'a str,
    battery: Option<u8>,
    status: Status,
    source: Source,
    stale: bool,
    /// Seconds since the Unix epoch
    observed_at: u64,
}

#[derive(Debug, Serialize)]
struct AlertMqttMessage<'a> {
    name: &'a str,
    battery: Option<u8>,
    threshold: u8,
    severity: Severity,
}

impl<'a> From<&'a BatteryReading> for StateMqttMessage<'a> {
    fn from(reading: &'a BatteryReading) -> Self {
        StateMqttMessage {
            name: &reading.device_name,
            battery: reading.percent.map(|p| p.value()),
            status: reading.status(),
            source: reading.source,
            stale: reading.stale,
            observed_at: reading
                .observed_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

/// Incoming command topics, relative to the topic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandTopic {
    Refresh,
    Rescan,
}

fn parse_command_topic(topic: &str) -> Option<CommandTopic> {
    match topic.rsplit('/').next()? {
        "refresh" => Some(CommandTopic::Refresh),
        "rescan" => Some(CommandTopic::Rescan),
        _ => None,
    }
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "battery-monitor-rs".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("battery".to_string()),
            },
            eventloop,
        )
    }

    fn topic(&self, leaf: &str) -> String {
        format!("{}/{}/{}", self.topic_path, self.publisher_id, leaf)
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(format!("{}/refresh", self.topic_path), QoS::AtMostOnce),
                SubscribeFilter::new(format!("{}/rescan", self.topic_path), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    /// Drive the connection, forwarding command topics to the scheduler.
    pub async fn event_loop(&self, eventloop: &mut rumqttc::EventLoop, scheduler: SchedulerHandle) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        match parse_command_topic(&p.topic) {
                            Some(CommandTopic::Refresh) => scheduler.refresh(),
                            Some(CommandTopic::Rescan) => {
                                if let Err(err) = scheduler.rescan().await {
                                    error!("Error requesting rescan: {:?}", err);
                                }
                            }
                            None => debug!("Ignoring topic {}", p.topic),
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn announce_reading(&self, reading: &BatteryReading) -> anyhow::Result<()> {
        debug!("Announcing {} on MQTT", reading);
        let payload = serde_json::to_string(&StateMqttMessage::from(reading))?;
        self.client
            .publish(self.topic("state"), QoS::AtLeastOnce, true, payload)
            .await?;
        Ok(())
    }

    pub async fn announce_alert(&self, event: &AlertEvent) -> anyhow::Result<()> {
        info!(
            "Announcing {:?} alert for {} on MQTT",
            event.severity, event.reading.device_name
        );
        let message = AlertMqttMessage {
            name: &event.reading.device_name,
            battery: event.reading.percent.map(|p| p.value()),
            threshold: event.threshold,
            severity: event.severity,
        };
        self.client
            .publish(
                self.topic("alert"),
                QoS::AtLeastOnce,
                false,
                serde_json::to_string(&message)?,
            )
            .await?;
        Ok(())
    }

    /// Publish every new reading and alert until the scheduler goes away.
    pub async fn publish_loop(&self, scheduler: SchedulerHandle) {
        let mut readings = scheduler.readings();
        let mut alerts = Box::pin(scheduler.alerts());
        loop {
            tokio::select! {
                changed = readings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let reading = readings.borrow_and_update().clone();
                    if let Err(err) = self.announce_reading(&reading).await {
                        error!("Error announcing reading: {:?}", err);
                    }
                }
                Some(event) = alerts.next() => {
                    if let Err(err) = self.announce_alert(&event).await {
                        error!("Error announcing alert: {:?}", err);
                    }
                }
                else => break,
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}
