use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tracing::{debug, info, warn};

// Time allowed for the DISCONNECT packet to leave after a successful publish.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

use crate::config::Config;
use crate::error::{Result, UplinkError};
use crate::wifi::{hardware_identity, WifiDriver};

/// Sensor coordinates that namespace every published topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorIdentity {
    pub uuid: String,
    pub name: String,
    pub bucket: String,
    pub ip_address: String,
}

impl SensorIdentity {
    /// The uuid comes from the config, else from the upload interface's MAC.
    /// Without either the sensor cannot tell which targeted downlinks are
    /// its own, so this is a configuration error.
    pub async fn resolve(config: &Config, wifi: &dyn WifiDriver) -> Result<Self> {
        let uuid = config
            .sensor_uuid
            .clone()
            .filter(|uuid| !uuid.trim().is_empty())
            .or_else(|| hardware_identity(&config.upload_interface))
            .ok_or_else(|| {
                UplinkError::NotConfigured(format!(
                    "no sensor_uuid and no hardware address on {}",
                    config.upload_interface
                ))
            })?;

        let ip_address = match &config.ip_address {
            Some(ip) => ip.clone(),
            None => match wifi.ipv4_address(&config.upload_interface).await {
                Ok(Some(ip)) => ip,
                Ok(None) => "unknown".to_string(),
                Err(e) => {
                    warn!(error = %e, "Could not read upload interface address");
                    "unknown".to_string()
                }
            },
        };

        Ok(Self {
            uuid,
            name: config.sensor_name.clone(),
            bucket: config.bucket.clone(),
            ip_address,
        })
    }
}

pub fn detections_topic(prefix: &str, identity: &SensorIdentity) -> String {
    topic(prefix, "numdetections", identity)
}

pub fn location_topic(prefix: &str, identity: &SensorIdentity) -> String {
    topic(prefix, "sensorLocation", identity)
}

fn topic(prefix: &str, kind: &str, identity: &SensorIdentity) -> String {
    format!(
        "{}/{kind}/{}/{}/{}/{}",
        prefix.trim_end_matches('/'),
        identity.bucket,
        identity.ip_address,
        identity.name,
        identity.uuid
    )
}

/// Delivers one message and reports whether the broker acknowledged it.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// QoS 1 publisher; a fresh broker session per message, as a reporting cycle
/// only ever sends a handful.
pub struct MqttPublisher {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    ack_timeout: Duration,
}

impl MqttPublisher {
    pub fn from_config(config: &Config) -> Self {
        let credentials = config
            .mqtt_username
            .clone()
            .map(|user| (user, config.mqtt_password.clone().unwrap_or_default()));
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            credentials,
            ack_timeout: Duration::from_secs(config.mqtt_ack_timeout_secs),
        }
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!("crowd-sensor-{}", rand::random::<u16>());
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user.clone(), password.clone());
        }
        options
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 10);
        client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| UplinkError::PublishFailed(e.to_string()))?;

        let wait_for_ack = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack)))
                        if ack.code != ConnectReturnCode::Success =>
                    {
                        return Err(UplinkError::PublishFailed(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        debug!(pkid = ack.pkid, "PubAck received");
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => return Err(UplinkError::PublishFailed(e.to_string())),
                }
            }
        };

        let result = tokio::time::timeout(self.ack_timeout, wait_for_ack)
            .await
            .unwrap_or_else(|_| {
                Err(UplinkError::PublishFailed(format!(
                    "no acknowledgment within {} seconds",
                    self.ack_timeout.as_secs()
                )))
            });

        // A failed session is simply dropped; only a live one is closed cleanly.
        if result.is_ok() {
            info!(topic, bytes = payload.len(), "Message acknowledged by broker");
            close_session(&client, &mut eventloop).await;
        }
        result
    }
}

/// Queues a DISCONNECT and polls the event loop until it has been written.
async fn close_session(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        debug!(error = %e, "Could not queue broker disconnect");
        return;
    }
    let flush = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    };
    match tokio::time::timeout(DISCONNECT_GRACE, flush).await {
        Ok(true) => debug!("Broker session closed"),
        _ => debug!("Broker session dropped without a clean disconnect"),
    }
}
