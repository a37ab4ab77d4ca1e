use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::{Error, Result};
use crate::state::SharedState;

/// Wildcard subscription covering every device's telemetry topic.
pub const TELEMETRY_TOPIC_FILTER: &str = "device/+";

/// Capacity of the rumqttc request channel (outgoing publishes/subscribes).
const REQUEST_CAPACITY: usize = 64;

/// Pause before polling again after a connection error.
const RECONNECT_DELAY_SEC: u64 = 2;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Telemetry published by a device on `device/<device_id>`. Every key is
/// optional; absent keys leave the stored device state untouched.
#[derive(Debug, Default, Deserialize, PartialEq)]
pub(crate) struct TelemetryMsg {
    pub(crate) device_id: Option<String>,
    pub(crate) temperature: Option<f64>,
    pub(crate) fan: Option<bool>,
    pub(crate) auto: Option<bool>,
    /// Device-side clock in millis. Accepted, not trusted.
    #[allow(dead_code)]
    pub(crate) timestamp: Option<i64>,
}

/// Command published on `control/<device_id>`. Serialises to a JSON object
/// with exactly one key: `{"fan":true}` or `{"auto":false}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    Fan(bool),
    Auto(bool),
}

/// A raw publish received from the broker, queued for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Device id from the last segment of a topic such as "device/<device_id>".
pub(crate) fn device_id_from_topic(topic: &str) -> Option<&str> {
    topic.rsplit('/').next().filter(|s| !s.is_empty())
}

pub(crate) fn control_topic(device_id: &str) -> String {
    format!("control/{device_id}")
}

/// Decode a telemetry payload: UTF-8 text holding a JSON object whose known
/// keys have the expected types. Unknown keys are ignored.
pub(crate) fn decode_telemetry(payload: &[u8]) -> Result<TelemetryMsg> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::Decode(format!("payload is not utf-8: {e}")))?;
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Error::Decode(format!("invalid json: {e}")))?;
    if !value.is_object() {
        return Err(Error::Decode("payload is not a json object".to_string()));
    }
    serde_json::from_value(value).map_err(|e| Error::Decode(format!("bad telemetry field: {e}")))
}

pub(crate) fn encode_command(command: ControlCommand) -> Vec<u8> {
    // A unit-free enum of bools cannot fail to serialise.
    serde_json::to_vec(&command).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Publisher seam
// ---------------------------------------------------------------------------

/// Outbound side of the gateway, as seen by the control dispatcher.
pub trait ControlPublisher: Send + Sync {
    /// Publish `command` to `control/<device_id>`. Returns whether the client
    /// accepted the message for sending; delivery is not confirmed.
    fn publish_control(
        &self,
        device_id: &str,
        command: ControlCommand,
    ) -> impl Future<Output = bool> + Send;
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MqttGateway {
    client: AsyncClient,
    /// Broker session is up. Set on ConnAck, cleared on disconnect or error.
    connected: Arc<AtomicBool>,
}

impl MqttGateway {
    /// Build the client. Nothing goes over the wire until the returned event
    /// loop is polled (see [`run_event_loop`]).
    pub fn connect(cfg: &MqttConfig) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_sec));
        if let Some(username) = &cfg.username {
            options.set_credentials(username.clone(), cfg.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let gateway = Self {
            client,
            connected: Arc::new(AtomicBool::new(false)),
        };
        (gateway, eventloop)
    }

    pub(crate) fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue the wildcard telemetry subscription. Non-blocking so it can be
    /// issued from inside the event loop on every ConnAck.
    fn subscribe_telemetry(&self) -> Result<()> {
        self.client
            .try_subscribe(TELEMETRY_TOPIC_FILTER, QoS::AtLeastOnce)
            .map_err(|e| {
                error!("subscribe {TELEMETRY_TOPIC_FILTER} failed: {e}");
                Error::Publish {
                    topic: TELEMETRY_TOPIC_FILTER.to_string(),
                }
            })
    }

    pub async fn close(&self) {
        self.set_connected(false);
        match self.client.disconnect().await {
            Ok(()) => info!("mqtt disconnect requested"),
            Err(e) => warn!("mqtt disconnect failed: {e}"),
        }
    }
}

impl ControlPublisher for MqttGateway {
    /// Refused while the broker session is down; never waits on a full
    /// request channel.
    async fn publish_control(&self, device_id: &str, command: ControlCommand) -> bool {
        let topic = control_topic(device_id);
        if !self.is_connected() {
            warn!(device = %device_id, ?command, "publish to {topic} refused: broker not connected");
            return false;
        }

        match self
            .client
            .try_publish(topic.as_str(), QoS::AtMostOnce, false, encode_command(command))
        {
            Ok(()) => {
                debug!(device = %device_id, ?command, "control published to {topic}");
                true
            }
            Err(e) => {
                warn!(device = %device_id, ?command, "publish to {topic} rejected: {e}");
                false
            }
        }
    }
}

/// Hand an inbound publish to the ingestion queue without blocking the event
/// loop. A full queue drops the message.
pub(crate) fn forward(tx: &mpsc::Sender<InboundMessage>, msg: InboundMessage) -> bool {
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            warn!(topic = %msg.topic, "ingest queue full, dropping telemetry");
            false
        }
        Err(TrySendError::Closed(msg)) => {
            error!(topic = %msg.topic, "ingest queue closed, dropping telemetry");
            false
        }
    }
}

/// Drive the broker connection. rumqttc reconnects on the next poll after an
/// error; the subscription is re-issued on every ConnAck because sessions are
/// clean. Returns once the ingestion side has gone away.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    gateway: MqttGateway,
    tx: mpsc::Sender<InboundMessage>,
    shared: SharedState,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                debug!(topic = %p.topic, bytes = p.payload.len(), "telemetry received");
                let msg = InboundMessage {
                    topic: p.topic.clone(),
                    payload: p.payload.to_vec(),
                };
                if !forward(&tx, msg) && tx.is_closed() {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected, subscribing to {TELEMETRY_TOPIC_FILTER}");
                gateway.set_connected(true);
                let subscribed = gateway.subscribe_telemetry().is_ok();
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
                if !subscribed {
                    st.record_error(format!("subscribe {TELEMETRY_TOPIC_FILTER} failed"));
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected by broker");
                gateway.set_connected(false);
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                gateway.set_connected(false);
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                if tx.is_closed() {
                    return;
                }
                sleep(Duration::from_secs(RECONNECT_DELAY_SEC)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
