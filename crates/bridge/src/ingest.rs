//! Telemetry ingestion: turns a raw `device/<id>` publish into a device
//! state update and, when the message carries a temperature, a reading.
//!
//! Failures are logged and reported as `false`; nothing propagates back
//! into the MQTT event loop.

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::{Db, Device, SensorReading, TelemetryUpdate};
use crate::error::{Error, Result};
use crate::mqtt::{decode_telemetry, device_id_from_topic, InboundMessage, TelemetryMsg};
use crate::state::SharedState;

pub struct Pipeline {
    db: Db,
    shared: SharedState,
}

#[derive(Debug)]
pub(crate) struct Ingested {
    pub(crate) device: Device,
    pub(crate) reading: Option<SensorReading>,
}

/// A non-empty payload `device_id` wins over the topic suffix and is used
/// verbatim.
pub(crate) fn resolve_device_id(topic: &str, msg: &TelemetryMsg) -> Result<String> {
    msg.device_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .or_else(|| device_id_from_topic(topic))
        .map(str::to_string)
        .ok_or_else(|| Error::Decode(format!("no device id in payload or topic '{topic}'")))
}

impl Pipeline {
    pub fn new(db: Db, shared: SharedState) -> Self {
        Self { db, shared }
    }

    /// Process one inbound message. Returns whether it was stored.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> bool {
        let (device_id, msg) = match decode_telemetry(payload)
            .and_then(|msg| Ok((resolve_device_id(topic, &msg)?, msg)))
        {
            Ok(resolved) => resolved,
            Err(e) => {
                let device = device_id_from_topic(topic).unwrap_or("?");
                return self.reject(topic, device, e).await;
            }
        };

        match self.store(&device_id, &msg).await {
            Ok(Ingested { device, reading }) => {
                debug!(
                    device = %device.id,
                    temperature = ?device.last_temperature,
                    fan = device.fan_status,
                    auto = device.auto_mode,
                    reading = reading.is_some(),
                    "telemetry processed"
                );
                let mut st = self.shared.write().await;
                st.record_telemetry(&device.id, reading.map(|r| r.temperature));
                true
            }
            Err(e) => self.reject(topic, &device_id, e).await,
        }
    }

    async fn reject(&self, topic: &str, device: &str, e: Error) -> bool {
        warn!(topic = %topic, device = %device, "telemetry discarded: {e}");
        let mut st = self.shared.write().await;
        st.record_rejected(topic, e.to_string());
        false
    }

    async fn store(&self, device_id: &str, msg: &TelemetryMsg) -> Result<Ingested> {
        let update = TelemetryUpdate {
            temperature: msg.temperature,
            fan: msg.fan,
            auto: msg.auto,
        };

        let (device, reading) = self
            .db
            .apply_telemetry(device_id, &update, OffsetDateTime::now_utc())
            .await?;

        Ok(Ingested { device, reading })
    }
}

/// Drain the gateway queue until every sender is gone.
pub async fn run(pipeline: Pipeline, mut rx: mpsc::Receiver<InboundMessage>) {
    info!("ingestion pipeline started");
    while let Some(msg) = rx.recv().await {
        pipeline.handle_message(&msg.topic, &msg.payload).await;
    }
    info!("ingestion queue closed, pipeline stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
