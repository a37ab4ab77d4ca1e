use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral runtime status for `/status` and `/health`. Nothing here is
/// persisted; the store is the source of truth for device state.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub messages_ok: u64,
    pub messages_failed: u64,
    pub commands_sent: u64,
    pub commands_failed: u64,
    pub devices: HashMap<String, DeviceActivity>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct DeviceActivity {
    #[serde(with = "time::serde::rfc3339")]
    pub last_message: OffsetDateTime,
    pub last_temperature: Option<f64>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Control,
    Retention,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub success: bool,
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub messages_ok: u64,
    pub messages_failed: u64,
    pub commands_sent: u64,
    pub commands_failed: u64,
    pub devices: HashMap<String, DeviceActivity>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            messages_ok: 0,
            messages_failed: 0,
            commands_sent: 0,
            commands_failed: 0,
            devices: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a successfully ingested telemetry message.
    pub fn record_telemetry(&mut self, device_id: &str, temperature: Option<f64>) {
        let now = OffsetDateTime::now_utc();
        self.messages_ok += 1;

        let entry = self
            .devices
            .entry(device_id.to_string())
            .or_insert(DeviceActivity {
                last_message: now,
                last_temperature: None,
            });
        entry.last_message = now;
        if temperature.is_some() {
            entry.last_temperature = temperature;
        }

        let detail = match temperature {
            Some(t) => format!("{device_id}: {t:.1}°C"),
            None => format!("{device_id}: state update"),
        };
        self.push_event(EventKind::Telemetry, detail);
    }

    /// Record a discarded telemetry message.
    pub fn record_rejected(&mut self, topic: &str, reason: String) {
        self.messages_failed += 1;
        self.push_event(EventKind::Error, format!("{topic}: {reason}"));
    }

    /// Record the outcome of a control dispatch.
    pub fn record_control(&mut self, device_id: &str, detail: &str, ok: bool) {
        if ok {
            self.commands_sent += 1;
            self.push_event(EventKind::Control, format!("{device_id}: {detail}"));
        } else {
            self.commands_failed += 1;
            self.push_event(
                EventKind::Error,
                format!("{device_id}: {detail} not sent"),
            );
        }
    }

    pub fn record_retention(&mut self, detail: String) {
        self.push_event(EventKind::Retention, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            success: true,
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            messages_ok: self.messages_ok,
            messages_failed: self.messages_failed,
            commands_sent: self.commands_sent,
            commands_failed: self.commands_failed,
            devices: self.devices.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}
