//! Control dispatch: validates an intent, publishes the command to the
//! device, and records it in the control history once the publish has been
//! accepted. A rejected publish leaves no record behind, so the caller can
//! simply retry.

use serde_json::Value;
use tracing::{error, info};

use crate::db::{CommandSource, CommandType, ControlRecord, Db};
use crate::error::{Error, Result};
use crate::mqtt::{control_topic, ControlCommand, ControlPublisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanState {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    Auto,
    Manual,
}

impl FanState {
    /// Accepts `true`/`false` or `"on"`/`"off"` (case-insensitive).
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(true) => Ok(FanState::On),
            Value::Bool(false) => Ok(FanState::Off),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "on" => Ok(FanState::On),
                "off" => Ok(FanState::Off),
                _ => Err(Error::Validation(format!(
                    "invalid status '{s}' (use on/off or a boolean)"
                ))),
            },
            other => Err(Error::Validation(format!(
                "invalid status {other} (use on/off or a boolean)"
            ))),
        }
    }

    pub fn is_on(self) -> bool {
        self == FanState::On
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FanState::On => "on",
            FanState::Off => "off",
        }
    }
}

impl FanMode {
    /// Accepts `true`/`false` (auto/manual) or `"auto"`/`"manual"`.
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(true) => Ok(FanMode::Auto),
            Value::Bool(false) => Ok(FanMode::Manual),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "auto" => Ok(FanMode::Auto),
                "manual" => Ok(FanMode::Manual),
                _ => Err(Error::Validation(format!(
                    "invalid mode '{s}' (use auto/manual or a boolean)"
                ))),
            },
            other => Err(Error::Validation(format!(
                "invalid mode {other} (use auto/manual or a boolean)"
            ))),
        }
    }

    pub fn is_auto(self) -> bool {
        self == FanMode::Auto
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FanMode::Auto => "auto",
            FanMode::Manual => "manual",
        }
    }
}

/// Optional `source` field of a control request; absent or null means `app`.
pub fn parse_source(value: Option<&Value>) -> Result<CommandSource> {
    match value {
        None | Some(Value::Null) => Ok(CommandSource::default()),
        Some(Value::String(s)) => s.parse(),
        Some(other) => Err(Error::Validation(format!("invalid source {other}"))),
    }
}

pub struct Dispatcher<P> {
    db: Db,
    publisher: P,
}

impl<P: ControlPublisher> Dispatcher<P> {
    pub fn new(db: Db, publisher: P) -> Self {
        Self { db, publisher }
    }

    /// Switch the fan on or off. Returns whether the command was published.
    pub async fn set_fan(&self, device_id: &str, state: FanState, source: CommandSource) -> bool {
        self.dispatch(
            device_id,
            ControlCommand::Fan(state.is_on()),
            CommandType::FanControl,
            state.as_str(),
            source,
        )
        .await
    }

    /// Switch between automatic and manual mode. Returns whether the command
    /// was published.
    pub async fn set_mode(&self, device_id: &str, mode: FanMode, source: CommandSource) -> bool {
        self.dispatch(
            device_id,
            ControlCommand::Auto(mode.is_auto()),
            CommandType::ModeChange,
            mode.as_str(),
            source,
        )
        .await
    }

    async fn dispatch(
        &self,
        device_id: &str,
        command: ControlCommand,
        command_type: CommandType,
        value: &str,
        source: CommandSource,
    ) -> bool {
        match self
            .try_dispatch(device_id, command, command_type, value, source)
            .await
        {
            Ok(record) => {
                info!(
                    device = %device_id,
                    command = command_type.as_str(),
                    value = %value,
                    source = %source,
                    record_id = record.id,
                    "control command sent"
                );
                true
            }
            Err(e) => {
                error!(
                    device = %device_id,
                    command = command_type.as_str(),
                    value = %value,
                    source = %source,
                    "control dispatch failed: {e}"
                );
                false
            }
        }
    }

    async fn try_dispatch(
        &self,
        device_id: &str,
        command: ControlCommand,
        command_type: CommandType,
        value: &str,
        source: CommandSource,
    ) -> Result<ControlRecord> {
        if self.db.get_device(device_id).await?.is_none() {
            return Err(Error::NotFound(device_id.to_string()));
        }

        if !self.publisher.publish_control(device_id, command).await {
            return Err(Error::Publish {
                topic: control_topic(device_id),
            });
        }

        self.db
            .add_control_record(device_id, command_type, value, source)
            .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Records every publish attempt; `reject` makes the broker refuse them.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) reject: bool,
        pub(crate) sent: Arc<Mutex<Vec<(String, ControlCommand)>>>,
    }

    impl RecordingPublisher {
        pub(crate) fn rejecting() -> Self {
            Self {
                reject: true,
                ..Default::default()
            }
        }

        pub(crate) fn sent(&self) -> Vec<(String, ControlCommand)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl ControlPublisher for RecordingPublisher {
        async fn publish_control(&self, device_id: &str, command: ControlCommand) -> bool {
            self.sent
                .lock()
                .unwrap()
                .push((control_topic(device_id), command));
            !self.reject
        }
    }

    // -- Parsers ------------------------------------------------------------

    #[test]
    fn fan_state_accepts_bool_and_words() {
        assert_eq!(FanState::parse(&json!(true)).unwrap(), FanState::On);
        assert_eq!(FanState::parse(&json!(false)).unwrap(), FanState::Off);
        assert_eq!(FanState::parse(&json!("on")).unwrap(), FanState::On);
        assert_eq!(FanState::parse(&json!(" OFF ")).unwrap(), FanState::Off);
    }

    #[test]
    fn fan_state_rejects_everything_else() {
        for v in [json!(1), json!(0), json!("yes"), json!(null), json!({})] {
            assert!(
                matches!(FanState::parse(&v), Err(Error::Validation(_))),
                "accepted {v}"
            );
        }
    }

    #[test]
    fn fan_mode_accepts_bool_and_words() {
        assert_eq!(FanMode::parse(&json!(true)).unwrap(), FanMode::Auto);
        assert_eq!(FanMode::parse(&json!("manual")).unwrap(), FanMode::Manual);
        assert_eq!(FanMode::parse(&json!("Auto")).unwrap(), FanMode::Auto);
    }

    #[test]
    fn fan_mode_rejects_everything_else() {
        for v in [json!(1), json!("on"), json!([])] {
            assert!(matches!(FanMode::parse(&v), Err(Error::Validation(_))));
        }
    }

    #[test]
    fn source_defaults_to_app() {
        assert_eq!(parse_source(None).unwrap(), CommandSource::App);
        assert_eq!(parse_source(Some(&json!(null))).unwrap(), CommandSource::App);
        assert_eq!(
            parse_source(Some(&json!("schedule"))).unwrap(),
            CommandSource::Schedule
        );
        assert!(parse_source(Some(&json!(3))).is_err());
        assert!(parse_source(Some(&json!("cron"))).is_err());
    }

    // -- Dispatcher ---------------------------------------------------------

    #[tokio::test]
    async fn set_fan_publishes_and_records() {
        let db = test_db().await;
        db.ensure_device("fan_1").await.unwrap();
        let publisher = RecordingPublisher::default();
        let d = Dispatcher::new(db.clone(), publisher.clone());

        assert!(d.set_fan("fan_1", FanState::Off, CommandSource::App).await);

        assert_eq!(
            publisher.sent(),
            vec![("control/fan_1".to_string(), ControlCommand::Fan(false))]
        );
        let history = db.recent_control_records("fan_1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command_type, CommandType::FanControl);
        assert_eq!(history[0].command_value, "off");
        assert_eq!(history[0].source, CommandSource::App);
    }

    #[tokio::test]
    async fn set_mode_publishes_and_records() {
        let db = test_db().await;
        db.ensure_device("fan_1").await.unwrap();
        let publisher = RecordingPublisher::default();
        let d = Dispatcher::new(db.clone(), publisher.clone());

        assert!(d.set_mode("fan_1", FanMode::Manual, CommandSource::Schedule).await);

        assert_eq!(
            publisher.sent(),
            vec![("control/fan_1".to_string(), ControlCommand::Auto(false))]
        );
        let history = db.recent_control_records("fan_1", 10).await.unwrap();
        assert_eq!(history[0].command_type, CommandType::ModeChange);
        assert_eq!(history[0].command_value, "manual");
        assert_eq!(history[0].source, CommandSource::Schedule);
    }

    #[tokio::test]
    async fn rejected_publish_leaves_no_record() {
        let db = test_db().await;
        db.ensure_device("fan_1").await.unwrap();
        let publisher = RecordingPublisher::rejecting();
        let d = Dispatcher::new(db.clone(), publisher.clone());

        assert!(!d.set_fan("fan_1", FanState::On, CommandSource::App).await);

        assert_eq!(publisher.sent().len(), 1);
        assert!(db.recent_control_records("fan_1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gateway_without_broker_session_leaves_no_record() {
        let db = test_db().await;
        db.ensure_device("fan_1").await.unwrap();
        let (gateway, _eventloop) =
            crate::mqtt::MqttGateway::connect(&crate::config::MqttConfig::default());
        let d = Dispatcher::new(db.clone(), gateway);

        assert!(!d.set_fan("fan_1", FanState::On, CommandSource::App).await);
        assert!(!d.set_mode("fan_1", FanMode::Manual, CommandSource::App).await);
        assert!(db.recent_control_records("fan_1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_device_never_publishes() {
        let db = test_db().await;
        let publisher = RecordingPublisher::default();
        let d = Dispatcher::new(db.clone(), publisher.clone());

        assert!(!d.set_fan("ghost", FanState::On, CommandSource::App).await);
        assert!(!d.set_mode("ghost", FanMode::Auto, CommandSource::App).await);
        assert!(publisher.sent().is_empty());
    }

    #[tokio::test]
    async fn each_success_adds_exactly_one_record() {
        let db = test_db().await;
        db.ensure_device("fan_1").await.unwrap();
        let d = Dispatcher::new(db.clone(), RecordingPublisher::default());

        d.set_fan("fan_1", FanState::On, CommandSource::Auto).await;
        d.set_fan("fan_1", FanState::Off, CommandSource::Auto).await;

        let history = db.recent_control_records("fan_1", 10).await.unwrap();
        let values: Vec<&str> = history.iter().map(|r| r.command_value.as_str()).collect();
        assert_eq!(values, vec!["off", "on"]);
    }
}
