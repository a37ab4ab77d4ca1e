//! TOML config file loading, environment overrides, validation, and device
//! seeding.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use crate::db::Db;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub control: ControlConfig,
    pub retention: RetentionConfig,
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_sec: u64,
    /// Bound of the queue between the MQTT event loop and the pipeline.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

/// Thresholds for an automatic controller. Loaded and validated, not acted on
/// by the bridge itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub temperature_threshold: f64,
    pub temperature_hysteresis: f64,
}

/// History windows in days. Zero keeps rows forever.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub sensor_data_days: u32,
    pub control_history_days: u32,
    pub sweep_interval_min: u64,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub name: String,
    #[serde(default = "default_location")]
    pub location: String,
}

fn default_location() -> String {
    crate::db::DEFAULT_LOCATION.to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "exhaust_fan_backend".to_string(),
            keep_alive_sec: 60,
            queue_capacity: 256,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:exhaust_fan.db?mode=rwc".to_string(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            temperature_threshold: 35.0,
            temperature_hysteresis: 2.0,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sensor_data_days: 30,
            control_history_days: 60,
            sweep_interval_min: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

fn parse_var<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{key}={raw:?}: {e}"))
}

impl Config {
    /// Apply environment overrides on top of the file values. `lookup` is
    /// `std::env::var` in production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = parse_var("MQTT_PORT", &v)?;
        }
        if let Some(v) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = lookup("MQTT_CLIENT_ID") {
            self.mqtt.client_id = v;
        }
        if let Some(v) = lookup("MQTT_KEEPALIVE") {
            self.mqtt.keep_alive_sec = parse_var("MQTT_KEEPALIVE", &v)?;
        }
        if let Some(v) = lookup("DB_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("WEB_PORT") {
            self.web.port = parse_var("WEB_PORT", &v)?;
        }
        if let Some(v) = lookup("TEMPERATURE_THRESHOLD") {
            self.control.temperature_threshold = parse_var("TEMPERATURE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("TEMPERATURE_HYSTERESIS") {
            self.control.temperature_hysteresis = parse_var("TEMPERATURE_HYSTERESIS", &v)?;
        }
        if let Some(v) = lookup("SENSOR_DATA_RETENTION") {
            self.retention.sensor_data_days = parse_var("SENSOR_DATA_RETENTION", &v)?;
        }
        if let Some(v) = lookup("CONTROL_HISTORY_RETENTION") {
            self.retention.control_history_days = parse_var("CONTROL_HISTORY_RETENTION", &v)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Characters with special meaning in MQTT topics; a device id containing
/// one could not be addressed on `control/<id>`.
const TOPIC_RESERVED: &[char] = &['/', '+', '#'];

/// One week.
const MAX_SWEEP_INTERVAL_MIN: u64 = 7 * 24 * 60;

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_service(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        if m.keep_alive_sec < 5 {
            errors.push(format!(
                "mqtt.keep_alive_sec must be at least 5, got {}",
                m.keep_alive_sec
            ));
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt.password is set without mqtt.username".to_string());
        }
        if m.queue_capacity == 0 {
            errors.push("mqtt.queue_capacity must be positive".to_string());
        }
    }

    fn validate_service(&self, errors: &mut Vec<String>) {
        if !self.database.url.starts_with("sqlite:") {
            errors.push(format!(
                "database.url '{}' is not a sqlite: url",
                self.database.url
            ));
        }

        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }

        let c = &self.control;
        if !c.temperature_threshold.is_finite() {
            errors.push("control.temperature_threshold must be a finite number".to_string());
        }
        if !c.temperature_hysteresis.is_finite() || c.temperature_hysteresis < 0.0 {
            errors.push(format!(
                "control.temperature_hysteresis must be >= 0, got {}",
                c.temperature_hysteresis
            ));
        }

        let sweep = self.retention.sweep_interval_min;
        if sweep == 0 {
            errors.push("retention.sweep_interval_min must be positive".to_string());
        } else if sweep > MAX_SWEEP_INTERVAL_MIN {
            errors.push(format!(
                "retention.sweep_interval_min must be <= {MAX_SWEEP_INTERVAL_MIN}, got {sweep}"
            ));
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.id)
                }
            };

            if d.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&d.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }
            if d.id.contains(TOPIC_RESERVED) {
                errors.push(format!(
                    "{}: id must not contain '/', '+' or '#'",
                    ctx()
                ));
            }
            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read and parse the TOML file if it exists (defaults otherwise), apply
/// environment overrides, then validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "config file not found, using defaults");
        Config::default()
    };

    config
        .apply_env(|key| std::env::var(key).ok())
        .context("invalid environment override")?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Register every configured device in the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for d in &config.devices {
        db.upsert_device(&d.id, &d.name, &d.location)
            .await
            .with_context(|| format!("failed to upsert device '{}'", d.id))?;
    }

    tracing::info!(devices = config.devices.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_device() -> DeviceEntry {
        DeviceEntry {
            id: "exhaust_fan_1".into(),
            name: "Kitchen".into(),
            location: "Ground floor".into(),
        }
    }

    fn valid_config() -> Config {
        Config {
            devices: vec![valid_device()],
            ..Default::default()
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[mqtt]
host = "192.168.1.100"
port = 1884
username = "mqtt_user"
password = "mqtt_password"

[database]
url = "sqlite::memory:"

[web]
port = 8080

[control]
temperature_threshold = 33.5

[retention]
sensor_data_days = 7

[[devices]]
id = "exhaust_fan_1"
name = "Kitchen"
location = "Ground floor"

[[devices]]
id = "exhaust_fan_2"
name = "Bathroom"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mqtt.host, "192.168.1.100");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.mqtt.client_id, "exhaust_fan_backend");
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.control.temperature_threshold, 33.5);
        assert_eq!(config.control.temperature_hysteresis, 2.0);
        assert_eq!(config.retention.sensor_data_days, 7);
        assert_eq!(config.retention.control_history_days, 60);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[1].location, "Unknown");
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keep_alive_sec, 60);
        assert_eq!(config.web.port, 5000);
        assert_eq!(config.retention.sensor_data_days, 30);
        assert!(config.devices.is_empty());
        config.validate().unwrap();
    }

    // -- Environment overrides ----------------------------------------------

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = valid_config();
        cfg.apply_env(env(&[
            ("MQTT_HOST", "broker.local"),
            ("MQTT_PORT", "8883"),
            ("MQTT_USERNAME", "fan"),
            ("MQTT_PASSWORD", "secret"),
            ("DB_URL", "sqlite::memory:"),
            ("WEB_PORT", "9000"),
            ("TEMPERATURE_THRESHOLD", "40"),
            ("SENSOR_DATA_RETENTION", "14"),
            ("CONTROL_HISTORY_RETENTION", "0"),
        ]))
        .unwrap();

        assert_eq!(cfg.mqtt.host, "broker.local");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.mqtt.username.as_deref(), Some("fan"));
        assert_eq!(cfg.mqtt.password.as_deref(), Some("secret"));
        assert_eq!(cfg.database.url, "sqlite::memory:");
        assert_eq!(cfg.web.port, 9000);
        assert_eq!(cfg.control.temperature_threshold, 40.0);
        assert_eq!(cfg.retention.sensor_data_days, 14);
        assert_eq!(cfg.retention.control_history_days, 0);
        cfg.validate().unwrap();
    }

    #[test]
    fn env_absent_keeps_file_values() {
        let mut cfg = valid_config();
        cfg.apply_env(env(&[])).unwrap();
        assert_eq!(cfg.mqtt.host, "localhost");
    }

    #[test]
    fn env_bad_number_rejected() {
        let mut cfg = valid_config();
        let err = cfg.apply_env(env(&[("MQTT_PORT", "abc")])).unwrap_err();
        assert!(format!("{err:#}").contains("MQTT_PORT"));
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn mqtt_empty_host_rejected() {
        let mut cfg = valid_config();
        cfg.mqtt.host = " ".into();
        assert_validation_err(&cfg, "mqtt.host is empty");
    }

    #[test]
    fn mqtt_zero_port_rejected() {
        let mut cfg = valid_config();
        cfg.mqtt.port = 0;
        assert_validation_err(&cfg, "mqtt.port must be non-zero");
    }

    #[test]
    fn mqtt_short_keep_alive_rejected() {
        let mut cfg = valid_config();
        cfg.mqtt.keep_alive_sec = 1;
        assert_validation_err(&cfg, "keep_alive_sec must be at least 5");
    }

    #[test]
    fn mqtt_password_without_username_rejected() {
        let mut cfg = valid_config();
        cfg.mqtt.password = Some("pw".into());
        assert_validation_err(&cfg, "password is set without");
    }

    #[test]
    fn database_non_sqlite_rejected() {
        let mut cfg = valid_config();
        cfg.database.url = "postgres://localhost/fans".into();
        assert_validation_err(&cfg, "is not a sqlite: url");
    }

    #[test]
    fn negative_hysteresis_rejected() {
        let mut cfg = valid_config();
        cfg.control.temperature_hysteresis = -1.0;
        assert_validation_err(&cfg, "temperature_hysteresis must be >= 0");
    }

    #[test]
    fn sweep_interval_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.retention.sweep_interval_min = 0;
        assert_validation_err(&cfg, "sweep_interval_min must be positive");
        cfg.retention.sweep_interval_min = u64::MAX;
        assert_validation_err(&cfg, "sweep_interval_min must be <= 10080");
    }

    #[test]
    fn device_empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].id = "".into();
        assert_validation_err(&cfg, "devices[0]: id is empty");
    }

    #[test]
    fn device_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.devices.push(valid_device());
        assert_validation_err(&cfg, "duplicate id");
    }

    #[test]
    fn device_topic_chars_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].id = "fan/1".into();
        assert_validation_err(&cfg, "must not contain");
    }

    #[test]
    fn device_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].name = "".into();
        assert_validation_err(&cfg, "name is empty");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.mqtt.host = "".into();
        cfg.web.port = 0;
        cfg.devices[0].name = "".into();

        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("mqtt.host"), "missing host error in: {msg}");
        assert!(msg.contains("web.port"), "missing web error in: {msg}");
        assert!(msg.contains("name is empty"), "missing device error in: {msg}");
    }

    // -- DB integration ---------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_database() {
        let db = crate::db::tests::test_db().await;

        let config = valid_config();
        config.validate().unwrap();
        apply(&config, &db).await.unwrap();

        let devices = db.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "exhaust_fan_1");
        assert_eq!(devices[0].name, "Kitchen");
        assert_eq!(devices[0].location.as_deref(), Some("Ground floor"));
    }

    #[tokio::test]
    async fn apply_twice_keeps_one_row() {
        let db = crate::db::tests::test_db().await;
        let config = valid_config();
        apply(&config, &db).await.unwrap();
        apply(&config, &db).await.unwrap();
        assert_eq!(db.list_devices().await.unwrap().len(), 1);
    }
}
