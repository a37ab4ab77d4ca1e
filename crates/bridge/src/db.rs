use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, FromRow, Pool, Row, Sqlite};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::info;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub location: Option<String>,
    pub last_temperature: Option<f64>,
    pub fan_status: bool,
    pub auto_mode: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorReading {
    pub id: i64,
    pub device_id: String,
    pub temperature: f64,
    pub fan_status: bool,
    pub auto_mode: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlRecord {
    pub id: i64,
    pub device_id: String,
    pub command_type: CommandType,
    pub command_value: String,
    pub source: CommandSource,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    FanControl,
    ModeChange,
}

/// Originator of a control command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    #[default]
    App,
    Auto,
    Schedule,
}

/// Rows removed by [`Db::purge_all`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeCounts {
    pub devices: u64,
    pub readings: u64,
    pub control_records: u64,
}

/// Telemetry fields to merge into a device. `None` leaves the stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetryUpdate {
    pub temperature: Option<f64>,
    pub fan: Option<bool>,
    pub auto: Option<bool>,
}

impl CommandType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::FanControl => "fan_control",
            CommandType::ModeChange => "mode_change",
        }
    }
}

impl FromStr for CommandType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fan_control" => Ok(CommandType::FanControl),
            "mode_change" => Ok(CommandType::ModeChange),
            other => Err(Error::Validation(format!("unknown command type '{other}'"))),
        }
    }
}

impl CommandSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandSource::App => "app",
            CommandSource::Auto => "auto",
            CommandSource::Schedule => "schedule",
        }
    }
}

impl FromStr for CommandSource {
    type Err = Error;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "app" => Ok(CommandSource::App),
            "auto" => Ok(CommandSource::Auto),
            "schedule" => Ok(CommandSource::Schedule),
            _ => Err(Error::Validation(format!(
                "invalid source '{s}' (use app, auto or schedule)"
            ))),
        }
    }
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const DEVICE_COLUMNS: &str = "id, name, location, last_temperature, fan_status, auto_mode, \
                              last_seen, created_at, updated_at";
const READING_COLUMNS: &str = "id, device_id, temperature, fan_status, auto_mode, ts";
const CONTROL_COLUMNS: &str = "id, device_id, command_type, command_value, source, ts";

impl<'r> FromRow<'r, SqliteRow> for Device {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let last_seen: Option<i64> = row.try_get("last_seen")?;
        Ok(Device {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            location: row.try_get("location")?,
            last_temperature: row.try_get("last_temperature")?,
            fan_status: row.try_get("fan_status")?,
            auto_mode: row.try_get("auto_mode")?,
            last_seen: last_seen.map(from_millis).transpose()?,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for SensorReading {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(SensorReading {
            id: row.try_get("id")?,
            device_id: row.try_get("device_id")?,
            temperature: row.try_get("temperature")?,
            fan_status: row.try_get("fan_status")?,
            auto_mode: row.try_get("auto_mode")?,
            timestamp: from_millis(row.try_get("ts")?)?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for ControlRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let command_type: String = row.try_get("command_type")?;
        let source: String = row.try_get("source")?;
        Ok(ControlRecord {
            id: row.try_get("id")?,
            device_id: row.try_get("device_id")?,
            command_type: command_type
                .parse()
                .map_err(|e: Error| sqlx::Error::Decode(e.to_string().into()))?,
            command_value: row.try_get("command_value")?,
            source: source
                .parse()
                .map_err(|e: Error| sqlx::Error::Decode(e.to_string().into()))?,
            timestamp: from_millis(row.try_get("ts")?)?,
        })
    }
}

/// Unix milliseconds, the storage format for every timestamp column.
pub fn unix_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(ms: i64) -> std::result::Result<OffsetDateTime, sqlx::Error> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

/// Name given to a device created by its first telemetry message.
pub fn default_device_name(device_id: &str) -> String {
    match device_id.chars().last() {
        Some(c) => format!("Exhaust Fan {c}"),
        None => "Exhaust Fan".to_string(),
    }
}

pub const DEFAULT_LOCATION: &str = "Unknown";

/// Atomic insert-if-absent, so concurrent first messages for the same id
/// never race into a duplicate-key error.
async fn insert_default_device<'e, E>(ex: E, device_id: &str, now_ms: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO devices (id, name, location, fan_status, auto_mode, created_at, updated_at)
        VALUES (?, ?, ?, 0, 1, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(device_id)
    .bind(default_device_name(device_id))
    .bind(DEFAULT_LOCATION)
    .bind(now_ms)
    .bind(now_ms)
    .execute(ex)
    .await?;
    Ok(())
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/fan-bridge/exhaust_fan.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection keeps an in-memory database alive and unshared.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("database closed");
    }

    // ----------------------------
    // Devices
    // ----------------------------

    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }

    /// Explicit registration: creates the device or renames/relocates an
    /// existing one. Telemetry fields are never touched.
    pub async fn upsert_device(&self, device_id: &str, name: &str, location: &str) -> Result<Device> {
        let now_ms = unix_millis(OffsetDateTime::now_utc());
        let device = sqlx::query_as::<_, Device>(&format!(
            r#"
            INSERT INTO devices (id, name, location, fan_status, auto_mode, created_at, updated_at)
            VALUES (?, ?, ?, 0, 1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              location=excluded.location,
              updated_at=MAX(devices.updated_at, excluded.updated_at)
            RETURNING {DEVICE_COLUMNS}
            "#
        ))
        .bind(device_id)
        .bind(name)
        .bind(location)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(device)
    }

    /// Returns the device, creating it with default name and location first
    /// if it does not exist yet.
    #[cfg(test)]
    pub async fn ensure_device(&self, device_id: &str) -> Result<Device> {
        let now_ms = unix_millis(OffsetDateTime::now_utc());
        insert_default_device(&self.pool, device_id, now_ms).await?;
        self.get_device(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(device_id.to_string()))
    }

    /// Updates name and/or location. Returns `None` for an unknown device.
    pub async fn update_device_info(
        &self,
        device_id: &str,
        name: Option<&str>,
        location: Option<&str>,
    ) -> Result<Option<Device>> {
        let now_ms = unix_millis(OffsetDateTime::now_utc());
        let device = sqlx::query_as::<_, Device>(&format!(
            r#"
            UPDATE devices
            SET name = COALESCE(?, name),
                location = COALESCE(?, location),
                updated_at = MAX(updated_at, ?)
            WHERE id = ?
            RETURNING {DEVICE_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(location)
        .bind(now_ms)
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    /// Creates the device if needed, merges the telemetry fields, stamps
    /// `last_seen`, and appends a reading when a temperature is present.
    /// Everything commits in one transaction.
    pub async fn apply_telemetry(
        &self,
        device_id: &str,
        update: &TelemetryUpdate,
        now: OffsetDateTime,
    ) -> Result<(Device, Option<SensorReading>)> {
        let now_ms = unix_millis(now);
        let mut tx = self.pool.begin().await?;

        insert_default_device(&mut *tx, device_id, now_ms).await?;

        sqlx::query(
            r#"
            UPDATE devices
            SET last_temperature = COALESCE(?, last_temperature),
                fan_status = COALESCE(?, fan_status),
                auto_mode = COALESCE(?, auto_mode),
                last_seen = ?,
                updated_at = MAX(updated_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(update.temperature)
        .bind(update.fan)
        .bind(update.auto)
        .bind(now_ms)
        .bind(now_ms)
        .bind(device_id)
        .execute(&mut *tx)
        .await?;

        // fan/auto come from the row just merged, so omitted payload fields
        // fall back to the device's current values.
        let reading = match update.temperature {
            Some(temperature) => Some(
                sqlx::query_as::<_, SensorReading>(&format!(
                    r#"
                    INSERT INTO sensor_readings (device_id, temperature, fan_status, auto_mode, ts)
                    SELECT id, ?, fan_status, auto_mode, ?
                    FROM devices
                    WHERE id = ?
                    RETURNING {READING_COLUMNS}
                    "#
                ))
                .bind(temperature)
                .bind(now_ms)
                .bind(device_id)
                .fetch_one(&mut *tx)
                .await?,
            ),
            None => None,
        };

        let device = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"
        ))
        .bind(device_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((device, reading))
    }

    // ----------------------------
    // Sensor readings
    // ----------------------------

    #[cfg(test)]
    pub async fn add_reading(
        &self,
        device_id: &str,
        temperature: f64,
        fan_status: bool,
        auto_mode: bool,
    ) -> Result<SensorReading> {
        self.add_reading_at(device_id, temperature, fan_status, auto_mode, OffsetDateTime::now_utc())
            .await
    }

    #[cfg(test)]
    pub async fn add_reading_at(
        &self,
        device_id: &str,
        temperature: f64,
        fan_status: bool,
        auto_mode: bool,
        ts: OffsetDateTime,
    ) -> Result<SensorReading> {
        let reading = sqlx::query_as::<_, SensorReading>(&format!(
            r#"
            INSERT INTO sensor_readings (device_id, temperature, fan_status, auto_mode, ts)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {READING_COLUMNS}
            "#
        ))
        .bind(device_id)
        .bind(temperature)
        .bind(fan_status)
        .bind(auto_mode)
        .bind(unix_millis(ts))
        .fetch_one(&self.pool)
        .await?;
        Ok(reading)
    }

    /// Newest first.
    pub async fn recent_readings(&self, device_id: &str, limit: i64) -> Result<Vec<SensorReading>> {
        let rows = sqlx::query_as::<_, SensorReading>(&format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM sensor_readings
            WHERE device_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#
        ))
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ----------------------------
    // Control records
    // ----------------------------

    pub async fn add_control_record(
        &self,
        device_id: &str,
        command_type: CommandType,
        command_value: &str,
        source: CommandSource,
    ) -> Result<ControlRecord> {
        self.add_control_record_at(
            device_id,
            command_type,
            command_value,
            source,
            OffsetDateTime::now_utc(),
        )
        .await
    }

    pub async fn add_control_record_at(
        &self,
        device_id: &str,
        command_type: CommandType,
        command_value: &str,
        source: CommandSource,
        ts: OffsetDateTime,
    ) -> Result<ControlRecord> {
        let record = sqlx::query_as::<_, ControlRecord>(&format!(
            r#"
            INSERT INTO control_records (device_id, command_type, command_value, source, ts)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {CONTROL_COLUMNS}
            "#
        ))
        .bind(device_id)
        .bind(command_type.as_str())
        .bind(command_value)
        .bind(source.as_str())
        .bind(unix_millis(ts))
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Newest first.
    pub async fn recent_control_records(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<ControlRecord>> {
        let rows = sqlx::query_as::<_, ControlRecord>(&format!(
            r#"
            SELECT {CONTROL_COLUMNS}
            FROM control_records
            WHERE device_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#
        ))
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ----------------------------
    // Retention
    // ----------------------------

    pub async fn purge_readings_before(&self, cutoff: OffsetDateTime) -> Result<u64> {
        let res = sqlx::query("DELETE FROM sensor_readings WHERE ts < ?")
            .bind(unix_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn purge_control_records_before(&self, cutoff: OffsetDateTime) -> Result<u64> {
        let res = sqlx::query("DELETE FROM control_records WHERE ts < ?")
            .bind(unix_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Deletes every control record, reading and device in one transaction,
    /// children first. Administrative reset only.
    pub async fn purge_all(&self) -> Result<PurgeCounts> {
        let mut tx = self.pool.begin().await?;

        let control_records = sqlx::query("DELETE FROM control_records")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let readings = sqlx::query("DELETE FROM sensor_readings")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let devices = sqlx::query("DELETE FROM devices")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(PurgeCounts {
            devices,
            readings,
            control_records,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
