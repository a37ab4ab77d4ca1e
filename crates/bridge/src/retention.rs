//! History retention: periodically deletes sensor readings and control
//! records older than the configured windows. A window of zero days keeps
//! that history forever.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{error, info};

use crate::config::RetentionConfig;
use crate::db::Db;
use crate::state::SharedState;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SweepResult {
    pub(crate) readings: u64,
    pub(crate) control_records: u64,
}

/// Run the retention loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(db: Db, cfg: RetentionConfig, shared: SharedState) {
    let mut ticker = tokio::time::interval(sweep_period(&cfg));

    info!(
        sensor_data_days = cfg.sensor_data_days,
        control_history_days = cfg.control_history_days,
        interval_min = cfg.sweep_interval_min,
        "retention started"
    );

    loop {
        ticker.tick().await;
        sweep(&db, &cfg, &shared, OffsetDateTime::now_utc()).await;
    }
}

fn sweep_period(cfg: &RetentionConfig) -> Duration {
    Duration::from_secs(cfg.sweep_interval_min.saturating_mul(60))
}

/// One purge pass relative to `now`. Errors are logged; the next tick retries.
pub(crate) async fn sweep(
    db: &Db,
    cfg: &RetentionConfig,
    shared: &SharedState,
    now: OffsetDateTime,
) -> SweepResult {
    let mut result = SweepResult::default();

    if cfg.sensor_data_days > 0 {
        let cutoff = now - time::Duration::days(i64::from(cfg.sensor_data_days));
        match db.purge_readings_before(cutoff).await {
            Ok(n) => result.readings = n,
            Err(e) => {
                error!("retention: purge_readings_before failed: {e}");
                shared
                    .write()
                    .await
                    .record_error(format!("reading purge failed: {e}"));
            }
        }
    }

    if cfg.control_history_days > 0 {
        let cutoff = now - time::Duration::days(i64::from(cfg.control_history_days));
        match db.purge_control_records_before(cutoff).await {
            Ok(n) => result.control_records = n,
            Err(e) => {
                error!("retention: purge_control_records_before failed: {e}");
                shared
                    .write()
                    .await
                    .record_error(format!("control history purge failed: {e}"));
            }
        }
    }

    if result.readings > 0 || result.control_records > 0 {
        info!(
            readings = result.readings,
            control_records = result.control_records,
            "retention: purged old history"
        );
        shared.write().await.record_retention(format!(
            "purged {} reading(s), {} control record(s)",
            result.readings, result.control_records
        ));
    }

    result
}

// ===========================================================================
// Tests
// ===========================================================================
