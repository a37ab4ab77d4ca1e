mod config;
mod control;
mod db;
mod error;
mod ingest;
mod mqtt;
mod retention;
mod state;
mod web;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use ingest::Pipeline;
use mqtt::MqttGateway;
use state::SystemState;
use web::AppState;

#[derive(Parser, Debug)]
#[command(name = "fan-bridge", about = "Exhaust fan MQTT bridge and HTTP API")]
struct Args {
    /// TOML config file; a missing file means built-in defaults.
    #[arg(long, env = "CONFIG_PATH", default_value = "config.toml")]
    config: String,

    /// Delete every device, reading and control record, then exit.
    #[arg(long)]
    purge: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let cfg = config::load(&args.config)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url)
        .await
        .with_context(|| format!("failed to open database {}", cfg.database.url))?;
    db.migrate().await.context("database migration failed")?;

    if args.purge {
        let counts = db.purge_all().await.context("database purge failed")?;
        info!(
            devices = counts.devices,
            readings = counts.readings,
            control_records = counts.control_records,
            "database purged"
        );
        db.close().await;
        return Ok(());
    }

    config::apply(&cfg, &db).await?;

    let devices = db.list_devices().await?;
    info!(devices = devices.len(), "db ready");
    info!(
        threshold = cfg.control.temperature_threshold,
        hysteresis = cfg.control.temperature_hysteresis,
        "auto control thresholds"
    );

    // ── Shared state (ephemeral, for /status) ───────────────────────
    let shared = SystemState::shared();
    shared
        .write()
        .await
        .record_system("bridge started".to_string());

    // ── MQTT ────────────────────────────────────────────────────────
    let (gateway, eventloop) = MqttGateway::connect(&cfg.mqtt);
    let (tx, rx) = mpsc::channel(cfg.mqtt.queue_capacity);

    let mut mqtt_task = tokio::spawn(mqtt::run_event_loop(
        eventloop,
        gateway.clone(),
        tx,
        shared.clone(),
    ));
    let mut ingest_task = tokio::spawn(ingest::run(
        Pipeline::new(db.clone(), shared.clone()),
        rx,
    ));
    let retention_task = tokio::spawn(retention::run(
        db.clone(),
        cfg.retention.clone(),
        shared.clone(),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState::new(db.clone(), gateway.clone(), shared.clone());
    let mut web_task = tokio::spawn(web::serve(web_state, cfg.web.port));

    tokio::select! {
        res = &mut web_task => match res {
            Ok(Ok(())) => warn!("web server exited"),
            Ok(Err(e)) => error!("web server failed: {e:#}"),
            Err(e) => error!("web task panicked: {e}"),
        },
        _ = &mut mqtt_task => warn!("mqtt event loop exited"),
        _ = &mut ingest_task => warn!("ingestion pipeline exited"),
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("failed to listen for ctrl-c: {e}");
            }
            info!("shutdown requested");
        }
    }

    retention_task.abort();
    web_task.abort();
    gateway.close().await;
    mqtt_task.abort();
    ingest_task.abort();
    db.close().await;

    info!("bridge stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_flag_is_opt_in() {
        let args = Args::try_parse_from(["fan-bridge"]).unwrap();
        assert!(!args.purge);

        let args = Args::try_parse_from(["fan-bridge", "--purge", "--config", "/etc/fan.toml"]).unwrap();
        assert!(args.purge);
        assert_eq!(args.config, "/etc/fan.toml");
    }
}
