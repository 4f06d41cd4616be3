mod config;
mod cycle;
mod scheduler;
mod source;

use anyhow::{Context, Result};
use std::{
    env,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cycle::Engine;
use source::FileForecast;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    let run_once = env::args().skip(1).any(|a| a == "--once")
        || env::var("RUN_ONCE")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

    // ── Engine ──────────────────────────────────────────────────────
    let forecasts = FileForecast::new(&cfg.forecast_path);
    let engine = Engine::from_config(&cfg, forecasts)
        .with_context(|| format!("failed to build controller from {config_path}"))?;
    info!(
        controller = ?cfg.controller,
        location = cfg.location,
        moisture = engine.moisture(),
        forecast_path = %cfg.forecast_path,
        "engine ready"
    );
    let engine = Arc::new(Mutex::new(engine));

    let interval = Duration::from_secs(cfg.schedule.interval_sec);
    let cycle_timeout = Duration::from_millis(cfg.schedule.cycle_timeout_ms);

    if run_once {
        let outcome = scheduler::run_cycle(&engine, scheduler::local_now(), cycle_timeout).await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    // ── Scheduler ───────────────────────────────────────────────────
    tokio::select! {
        log = scheduler::run(engine, interval, cycle_timeout, None) => {
            info!(rows = log.rows().len(), "scheduler stopped");
        }
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
        }
    }

    Ok(())
}
