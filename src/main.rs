mod config;
mod hardware;
mod models;
mod services;

use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::services::commands::CommandQueue;
use crate::services::engine::Engine;
use crate::services::{advisor, bus, watchdog};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // 1. Configuration. Invalid config is the only intentional fatal path.
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "refusing to start on invalid configuration");
            return ExitCode::from(1);
        }
    };

    // 2. Hardware capability. Outside simulation a missing driver backend is
    // an init failure, not something to limp through.
    let hw = match hardware::init(&config) {
        Ok(hw) => hw,
        Err(e) => {
            error!(error = %e, "hardware initialization failed");
            return ExitCode::from(2);
        }
    };
    if config.simulation {
        info!("simulation mode: synthetic sensors and relays");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bus = format!("{}:{}", config.bus.host, config.bus.port),
        prefix = %config.bus.topic_prefix,
        period_s = config.sample_period_s,
        "solar heating controller starting"
    );

    // 3. Long-lived tasks: bus connection, watchdog, engine.
    let commands = Arc::new(CommandQueue::new());
    let (bus_handle, bus_task) = bus::spawn(config.bus.clone(), commands.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watchdog_task = tokio::spawn(watchdog::run(
        config.watchdog.clone(),
        config.bus.clone(),
        shutdown_rx.clone(),
    ));

    let advisor = advisor::from_config(&config.advisor);
    let engine = Engine::new(&config, hw, commands, bus_handle, advisor);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    // 4. Wait for a termination signal, then let the engine finish its tick
    // and wind down.
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "could not install the SIGTERM handler");
            return ExitCode::from(1);
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    let _ = shutdown_tx.send(true);
    let _ = engine_task.await;
    let _ = watchdog_task.await;
    // With every handle dropped the bus task flushes, announces offline, and
    // exits on its own.
    let _ = bus_task.await;

    info!("shutdown complete");
    ExitCode::SUCCESS
}
