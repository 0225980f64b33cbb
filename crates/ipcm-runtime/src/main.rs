//! # IPC Manager Daemon
//!
//! Supervises the IPC processes of a recursive network stack.
//!
//! ## Startup Sequence
//!
//! 1. Install the tracing subscriber (`RUST_LOG`, default `info`)
//! 2. Load configuration defaults and `IPCM_*` environment overrides
//! 3. Attach the native runtime (the in-process loopback when no kernel
//!    runtime is available)
//! 4. Start the dispatcher workers
//! 5. Run until Ctrl+C or a runtime-initiated shutdown, then stop

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ipcm_bus::LoopbackRuntime;
use ipcm_runtime::{IpcManager, ManagerConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Load configuration from defaults and the environment.
fn load_config() -> Result<ManagerConfig> {
    let mut config = ManagerConfig::default();
    config.apply_overrides(|name| std::env::var(name).ok());
    config.validate().context("invalid IPC manager configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config()?;
    let join_timeout = config.workers.join_timeout;
    info!(
        workers = config.workers.count,
        request_timeout_ms = config.correlator.request_timeout.as_millis() as u64,
        difs = config.dif_directory.len(),
        "[ipcm] Configuration loaded"
    );

    let loopback = Arc::new(LoopbackRuntime::new(config.loopback.event_capacity));
    loopback.set_auto_complete(config.loopback.auto_complete);
    warn!("[ipcm] No kernel runtime attached, serving requests from the loopback runtime");

    let manager = Arc::new(
        IpcManager::builder()
            .config(config)
            .loopback(loopback)
            .build()
            .context("failed to build IPC manager")?,
    );

    let starter = Arc::clone(&manager);
    tokio::task::spawn_blocking(move || starter.start())
        .await
        .context("start task panicked")?
        .context("failed to start IPC manager")?;
    info!("IPC manager is running. Press Ctrl+C to stop.");

    let shutdown = manager.shutdown_handle();
    let runtime_shutdown = tokio::task::spawn_blocking(move || {
        while !shutdown.wait(Duration::from_millis(500)) {}
    });
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            info!("[ipcm] Ctrl+C received");
        }
        _ = runtime_shutdown => {
            warn!("[ipcm] Shutdown requested by the runtime");
        }
    }

    let stopper = Arc::clone(&manager);
    let report = tokio::task::spawn_blocking(move || stopper.stop(join_timeout))
        .await
        .context("stop task panicked")?;
    if report.is_graceful() {
        info!(
            elapsed_ms = report.elapsed.as_millis() as u64,
            dispatched = report.stats.dispatched,
            "[ipcm] Shutdown complete"
        );
    } else {
        error!(outcome = ?report.outcome, "[ipcm] Degraded shutdown");
    }

    Ok(())
}
