//! hdcfg Configuration Agent
//!
//! Runs next to the controller and keeps the virtual routers hosted on
//! CSR1kv devices in line with the controller's router model.
//!
//! ## Architecture
//!
//! - **Sync Scheduler**: incremental and full-sync loops over all routers
//! - **Device Registry**: driver cache and backlog of unreachable devices
//! - **Notification API**: controller pushes change notifications here
//! - **State Report Loop**: periodic agent state sent to the controller

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hdcfg_agent::config::Config;
use hdcfg_agent::driver::csr::{CsrDriverFactory, CsrSettings, CSR1KV_FAMILY};
use hdcfg_agent::driver::session::TcpConnector;
use hdcfg_agent::driver::DriverCatalog;
use hdcfg_agent::{heartbeat, notify, probe};
use hdcfg_agent::{Controller, DeviceRegistry, HttpController, SchedulerSettings, SyncScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; the log level comes from it
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        host = %config.host,
        controller_url = %config.controller_url,
        notify_listen_addr = %config.notify_listen_addr,
        "Starting hdcfg configuration agent"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Device drivers and the registry that caches them
    let csr = CsrDriverFactory::new(
        Arc::new(TcpConnector),
        CsrSettings {
            connect_timeout: config.connect_timeout,
            push_timeout: config.push_timeout,
            nat_settle: config.nat_settle,
        },
    );
    let catalog = DriverCatalog::new().with(CSR1KV_FAMILY, Arc::new(csr));
    let probe = probe::from_kind(config.probe, config.probe_timeout);
    let registry = DeviceRegistry::new(catalog, probe, config.hosting_device_dead_timeout);

    let controller: Arc<dyn Controller> =
        Arc::new(HttpController::new(&config).context("Failed to build controller client")?);
    let scheduler = Arc::new(SyncScheduler::new(
        SchedulerSettings::from_config(&config),
        Arc::clone(&controller),
        registry,
    ));

    // Start the sync loops
    let scheduler_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let shutdown_rx = shutdown_rx.clone();
        async move { scheduler.run(shutdown_rx).await }
    });

    // Start the notification API
    let notify_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let shutdown_rx = shutdown_rx.clone();
        let addr = config.notify_listen_addr;
        async move { notify::serve(addr, scheduler, shutdown_rx).await }
    });

    // Start the state report loop
    let report_handle = config.report_interval.map(|interval| {
        tokio::spawn({
            let controller = Arc::clone(&controller);
            let scheduler = Arc::clone(&scheduler);
            let shutdown_rx = shutdown_rx.clone();
            async move {
                heartbeat::run_report_loop(controller, scheduler, interval, shutdown_rx).await
            }
        })
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = notify_handle => {
            match result {
                Ok(Ok(())) => info!("Notification API exited"),
                Ok(Err(e)) => error!(error = %e, "Notification API error"),
                Err(e) => error!(error = %e, "Notification API task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Scheduler task panicked");
    }
    if let Some(handle) = report_handle {
        let _ = handle.await;
    }

    info!("Configuration agent shutdown complete");
    Ok(())
}
