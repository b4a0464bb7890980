//! Periodic state report to the controller.
//!
//! The first successful report carries the start flag so the controller can
//! tell a restarted agent from a live one. A controller without the state
//! endpoint stops the loop for good.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::Controller;
use crate::error::ControllerError;
use crate::scheduler::SyncScheduler;

/// Run the report loop until shutdown.
pub async fn run_report_loop(
    controller: Arc<dyn Controller>,
    scheduler: Arc<SyncScheduler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Starting state report loop");

    let mut start_flag = true;
    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let report = scheduler.state_report(start_flag);

                match controller.report_state(&report).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        start_flag = false;
                        debug!(
                            routers = report.routers,
                            non_responding = report.non_responding_hosting_devices.len(),
                            "State report acknowledged"
                        );
                    }
                    Err(ControllerError::NotSupported(_)) => {
                        warn!("Controller does not accept state reports, disabling");
                        break;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "State report failed"
                            );
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "State report failed repeatedly"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("State report loop shutting down");
                    break;
                }
            }
        }
    }
}
