//! Polling worker driving reconciliation cycles

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::errors::AgentError;
use crate::reconcile::{Controller, CycleEnd};
use crate::storage::settings::ReconcileSettings;

/// Poller worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval
    pub interval: Duration,

    /// Initial delay before first poll
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(5),
        }
    }
}

impl From<&ReconcileSettings> for Options {
    fn from(settings: &ReconcileSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.poll_interval_secs),
            initial_delay: Duration::from_secs(settings.initial_delay_secs),
        }
    }
}

/// Run the poller worker until shutdown. Returns an error only when a cycle
/// hits a fatal failure.
pub async fn run<S, F>(
    options: &Options,
    controller: &Controller,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<(), AgentError>
where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Poller worker starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Poller worker shutting down...");
            return Ok(());
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        debug!("Starting reconciliation cycle...");
        let delay = match controller.run_cycle().await {
            Ok(outcome) => {
                if outcome.end == CycleEnd::Wait {
                    debug!("Control plane requested {:?} before the next cycle", outcome.wait);
                }
                outcome.wait.unwrap_or(options.interval)
            }
            Err(e) => {
                error!("Reconciliation failed fatally: {}", e);
                return Err(e);
            }
        };

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Poller worker shutting down...");
                return Ok(());
            }
            _ = sleep_fn(delay) => {}
        }
    }
}
