//! Periodic background controllers

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Scheduling parameters of a [`Controller`]
#[derive(Clone, Debug)]
pub struct ControllerParams {
    /// Delay between successful runs. Zero runs the function until it
    /// first succeeds.
    pub run_interval: Duration,
    /// Backoff after the first failed run; doubles on every consecutive failure
    pub error_retry_base: Duration,
}

impl ControllerParams {
    /// Backoff after `consecutive_errors` failed runs, capped at the run interval
    pub fn backoff_duration(&self, consecutive_errors: u32) -> Duration {
        let exponential = 2u32.saturating_pow(consecutive_errors.saturating_sub(1));
        let cap = self.run_interval.max(self.error_retry_base);
        self.error_retry_base.saturating_mul(exponential).min(cap)
    }
}

#[derive(Default, Debug)]
struct ControllerStats {
    success_count: AtomicU64,
    failure_count: AtomicU64,
}

/// A named task invoking a function on a fixed schedule until cancelled
pub struct Controller {
    name: String,
    cancel: CancellationToken,
    stats: Arc<ControllerStats>,
    handle: JoinHandle<()>,
}

impl Controller {
    /// Spawn a controller running `do_func` every `params.run_interval`.
    ///
    /// A failing run is retried sooner, after an exponential backoff.
    pub fn spawn<F, Fut, E>(
        name: impl Into<String>,
        params: ControllerParams,
        cancel: CancellationToken,
        do_func: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let name = name.into();
        let stats = Arc::new(ControllerStats::default());

        let handle = tokio::spawn(run_loop(
            name.clone(),
            params,
            cancel.clone(),
            stats.clone(),
            do_func,
        ));

        Self {
            name,
            cancel,
            stats,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn success_count(&self) -> u64 {
        self.stats.success_count.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u64 {
        self.stats.failure_count.load(Ordering::SeqCst)
    }

    /// Cancel the controller and wait for the current run to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(controller = %self.name, "Controller task failed: {}", e);
        }
    }
}

async fn run_loop<F, Fut, E>(
    name: String,
    params: ControllerParams,
    cancel: CancellationToken,
    stats: Arc<ControllerStats>,
    do_func: F,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    debug!(controller = %name, interval = ?params.run_interval, "Starting controller");
    let mut consecutive_errors = 0u32;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let wait = match do_func().await {
            Ok(()) => {
                stats.success_count.fetch_add(1, Ordering::SeqCst);
                consecutive_errors = 0;
                if params.run_interval.is_zero() {
                    break;
                }
                params.run_interval
            }
            Err(e) => {
                stats.failure_count.fetch_add(1, Ordering::SeqCst);
                consecutive_errors = consecutive_errors.saturating_add(1);
                let backoff = params.backoff_duration(consecutive_errors);
                warn!(
                    controller = %name,
                    consecutive_errors,
                    retry_in = ?backoff,
                    "Controller run failed: {}", e
                );
                backoff
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    debug!(controller = %name, "Controller stopped");
}
