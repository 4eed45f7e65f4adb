//! Mark-and-sweep garbage collection of stray endpoints

use crate::controller::{Controller, ControllerParams};
use crate::manager::EndpointManager;
use async_trait::async_trait;
use endpoint_core::{Endpoint, EndpointRef, PolicyEndpoint, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Name of the GC controller
pub const ENDPOINT_GC_CONTROLLER: &str = "endpoint-gc";

/// Verifies whether an endpoint is still backed by a running workload
#[async_trait]
pub trait EndpointChecker: Send + Sync {
    /// Called with the registry read lock held; must not call back into the manager
    fn check(&self, ep: &dyn Endpoint) -> Result<()>;

    /// Remove a stray endpoint. Returns the number of errors encountered.
    async fn delete_endpoint(&self, ep: EndpointRef) -> usize;
}

/// An endpoint that failed a check, remembered until the next run
type Mark = (u16, Weak<dyn Endpoint>);

/// Two-phase collector: endpoints failing the check in one run are removed
/// only if they fail again in the next run.
pub struct EndpointGc {
    manager: Arc<EndpointManager>,
    checker: Arc<dyn EndpointChecker>,
    /// Endpoints marked by the previous run. Only `mark_and_sweep` writes
    /// this, and runs never overlap. Held weakly so that marking never keeps
    /// a removed endpoint alive.
    marked: Mutex<Vec<Mark>>,
}

impl EndpointGc {
    pub fn new(manager: Arc<EndpointManager>, checker: Arc<dyn EndpointChecker>) -> Self {
        Self {
            manager,
            checker,
            marked: Mutex::new(Vec::new()),
        }
    }

    /// IDs awaiting the next sweep
    pub fn marked(&self) -> Vec<u16> {
        self.marked.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Mark endpoints failing the check now, then sweep the ones that were
    /// also marked by the previous run. Always succeeds so that removal
    /// problems never make the controller run more often.
    ///
    /// Marks match on endpoint identity, not only on ID: an ID released and
    /// reissued to a new endpoint between two runs does not carry the old
    /// endpoint's mark.
    pub async fn mark_and_sweep(&self) -> Result<()> {
        let failing = self.mark_endpoints();
        let marks: Vec<Mark> = failing
            .iter()
            .map(|(id, ep)| (*id, Arc::downgrade(ep)))
            .collect();
        let previous = std::mem::replace(&mut *self.marked.lock(), marks);

        let to_sweep: Vec<EndpointRef> = failing
            .into_iter()
            .filter(|(id, ep)| {
                previous.iter().any(|(prev_id, prev)| {
                    prev_id == id && prev.upgrade().is_some_and(|prev| Arc::ptr_eq(&prev, ep))
                })
            })
            .map(|(_, ep)| ep)
            .collect();
        self.sweep_endpoints(to_sweep).await;
        Ok(())
    }

    fn mark_endpoints(&self) -> Vec<(u16, EndpointRef)> {
        let indices = self.manager.read_indices();
        let mut needs_gc = Vec::with_capacity(indices.endpoints.len());
        for (id, ep) in &indices.endpoints {
            if let Err(e) = self.checker.check(&**ep) {
                debug!(endpoint_id = id, error = %e, "Endpoint failed health check");
                needs_gc.push((*id, ep.clone()));
            }
        }
        needs_gc
    }

    async fn sweep_endpoints(&self, marked: Vec<EndpointRef>) {
        // Marked endpoints may be gone by now. Keep the ones still
        // registered under their ID and drop the lock before deleting, since
        // deletion takes it again.
        let to_sweep: Vec<EndpointRef> = {
            let indices = self.manager.read_indices();
            marked
                .into_iter()
                .filter(|ep| {
                    indices
                        .endpoints
                        .get(&ep.id())
                        .is_some_and(|current| Arc::ptr_eq(current, ep))
                })
                .collect()
        };

        for ep in to_sweep {
            warn!(
                endpoint_id = %ep.string_id(),
                container_id = %ep.short_container_id(),
                pod_name = %ep.pod_name().unwrap_or_default(),
                "Stray endpoint found, removing it"
            );
            let errors = self.checker.delete_endpoint(ep.clone()).await;
            if errors > 0 {
                debug!(endpoint_id = ep.id(), errors, "Stray endpoint removal reported errors");
            }
        }
    }
}

impl EndpointManager {
    /// Periodically garbage collect endpoints failing `checker`
    pub fn with_periodic_endpoint_gc(
        self: &Arc<Self>,
        cancel: CancellationToken,
        checker: Arc<dyn EndpointChecker>,
        interval: Duration,
        error_retry_base: Duration,
    ) -> Controller {
        let gc = Arc::new(EndpointGc::new(self.clone(), checker));
        Controller::spawn(
            ENDPOINT_GC_CONTROLLER,
            ControllerParams {
                run_interval: interval,
                error_retry_base,
            },
            cancel,
            move || {
                let gc = gc.clone();
                async move { gc.mark_and_sweep().await }
            },
        )
    }
}
