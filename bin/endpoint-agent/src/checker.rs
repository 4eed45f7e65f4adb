//! Endpoint health checking against the container runtime

use async_trait::async_trait;
use endpoint_core::notification::EndpointNotification;
use endpoint_core::{
    is_valid_container_id, Endpoint, EndpointRef, Error, NotificationKind, Owner, Result,
};
use endpoint_manager::{EndpointChecker, EndpointManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Treats an endpoint as stale once its container has no task directory
/// left in the runtime state directory. Endpoints without a container ID
/// are always healthy.
pub struct RuntimeChecker {
    state_dir: PathBuf,
    manager: Arc<EndpointManager>,
    owner: Arc<dyn Owner>,
}

impl RuntimeChecker {
    pub fn new(state_dir: PathBuf, manager: Arc<EndpointManager>, owner: Arc<dyn Owner>) -> Self {
        Self {
            state_dir,
            manager,
            owner,
        }
    }
}

#[async_trait]
impl EndpointChecker for RuntimeChecker {
    fn check(&self, ep: &dyn Endpoint) -> Result<()> {
        let Some(container_id) = ep.container_id() else {
            return Ok(());
        };
        // Anything that is not a single directory entry could resolve
        // outside the state directory.
        if !is_valid_container_id(&container_id) {
            return Err(Error::Endpoint(format!(
                "invalid container ID {:?}",
                container_id
            )));
        }
        if self.state_dir.join(&container_id).exists() {
            Ok(())
        } else {
            Err(Error::Endpoint(format!(
                "container {} is not running",
                container_id
            )))
        }
    }

    async fn delete_endpoint(&self, ep: EndpointRef) -> usize {
        ep.unexpose(&*self.manager).await;
        debug!(endpoint_id = %ep.string_id(), "Deleted stray endpoint");

        match EndpointNotification::new(&*ep, "endpoint garbage collected").to_repr() {
            Ok(repr) => {
                self.owner
                    .send_notification(NotificationKind::EndpointDeleted, repr);
                0
            }
            Err(e) => {
                warn!(error = %e, "Unable to build endpoint deletion notification");
                1
            }
        }
    }
}
