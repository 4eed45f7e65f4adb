//! Endpoint capability surface
//!
//! The registry never owns endpoint state; it only holds shared references
//! and drives endpoints through the traits below.
use crate::completion::WaitGroup;
use crate::id::{new_cilium_id, PrefixType};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub type EndpointRef = Arc<dyn Endpoint>;

/// Secondary identifiers of an endpoint, keyed by prefix type
pub type Identifiers = HashMap<PrefixType, String>;

/// Invoked once per endpoint when it reaches a requested policy revision.
/// Must not block.
pub type RevisionCallback = Arc<dyn Fn(Instant) + Send + Sync>;

/// How much of the datapath a regeneration should rebuild
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegenerationLevel {
    WithoutDatapath,
    WithDatapathLoad,
    WithDatapathRewrite,
    WithDatapathRebuild,
}

/// Regeneration request shared by every endpoint of a bulk regeneration
#[derive(Clone, Debug)]
pub struct RegenerationMetadata {
    pub reason: String,
    pub level: RegenerationLevel,
}

impl RegenerationMetadata {
    pub fn new(reason: impl Into<String>, level: RegenerationLevel) -> Self {
        Self {
            reason: reason.into(),
            level,
        }
    }
}

/// The view of an endpoint needed by policy computation
pub trait PolicyEndpoint: Send + Sync {
    fn id(&self) -> u16;

    /// Policy revision currently realized in the datapath
    fn policy_revision(&self) -> u64;

    /// Record that policy up to `rev` has been computed for this endpoint
    fn policy_revision_bump(&self, rev: u64);
}

/// Registry operations an endpoint uses to expose and unexpose itself
pub trait EndpointRegistry: Send + Sync {
    /// Reuse `curr_id` if nonzero, otherwise allocate a fresh ID
    fn allocate_id(&self, curr_id: u16) -> Result<u16>;

    fn release_id(&self, id: u16) -> Result<()>;

    fn update_id_reference(&self, ep: Option<EndpointRef>);

    fn update_references(&self, mappings: &Identifiers, ep: EndpointRef);

    /// Insert the primary entry and all secondary keys in one critical section
    fn update_all_references(&self, mappings: &Identifiers, ep: EndpointRef);

    fn remove_references(&self, mappings: &Identifiers);

    fn remove_id(&self, id: u16);
}

/// A locally running endpoint as seen by the registry
#[async_trait]
pub trait Endpoint: PolicyEndpoint {
    /// Compound identifier of the numeric ID
    fn string_id(&self) -> String {
        new_cilium_id(self.id())
    }

    fn container_id(&self) -> Option<String>;

    /// First 10 characters of the container ID, for log output
    fn short_container_id(&self) -> String {
        self.container_id()
            .map(|id| id.chars().take(10).collect())
            .unwrap_or_default()
    }

    /// `namespace/pod` of the owning pod, if any
    fn pod_name(&self) -> Option<String>;

    /// All secondary identifiers this endpoint is reachable by
    fn identifiers(&self) -> Identifiers;

    /// Whether the endpoint uses its own connection-tracking table
    fn conntrack_local(&self) -> bool;

    fn as_policy_endpoint(self: Arc<Self>) -> Arc<dyn PolicyEndpoint>;

    /// Allocate an ID and publish this endpoint into `registry`
    fn expose(&self, registry: &dyn EndpointRegistry) -> Result<()>;

    /// Withdraw this endpoint from `registry` and release its ID
    async fn unexpose(&self, registry: &dyn EndpointRegistry);

    /// Push pending policy map changes, registering proxy acknowledgements
    /// with `proxy_wait_group`
    async fn apply_policy_map_changes(&self, proxy_wait_group: &WaitGroup) -> Result<()>;

    /// Regenerate unless the endpoint is being torn down. Returns whether a
    /// regeneration happened.
    async fn regenerate_if_alive(&self, metadata: &RegenerationMetadata) -> bool;

    /// Resolve once the realized policy revision reaches `rev` or `cancel`
    /// fires. `done` is called only when the revision is reached.
    fn wait_for_policy_revision(
        &self,
        cancel: CancellationToken,
        rev: u64,
        done: Option<RevisionCallback>,
    ) -> oneshot::Receiver<()>;
}
