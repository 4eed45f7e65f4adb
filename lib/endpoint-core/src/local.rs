//! An endpoint without a datapath
//!
//! `LocalEndpoint` tracks identity, liveness and policy revisions in memory.
//! Regeneration realizes the most recently bumped policy revision and proxy
//! acknowledgements complete immediately.

use crate::completion::WaitGroup;
use crate::endpoint::{
    Endpoint, EndpointRef, EndpointRegistry, Identifiers, PolicyEndpoint, RegenerationMetadata,
    RevisionCallback,
};
use crate::id::PrefixType;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identity of a [`LocalEndpoint`]
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub docker_endpoint_id: Option<String>,
    /// `namespace/pod`
    #[serde(default)]
    pub pod_name: Option<String>,
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default)]
    pub conntrack_local: bool,
}

/// Whether `id` can name a single entry of a directory: non-empty, no path
/// separators, not `.` or `..`
pub fn is_valid_container_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
}

impl EndpointSpec {
    /// Reject identities that other components cannot use as-is
    pub fn validate(&self) -> Result<()> {
        match &self.container_id {
            Some(id) if !is_valid_container_id(id) => {
                Err(Error::Endpoint(format!("invalid container ID {:?}", id)))
            }
            _ => Ok(()),
        }
    }
}

pub struct LocalEndpoint {
    this: Weak<LocalEndpoint>,
    id: AtomicU16,
    spec: EndpointSpec,
    alive: AtomicBool,
    desired_revision: AtomicU64,
    realized_revision: watch::Sender<u64>,
    regenerations: AtomicUsize,
    policy_map_syncs: AtomicUsize,
}

impl LocalEndpoint {
    pub fn new(spec: EndpointSpec) -> Arc<Self> {
        let (realized_revision, _) = watch::channel(0);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            id: AtomicU16::new(0),
            spec,
            alive: AtomicBool::new(true),
            desired_revision: AtomicU64::new(0),
            realized_revision,
            regenerations: AtomicUsize::new(0),
            policy_map_syncs: AtomicUsize::new(0),
        })
    }

    pub fn spec(&self) -> &EndpointSpec {
        &self.spec
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Number of completed regenerations
    pub fn regenerations(&self) -> usize {
        self.regenerations.load(Ordering::SeqCst)
    }

    /// Number of policy map updates applied
    pub fn policy_map_syncs(&self) -> usize {
        self.policy_map_syncs.load(Ordering::SeqCst)
    }

    /// Mark `rev` as realized without a regeneration
    pub fn set_policy_revision(&self, rev: u64) {
        self.realized_revision.send_modify(|current| {
            if rev > *current {
                *current = rev;
            }
        });
    }

    fn handle(&self) -> Result<EndpointRef> {
        let this: EndpointRef = self
            .this
            .upgrade()
            .ok_or_else(|| Error::Endpoint("endpoint is being dropped".to_string()))?;
        Ok(this)
    }
}

impl PolicyEndpoint for LocalEndpoint {
    fn id(&self) -> u16 {
        self.id.load(Ordering::SeqCst)
    }

    fn policy_revision(&self) -> u64 {
        *self.realized_revision.borrow()
    }

    fn policy_revision_bump(&self, rev: u64) {
        self.desired_revision.fetch_max(rev, Ordering::SeqCst);
    }
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    fn container_id(&self) -> Option<String> {
        self.spec.container_id.clone()
    }

    fn pod_name(&self) -> Option<String> {
        self.spec.pod_name.clone()
    }

    fn identifiers(&self) -> Identifiers {
        let mut ids = Identifiers::new();
        if let Some(id) = &self.spec.container_id {
            ids.insert(PrefixType::ContainerId, id.clone());
        }
        if let Some(name) = &self.spec.container_name {
            ids.insert(PrefixType::ContainerName, name.clone());
        }
        if let Some(id) = &self.spec.docker_endpoint_id {
            ids.insert(PrefixType::DockerEndpoint, id.clone());
        }
        if let Some(name) = &self.spec.pod_name {
            ids.insert(PrefixType::PodName, name.clone());
        }
        if let Some(ip) = self.spec.ipv4 {
            ids.insert(PrefixType::Ipv4, ip.to_string());
        }
        if let Some(ip) = self.spec.ipv6 {
            ids.insert(PrefixType::Ipv6, ip.to_string());
        }
        ids
    }

    fn conntrack_local(&self) -> bool {
        self.spec.conntrack_local
    }

    fn as_policy_endpoint(self: Arc<Self>) -> Arc<dyn PolicyEndpoint> {
        self
    }

    fn expose(&self, registry: &dyn EndpointRegistry) -> Result<()> {
        let this = self.handle()?;
        let curr_id = self.id();
        let id = registry.allocate_id(curr_id)?;
        if let Err(actual) = self
            .id
            .compare_exchange(curr_id, id, Ordering::SeqCst, Ordering::SeqCst)
        {
            // A concurrent registration of this endpoint got there first.
            if curr_id == 0 {
                if let Err(e) = registry.release_id(id) {
                    warn!(endpoint_id = id, error = %e, "Unable to release endpoint ID");
                }
            }
            return Err(Error::IdAlreadySet(actual));
        }

        registry.update_all_references(&self.identifiers(), this);
        debug!(endpoint_id = id, container_id = %self.short_container_id(), "Endpoint exposed");
        Ok(())
    }

    async fn unexpose(&self, registry: &dyn EndpointRegistry) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        let id = self.id();
        registry.remove_references(&self.identifiers());
        if id != 0 {
            registry.remove_id(id);
            if let Err(e) = registry.release_id(id) {
                warn!(endpoint_id = id, error = %e, "Unable to release endpoint ID");
            }
        }
        debug!(endpoint_id = id, "Endpoint unexposed");
    }

    async fn apply_policy_map_changes(&self, proxy_wait_group: &WaitGroup) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        // No proxy redirects to program; acknowledge right away.
        proxy_wait_group.add_completion().complete(Ok(()));
        self.policy_map_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn regenerate_if_alive(&self, metadata: &RegenerationMetadata) -> bool {
        if !self.is_alive() {
            debug!(endpoint_id = self.id(), reason = %metadata.reason, "Skipping regeneration of dead endpoint");
            return false;
        }
        self.set_policy_revision(self.desired_revision.load(Ordering::SeqCst));
        self.regenerations.fetch_add(1, Ordering::SeqCst);
        debug!(
            endpoint_id = self.id(),
            reason = %metadata.reason,
            level = ?metadata.level,
            "Regenerated endpoint"
        );
        true
    }

    fn wait_for_policy_revision(
        &self,
        cancel: CancellationToken,
        rev: u64,
        done: Option<RevisionCallback>,
    ) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut revision = self.realized_revision.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                reached = async { revision.wait_for(|r| *r >= rev).await.is_ok() } => {
                    if let (true, Some(done)) = (reached, done) {
                        done(Instant::now());
                    }
                }
            }
            let _ = tx.send(());
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec() -> EndpointSpec {
        EndpointSpec {
            container_id: Some("0123456789abcdef".to_string()),
            pod_name: Some("default/web".to_string()),
            ipv4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            ..Default::default()
        }
    }

    #[test]
    fn test_identifiers() {
        let ep = LocalEndpoint::new(spec());
        let ids = ep.identifiers();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[&PrefixType::Ipv4], "10.0.0.1");
        assert_eq!(ep.short_container_id(), "0123456789");
        assert_eq!(ep.string_id(), "cilium-local:0");
    }

    #[test]
    fn test_spec_from_json() {
        let spec: EndpointSpec =
            serde_json::from_str(r#"{"containerId":"abc","ipv6":"fd00::1"}"#).unwrap();
        assert_eq!(spec.container_id.as_deref(), Some("abc"));
        assert_eq!(spec.ipv6, Some("fd00::1".parse().unwrap()));
        assert!(!spec.conntrack_local);
    }

    #[test]
    fn test_validate_container_id() {
        assert!(spec().validate().is_ok());
        assert!(EndpointSpec::default().validate().is_ok());
        for bad in ["", ".", "..", "/", "../etc", "a/b", "a\\b"] {
            let spec = EndpointSpec {
                container_id: Some(bad.to_string()),
                ..Default::default()
            };
            assert!(spec.validate().is_err(), "{:?} accepted", bad);
        }
    }

    #[tokio::test]
    async fn test_regenerate_realizes_desired_revision() {
        let ep = LocalEndpoint::new(spec());
        ep.policy_revision_bump(4);
        assert_eq!(ep.policy_revision(), 0);

        let meta = RegenerationMetadata::new("test", crate::RegenerationLevel::WithoutDatapath);
        assert!(ep.regenerate_if_alive(&meta).await);
        assert_eq!(ep.policy_revision(), 4);
        assert_eq!(ep.regenerations(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_policy_revision_callback() {
        let ep = LocalEndpoint::new(spec());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let done: RevisionCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let rx = ep.wait_for_policy_revision(CancellationToken::new(), 2, Some(done));
        ep.set_policy_revision(2);
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_for_policy_revision_cancelled() {
        let ep = LocalEndpoint::new(spec());
        let cancel = CancellationToken::new();
        let rx = ep.wait_for_policy_revision(cancel.clone(), 10, None);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ep.policy_revision(), 0);
    }
}
