//! Registry of locally running endpoints
//!
//! Endpoints are indexed by their numeric ID and by every secondary
//! identifier (container ID, IP addresses, pod name, ...) they expose.
//! Both indices live behind one reader/writer lock; no method holds the
//! lock while calling back into an endpoint.

use crate::config::ManagerConfig;
use endpoint_core::id::{self, PrefixType};
use endpoint_core::notification::endpoint_create_repr;
use endpoint_core::{
    Endpoint, EndpointRef, EndpointRegistry, Error, IdAllocator, IdPool, Identifiers,
    NotificationKind, Owner, PolicyEndpoint, Result,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Snapshot of endpoints keyed by ID, exposed only through their policy view
pub type PolicyEndpoints = HashMap<u16, Arc<dyn PolicyEndpoint>>;

#[derive(Default)]
pub(crate) struct Indices {
    /// Primary index; at most one endpoint per ID
    pub(crate) endpoints: HashMap<u16, EndpointRef>,
    /// Secondary index; the last writer of a key wins
    pub(crate) endpoints_aux: HashMap<PrefixType, HashMap<String, EndpointRef>>,
}

impl Indices {
    fn lookup_aux(&self, prefix: PrefixType, key: &str) -> Option<EndpointRef> {
        self.endpoints_aux
            .get(&prefix)
            .and_then(|keys| keys.get(key))
            .cloned()
    }

    fn insert_aux(&mut self, mappings: &Identifiers, ep: &EndpointRef) {
        for (prefix, key) in mappings {
            self.endpoints_aux
                .entry(*prefix)
                .or_default()
                .insert(key.clone(), ep.clone());
        }
    }
}

/// EndpointManager maintains the collection of locally running endpoints
pub struct EndpointManager {
    indices: RwLock<Indices>,
    allocator: Arc<dyn IdAllocator>,
    /// Per-call cap on concurrent per-endpoint tasks of a bulk operation;
    /// 0 is unbounded
    pub(crate) max_inflight: usize,
}

impl EndpointManager {
    pub fn new(allocator: Arc<dyn IdAllocator>) -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            allocator,
            max_inflight: 0,
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(Arc::new(IdPool::default())).with_max_inflight(config.max_inflight)
    }

    /// Cap the number of concurrently running per-endpoint tasks of each
    /// bulk operation call. Concurrent calls are capped independently.
    /// 0 means unbounded.
    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    pub(crate) fn read_indices(&self) -> parking_lot::RwLockReadGuard<'_, Indices> {
        self.indices.read()
    }

    /// Reuse `curr_id` if nonzero, otherwise allocate a fresh ID
    pub fn allocate_id(&self, curr_id: u16) -> Result<u16> {
        if curr_id != 0 {
            self.allocator.reuse(curr_id)?;
            return Ok(curr_id);
        }

        match self.allocator.allocate() {
            0 => Err(Error::IdPoolExhausted),
            id => Ok(id),
        }
    }

    pub fn release_id(&self, id: u16) -> Result<()> {
        self.allocator.release(id)
    }

    /// Return the ID of `ep` to the pool
    pub fn release_endpoint_id(&self, ep: &dyn Endpoint) -> Result<()> {
        self.release_id(ep.id())
    }

    pub fn remove_id(&self, id: u16) {
        self.indices.write().endpoints.remove(&id);
    }

    pub fn update_id_reference(&self, ep: Option<EndpointRef>) {
        let Some(ep) = ep else {
            return;
        };
        self.indices.write().endpoints.insert(ep.id(), ep);
    }

    /// Point every key in `mappings` at `ep`, replacing previous occupants
    pub fn update_references(&self, mappings: &Identifiers, ep: EndpointRef) {
        self.indices.write().insert_aux(mappings, &ep);
    }

    pub fn update_all_references(&self, mappings: &Identifiers, ep: EndpointRef) {
        let mut indices = self.indices.write();
        indices.insert_aux(mappings, &ep);
        indices.endpoints.insert(ep.id(), ep);
    }

    pub fn remove_references(&self, mappings: &Identifiers) {
        let mut indices = self.indices.write();
        for (prefix, key) in mappings {
            if let Some(keys) = indices.endpoints_aux.get_mut(prefix) {
                keys.remove(key);
                if keys.is_empty() {
                    indices.endpoints_aux.remove(prefix);
                }
            }
        }
    }

    /// Look up an endpoint by compound identifier.
    ///
    /// A miss is `Ok(None)`. Cluster-wide IDs fail with
    /// [`Error::UnsupportedId`] and unknown prefixes with
    /// [`Error::InvalidPrefix`].
    pub fn lookup(&self, compound_id: &str) -> Result<Option<EndpointRef>> {
        let (prefix, value) = id::parse(compound_id)?;

        let indices = self.indices.read();
        match prefix {
            PrefixType::CiliumLocal => {
                let n = id::parse_endpoint_id(compound_id)?;
                Ok(indices.endpoints.get(&n).cloned())
            }
            PrefixType::CiliumGlobal => Err(Error::UnsupportedId),
            _ => Ok(indices.lookup_aux(prefix, value)),
        }
    }

    pub fn lookup_cilium_id(&self, id: u16) -> Option<EndpointRef> {
        self.indices.read().endpoints.get(&id).cloned()
    }

    pub fn lookup_container_id(&self, id: &str) -> Option<EndpointRef> {
        self.indices.read().lookup_aux(PrefixType::ContainerId, id)
    }

    pub fn lookup_docker_endpoint(&self, id: &str) -> Option<EndpointRef> {
        self.indices.read().lookup_aux(PrefixType::DockerEndpoint, id)
    }

    pub fn lookup_container_name(&self, name: &str) -> Option<EndpointRef> {
        self.indices.read().lookup_aux(PrefixType::ContainerName, name)
    }

    pub fn lookup_ipv4(&self, ipv4: &str) -> Option<EndpointRef> {
        self.indices.read().lookup_aux(PrefixType::Ipv4, ipv4)
    }

    pub fn lookup_ipv6(&self, ipv6: &str) -> Option<EndpointRef> {
        self.indices.read().lookup_aux(PrefixType::Ipv6, ipv6)
    }

    /// Look up by address; IPv4-mapped IPv6 addresses resolve as IPv4
    pub fn lookup_ip(&self, ip: IpAddr) -> Option<EndpointRef> {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        let indices = self.indices.read();
        match ip {
            IpAddr::V4(v4) => indices.lookup_aux(PrefixType::Ipv4, &v4.to_string()),
            IpAddr::V6(v6) => indices.lookup_aux(PrefixType::Ipv6, &v6.to_string()),
        }
    }

    /// Look up by `namespace/pod`
    pub fn lookup_pod_name(&self, name: &str) -> Option<EndpointRef> {
        self.indices.read().lookup_aux(PrefixType::PodName, name)
    }

    pub fn endpoint_exists(&self, id: u16) -> bool {
        self.lookup_cilium_id(id).is_some()
    }

    pub fn endpoint_count(&self) -> usize {
        self.indices.read().endpoints.len()
    }

    /// Copy of all registered endpoints, independent of later mutation
    pub fn get_endpoints(&self) -> Vec<EndpointRef> {
        self.indices.read().endpoints.values().cloned().collect()
    }

    pub fn get_policy_endpoints(&self) -> PolicyEndpoints {
        self.indices
            .read()
            .endpoints
            .iter()
            .map(|(id, ep)| (*id, ep.clone().as_policy_endpoint()))
            .collect()
    }

    /// Whether any endpoint shares the global connection-tracking table
    pub fn has_global_ct(&self) -> bool {
        self.get_endpoints().iter().any(|ep| !ep.conntrack_local())
    }

    /// Start managing a prepared endpoint that has no ID yet
    pub fn add_endpoint(&self, owner: &dyn Owner, ep: EndpointRef, reason: &str) -> Result<()> {
        if ep.id() != 0 {
            return Err(Error::IdAlreadySet(ep.id()));
        }
        ep.expose(self)?;
        info!(endpoint_id = ep.id(), container_id = %ep.short_container_id(), reason, "New endpoint");

        match endpoint_create_repr(ep.as_ref(), reason) {
            Ok(repr) => owner.send_notification(NotificationKind::EndpointCreated, repr),
            Err(e) => debug!(endpoint_id = ep.id(), error = %e, "Skipping endpoint creation notification"),
        }
        Ok(())
    }

    /// Wait until the removal of `ep` from this manager has completed
    pub async fn wait_endpoint_removed(&self, ep: &dyn Endpoint) {
        ep.unexpose(self).await;
    }

    /// Drop every endpoint and reset the ID pool
    pub fn remove_all(&self) {
        let mut indices = self.indices.write();
        self.allocator.reallocate_pool();
        *indices = Indices::default();
    }
}

impl Default for EndpointManager {
    fn default() -> Self {
        Self::new(Arc::new(IdPool::default()))
    }
}

impl EndpointRegistry for EndpointManager {
    fn allocate_id(&self, curr_id: u16) -> Result<u16> {
        EndpointManager::allocate_id(self, curr_id)
    }

    fn release_id(&self, id: u16) -> Result<()> {
        EndpointManager::release_id(self, id)
    }

    fn update_id_reference(&self, ep: Option<EndpointRef>) {
        EndpointManager::update_id_reference(self, ep)
    }

    fn update_references(&self, mappings: &Identifiers, ep: EndpointRef) {
        EndpointManager::update_references(self, mappings, ep)
    }

    fn update_all_references(&self, mappings: &Identifiers, ep: EndpointRef) {
        EndpointManager::update_all_references(self, mappings, ep)
    }

    fn remove_references(&self, mappings: &Identifiers) {
        EndpointManager::remove_references(self, mappings)
    }

    fn remove_id(&self, id: u16) {
        EndpointManager::remove_id(self, id)
    }
}
