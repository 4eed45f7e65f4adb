//! Bulk operations fanned out over every registered endpoint
//!
//! Each operation snapshots the registry, dispatches one task per endpoint
//! and returns at once with a [`SyncHandle`] completing when all tasks have
//! finished. Endpoints registered after the snapshot are not included.

use crate::manager::EndpointManager;
use endpoint_core::{
    Endpoint, EndpointRef, Error, PolicyEndpoint, RegenerationMetadata, Result, RevisionCallback,
    WaitGroup,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Completion handle of a bulk operation running in the background
#[derive(Debug)]
pub struct SyncHandle {
    inner: JoinHandle<()>,
}

impl SyncHandle {
    fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: tokio::spawn(fut),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Wait until every per-endpoint task has finished
    pub async fn wait(self) {
        if let Err(e) = self.inner.await {
            warn!("Bulk endpoint operation failed: {}", e);
        }
    }
}

/// Spawn `op` for every endpoint, at most `max_inflight` at a time (0 is
/// unbounded)
fn fan_out<F, Fut>(max_inflight: usize, eps: Vec<EndpointRef>, op: F) -> JoinSet<()>
where
    F: Fn(EndpointRef) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let inflight = (max_inflight > 0).then(|| Arc::new(Semaphore::new(max_inflight)));
    let mut tasks = JoinSet::new();
    for ep in eps {
        let permits = inflight.clone();
        let task = op(ep);
        tasks.spawn(async move {
            let _permit = match permits {
                Some(permits) => permits.acquire_owned().await.ok(),
                None => None,
            };
            task.await;
        });
    }
    tasks
}

async fn join_all(mut tasks: JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!("Endpoint task failed: {}", e);
        }
    }
}

/// Block until all proxy changes have been acknowledged
async fn wait_for_proxy_completions(proxy_wait_group: &WaitGroup) -> Result<()> {
    if proxy_wait_group.cancellation().is_cancelled() {
        return Err(Error::ProxyUpdate(
            "context cancelled before waiting for proxy updates".to_string(),
        ));
    }

    let start = Instant::now();
    debug!("Waiting for proxy updates to complete...");
    proxy_wait_group
        .wait()
        .await
        .map_err(|e| Error::ProxyUpdate(e.to_string()))?;
    debug!("Wait time for proxy updates: {:?}", start.elapsed());

    Ok(())
}

impl EndpointManager {
    /// Apply pending policy map changes on every endpoint, then wait for the
    /// proxy to acknowledge them.
    ///
    /// Failures are logged and left to the next policy update to fix.
    pub fn update_policy_maps(&self, cancel: CancellationToken) -> SyncHandle {
        let proxy_wait_group = Arc::new(WaitGroup::new(cancel));
        let eps = self.get_endpoints();

        let tasks = fan_out(self.max_inflight, eps, |ep| {
            let proxy_wait_group = proxy_wait_group.clone();
            async move {
                if let Err(e) = ep.apply_policy_map_changes(&proxy_wait_group).await {
                    warn!(
                        endpoint_id = ep.id(),
                        error = %e,
                        "Failed to apply policy map changes. These will be re-applied in future updates."
                    );
                }
            }
        });

        SyncHandle::spawn(async move {
            // All endpoints must have applied their changes before the
            // acknowledgements are awaited.
            join_all(tasks).await;
            if let Err(e) = wait_for_proxy_completions(&proxy_wait_group).await {
                warn!(
                    error = %e,
                    "Failed to apply L7 proxy policy changes. These will be re-applied in future updates."
                );
            }
        })
    }

    /// Regenerate every endpoint that is still alive
    pub fn regenerate_all_endpoints(&self, metadata: RegenerationMetadata) -> SyncHandle {
        let eps = self.get_endpoints();
        info!(reason = %metadata.reason, endpoints = eps.len(), "Regenerating all endpoints");

        let metadata = Arc::new(metadata);
        let tasks = fan_out(self.max_inflight, eps, |ep| {
            let metadata = metadata.clone();
            async move {
                ep.regenerate_if_alive(&metadata).await;
            }
        });

        SyncHandle::spawn(join_all(tasks))
    }

    /// Wait until every endpoint present now has realized policy revision
    /// `rev`. Endpoints added while waiting are ignored.
    pub async fn wait_for_endpoints_at_policy_rev(
        &self,
        cancel: &CancellationToken,
        rev: u64,
    ) -> Result<()> {
        let eps = self.get_endpoints();
        for ep in eps {
            let reached = ep.wait_for_policy_revision(cancel.clone(), rev, None);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = reached => {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
        Ok(())
    }

    /// Register `done` on every endpoint present now; it runs independently
    /// for each endpoint reaching policy revision `rev`. `done` must not block.
    pub fn callback_for_endpoints_at_policy_rev(
        &self,
        cancel: &CancellationToken,
        rev: u64,
        done: RevisionCallback,
    ) -> Result<()> {
        for ep in self.get_endpoints() {
            // Only the callback matters; the completion signal is not needed.
            drop(ep.wait_for_policy_revision(cancel.clone(), rev, Some(done.clone())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::add;
    use async_trait::async_trait;
    use endpoint_core::{
        Completion, EndpointRegistry, Identifiers, LocalEndpoint, RegenerationLevel,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn regen() -> RegenerationMetadata {
        RegenerationMetadata::new("policy change", RegenerationLevel::WithDatapathRewrite)
    }

    /// Concurrent and peak number of regenerations in progress
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    /// Endpoint that can hold its proxy acknowledgement until released by the
    /// test, and that records how many regenerations overlap
    struct TestEndpoint {
        inner: Arc<LocalEndpoint>,
        hold_proxy_ack: bool,
        held: Mutex<Option<Completion>>,
        regenerating: Arc<Gauge>,
    }

    impl TestEndpoint {
        fn register(
            mgr: &EndpointManager,
            name: &str,
            ipv4: [u8; 4],
            hold_proxy_ack: bool,
            regenerating: Arc<Gauge>,
        ) -> Arc<Self> {
            let ep = Arc::new(Self {
                inner: LocalEndpoint::new(crate::manager::tests::spec(name, ipv4)),
                hold_proxy_ack,
                held: Mutex::new(None),
                regenerating,
            });
            // The inner endpoint exposes itself; route the wrapper in directly.
            ep.inner.expose(mgr).unwrap();
            mgr.update_id_reference(Some(ep.clone()));
            ep
        }
    }

    impl PolicyEndpoint for TestEndpoint {
        fn id(&self) -> u16 {
            self.inner.id()
        }
        fn policy_revision(&self) -> u64 {
            self.inner.policy_revision()
        }
        fn policy_revision_bump(&self, rev: u64) {
            self.inner.policy_revision_bump(rev)
        }
    }

    #[async_trait]
    impl Endpoint for TestEndpoint {
        fn container_id(&self) -> Option<String> {
            self.inner.container_id()
        }
        fn pod_name(&self) -> Option<String> {
            self.inner.pod_name()
        }
        fn identifiers(&self) -> Identifiers {
            self.inner.identifiers()
        }
        fn conntrack_local(&self) -> bool {
            true
        }
        fn as_policy_endpoint(self: Arc<Self>) -> Arc<dyn PolicyEndpoint> {
            self
        }
        fn expose(&self, registry: &dyn EndpointRegistry) -> Result<()> {
            self.inner.expose(registry)
        }
        async fn unexpose(&self, registry: &dyn EndpointRegistry) {
            self.inner.unexpose(registry).await
        }
        async fn apply_policy_map_changes(&self, proxy_wait_group: &WaitGroup) -> Result<()> {
            if !self.hold_proxy_ack {
                return self.inner.apply_policy_map_changes(proxy_wait_group).await;
            }
            *self.held.lock() = Some(proxy_wait_group.add_completion());
            Ok(())
        }
        async fn regenerate_if_alive(&self, metadata: &RegenerationMetadata) -> bool {
            let now = self.regenerating.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.regenerating.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            let regenerated = self.inner.regenerate_if_alive(metadata).await;
            self.regenerating.current.fetch_sub(1, Ordering::SeqCst);
            regenerated
        }
        fn wait_for_policy_revision(
            &self,
            cancel: CancellationToken,
            rev: u64,
            done: Option<RevisionCallback>,
        ) -> oneshot::Receiver<()> {
            self.inner.wait_for_policy_revision(cancel, rev, done)
        }
    }

    #[tokio::test]
    async fn test_update_policy_maps() {
        let mgr = EndpointManager::default();
        let eps: Vec<_> = (1..=5u8)
            .map(|i| add(&mgr, &format!("ep{}", i), [10, 0, 0, i]))
            .collect();

        mgr.update_policy_maps(CancellationToken::new()).wait().await;
        for ep in &eps {
            assert_eq!(ep.policy_map_syncs(), 1);
        }
    }

    #[tokio::test]
    async fn test_update_policy_maps_waits_for_proxy_ack() {
        let mgr = EndpointManager::default();
        let slow = TestEndpoint::register(&mgr, "slow", [10, 0, 0, 1], true, Arc::default());

        let handle = mgr.update_policy_maps(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        let completion = slow.held.lock().take().expect("no completion registered");
        completion.complete(Ok(()));
        tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("policy map update did not finish");
    }

    #[tokio::test]
    async fn test_update_policy_maps_cancelled_still_completes() {
        let mgr = EndpointManager::default();
        let slow = TestEndpoint::register(&mgr, "slow", [10, 0, 0, 1], true, Arc::default());

        let cancel = CancellationToken::new();
        let handle = mgr.update_policy_maps(cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("cancelled policy map update did not finish");
    }

    #[tokio::test]
    async fn test_regenerate_all_endpoints() {
        let mgr = EndpointManager::default().with_max_inflight(2);
        let eps: Vec<_> = (1..=6u8)
            .map(|i| add(&mgr, &format!("ep{}", i), [10, 0, 0, i]))
            .collect();

        // Dead endpoints are skipped but still count towards completion.
        eps[0].unexpose(&mgr).await;
        mgr.update_id_reference(Some(eps[0].clone()));

        mgr.regenerate_all_endpoints(regen()).wait().await;
        assert_eq!(eps[0].regenerations(), 0);
        for ep in &eps[1..] {
            assert_eq!(ep.regenerations(), 1);
        }
    }

    #[tokio::test]
    async fn test_max_inflight_caps_each_call() {
        let mgr = EndpointManager::default().with_max_inflight(2);
        let gauge = Arc::new(Gauge::default());
        let eps: Vec<_> = (1..=8u8)
            .map(|i| TestEndpoint::register(&mgr, &format!("ep{}", i), [10, 0, 0, i], false, gauge.clone()))
            .collect();

        mgr.regenerate_all_endpoints(regen()).wait().await;
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        for ep in &eps {
            assert_eq!(ep.inner.regenerations(), 1);
        }

        // Two calls in flight each get their own cap.
        gauge.peak.store(0, Ordering::SeqCst);
        let first = mgr.regenerate_all_endpoints(regen());
        let second = mgr.regenerate_all_endpoints(regen());
        first.wait().await;
        second.wait().await;
        assert!(gauge.peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unbounded_fan_out() {
        let mgr = EndpointManager::default();
        let gauge = Arc::new(Gauge::default());
        for i in 1..=4u8 {
            TestEndpoint::register(&mgr, &format!("ep{}", i), [10, 0, 0, i], false, gauge.clone());
        }

        mgr.regenerate_all_endpoints(regen()).wait().await;
        assert!(gauge.peak.load(Ordering::SeqCst) > 2);
    }

    #[tokio::test]
    async fn test_wait_for_endpoints_at_policy_rev() {
        let mgr = Arc::new(EndpointManager::default());
        let eps: Vec<_> = (1..=3u8)
            .map(|i| add(&mgr, &format!("ep{}", i), [10, 0, 0, i]))
            .collect();
        for ep in &eps {
            ep.policy_revision_bump(7);
        }

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.wait_for_endpoints_at_policy_rev(&CancellationToken::new(), 7)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Registered after the wait began and never reaches revision 7.
        add(&mgr, "late", [10, 0, 0, 9]);

        mgr.regenerate_all_endpoints(regen()).wait().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait did not finish")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_policy_rev_cancelled() {
        let mgr = EndpointManager::default();
        add(&mgr, "ep1", [10, 0, 0, 1]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            mgr.wait_for_endpoints_at_policy_rev(&cancel, 100),
        )
        .await
        .expect("cancelled wait blocked");
        assert_eq!(result, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_for_policy_rev_cancelled_while_waiting() {
        let mgr = Arc::new(EndpointManager::default());
        add(&mgr, "ep1", [10, 0, 0, 1]);

        let cancel = CancellationToken::new();
        let waiter = {
            let mgr = mgr.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { mgr.wait_for_endpoints_at_policy_rev(&cancel, 100).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled wait blocked")
            .unwrap();
        assert_eq!(result, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_callback_for_endpoints_at_policy_rev() {
        let mgr = EndpointManager::default();
        let eps: Vec<_> = (1..=4u8)
            .map(|i| add(&mgr, &format!("ep{}", i), [10, 0, 0, i]))
            .collect();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let done: RevisionCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        });

        mgr.callback_for_endpoints_at_policy_rev(&CancellationToken::new(), 3, done)
            .unwrap();

        // Only two endpoints reach the revision.
        eps[0].set_policy_revision(3);
        eps[2].set_policy_revision(5);
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("callback not invoked");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
