//! Per-session context threaded through the engines.
//!
//! Bundles the store session, its executor, the session cancellation token
//! and the group layout, and exposes the typed group operations the state
//! machine and both engines are written against.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use rebalancer_common::{
    AssignmentRecord, ClientId, GroupId, RebalancerError, ResourceId, Result, CLIENT_NODE_PREFIX,
};
use rebalancer_store::{
    CoordinationStore, GroupPaths, ResilientExecutor, SessionState, StoreError, Version, Watch,
    WatchEvent, WatchEventKind,
};

use crate::config::ClientConfig;
use crate::metrics::RebalanceMetrics;

/// How an engine loop ended.
#[derive(Debug)]
pub struct EngineExit<R> {
    /// Classified exit reason.
    pub reason: R,
    /// Underlying error, when the exit was caused by one.
    pub cause: Option<RebalancerError>,
}

impl<R> EngineExit<R> {
    pub fn new(reason: R) -> Self {
        Self { reason, cause: None }
    }

    pub fn with_cause(reason: R, cause: RebalancerError) -> Self {
        Self {
            reason,
            cause: Some(cause),
        }
    }
}

/// Turn a fired watch into an error when it reports session loss.
pub fn check_watch(event: &WatchEvent) -> Result<()> {
    match event.kind {
        WatchEventKind::SessionExpired => Err(RebalancerError::SessionExpired(format!(
            "watch on {} reported expiry",
            event.path
        ))),
        WatchEventKind::Closed => Err(RebalancerError::Cancelled(format!(
            "watch on {} dropped",
            event.path
        ))),
        _ => Ok(()),
    }
}

/// Store session, group layout and cancellation for one session lifetime.
#[derive(Clone)]
pub struct SessionContext {
    store: Arc<dyn CoordinationStore>,
    executor: ResilientExecutor,
    cancel: CancellationToken,
    paths: Arc<GroupPaths>,
    group: GroupId,
    config: Arc<ClientConfig>,
    metrics: Arc<RebalanceMetrics>,
}

impl SessionContext {
    /// Create a context over a freshly opened session.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        group: GroupId,
        config: Arc<ClientConfig>,
        metrics: Arc<RebalanceMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let executor = ResilientExecutor::new(store.clone(), config.retry_interval)
            .with_retry_counter(metrics.store_retries.clone());
        Self {
            paths: Arc::new(GroupPaths::new(&config.root_path, &group)),
            store,
            executor,
            cancel,
            group,
            config,
            metrics,
        }
    }

    /// The same session under a different cancellation token.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn paths(&self) -> &GroupPaths {
        &self.paths
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<RebalanceMetrics> {
        &self.metrics
    }

    pub fn executor(&self) -> &ResilientExecutor {
        &self.executor
    }

    /// Resolves once the session is expired or closed.
    pub async fn session_lost(&self) -> RebalancerError {
        let mut state_rx = self.store.session_state();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                SessionState::Expired => {
                    return RebalancerError::SessionExpired("session expired".to_string())
                }
                SessionState::Closed => {
                    return RebalancerError::Cancelled("session closed".to_string())
                }
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return RebalancerError::Cancelled("session dropped".to_string());
            }
        }
    }

    /// Ensure every persistent group node exists.
    #[instrument(skip(self), fields(group = %self.group))]
    pub async fn initialize_group(&self) -> Result<()> {
        let store = &self.store;
        for root in self.paths.roots() {
            self.executor
                .run("ensure_path", &self.cancel, move || async move {
                    store.ensure_path(root, None).await
                })
                .await?;
        }
        Ok(())
    }

    /// Create this session's registration node.
    ///
    /// A retried create may already have succeeded, so retries first look
    /// for a registration owned by this session.
    #[instrument(skip(self), fields(group = %self.group))]
    pub async fn register(&self) -> Result<ClientId> {
        let store = &self.store;
        let parent = self.paths.clients.as_str();
        let session = store.session_id();
        let payload = session.to_string().into_bytes();
        let payload = &payload;
        let mut attempt = 0u32;

        let path = self
            .executor
            .run("register", &self.cancel, || {
                attempt += 1;
                let retry = attempt > 1;
                async move {
                    if retry {
                        let listing = store.get_children(parent, false).await?;
                        for child in listing.children {
                            let path = format!("{}/{}", parent, child);
                            let exists = store.exists(&path, false).await?;
                            if exists.stat.and_then(|s| s.ephemeral_owner) == Some(session) {
                                return Ok(path);
                            }
                        }
                    }
                    store
                        .create_ephemeral_sequential(parent, CLIENT_NODE_PREFIX, payload.clone())
                        .await
                }
            })
            .await?;

        let client_id = ClientId::from_path(&path);
        debug!(client_id = %client_id, "Registration created");
        Ok(client_id)
    }

    /// Delete a registration node. Absence is fine.
    pub async fn delete_registration(&self, client_id: &ClientId) -> Result<()> {
        let store = &self.store;
        let path = self.paths.client(client_id);
        let path = path.as_str();
        self.executor
            .run("delete_registration", &self.cancel, move || async move {
                store.delete(path).await
            })
            .await?;
        Ok(())
    }

    /// Registered clients in ascending join sequence.
    pub async fn clients(&self, watch: bool) -> Result<(Vec<ClientId>, Option<Watch>)> {
        let store = &self.store;
        let path = self.paths.clients.as_str();
        let listing = self
            .executor
            .run("get_clients", &self.cancel, move || async move {
                store.get_children(path, watch).await
            })
            .await?;

        let mut clients: Vec<ClientId> = listing
            .children
            .into_iter()
            .filter(|name| name.starts_with(CLIENT_NODE_PREFIX))
            .map(ClientId::new)
            .collect();
        ClientId::sort_by_sequence(&mut clients);
        Ok((clients, listing.watch))
    }

    /// Current resources, sorted.
    pub async fn resources(&self, watch: bool) -> Result<(Vec<ResourceId>, Option<Watch>)> {
        let store = &self.store;
        let path = self.paths.resources.as_str();
        let listing = self
            .executor
            .run("get_resources", &self.cancel, move || async move {
                store.get_children(path, watch).await
            })
            .await?;

        let mut resources: Vec<ResourceId> =
            listing.children.into_iter().map(ResourceId::from).collect();
        resources.sort();
        Ok((resources, listing.watch))
    }

    /// Current epoch (the epoch node's version).
    pub async fn epoch(&self, watch: bool) -> Result<(Version, Option<Watch>)> {
        let store = &self.store;
        let path = self.paths.epoch.as_str();
        let result = self
            .executor
            .run("get_epoch", &self.cancel, move || async move {
                store.exists(path, watch).await
            })
            .await?;

        match result.stat {
            Some(stat) => Ok((stat.version, result.watch)),
            None => Err(RebalancerError::InvalidOperation(format!(
                "epoch node {} missing",
                path
            ))),
        }
    }

    /// Advance the epoch by compare-and-set on `current`.
    ///
    /// Fails with `StaleVersion` when another coordinator advanced it first.
    pub async fn increment_epoch(&self, current: Version) -> Result<Version> {
        let store = &self.store;
        let path = self.paths.epoch.as_str();
        let stat = self
            .executor
            .run("increment_epoch", &self.cancel, move || async move {
                store.set_data(path, Vec::new(), Some(current)).await
            })
            .await?;
        Ok(stat.version)
    }

    /// Read the assignment record and its store version.
    pub async fn read_assignment(
        &self,
        watch: bool,
    ) -> Result<(AssignmentRecord, Version, Option<Watch>)> {
        let store = &self.store;
        let path = self.paths.assignment.as_str();
        let result = self
            .executor
            .run("get_assignment", &self.cancel, move || async move {
                store.get_data(path, watch).await
            })
            .await?;

        let record = AssignmentRecord::from_bytes(&result.data)?;
        Ok((record, result.stat.version, result.watch))
    }

    /// Write the assignment record by compare-and-set on `expected`.
    pub async fn write_assignment(
        &self,
        record: &AssignmentRecord,
        expected: Version,
    ) -> Result<Version> {
        let store = &self.store;
        let path = self.paths.assignment.as_str();
        let data = record.to_bytes()?;
        let data = &data;
        let stat = self
            .executor
            .run("set_assignment", &self.cancel, move || async move {
                store.set_data(path, data.clone(), Some(expected)).await
            })
            .await?;
        Ok(stat.version)
    }

    /// Arm a watch on another client's registration.
    ///
    /// Fails with `NoEphemeralNode` if the registration is already gone.
    pub async fn watch_client(&self, client_id: &ClientId) -> Result<Watch> {
        let store = &self.store;
        let path = self.paths.client(client_id);
        let path_ref = path.as_str();
        let result = self
            .executor
            .run("watch_client", &self.cancel, move || async move {
                store.exists(path_ref, true).await
            })
            .await?;

        match (result.stat, result.watch) {
            (Some(_), Some(watch)) => Ok(watch),
            _ => Err(RebalancerError::NoEphemeralNode(path)),
        }
    }

    /// Read a resource's barrier lock: `Ok(None)` when absent.
    pub async fn barrier_owner(&self, resource: &ResourceId) -> Result<Option<ClientId>> {
        let store = &self.store;
        let path = self.paths.barrier(resource);
        let path = path.as_str();
        let data = self
            .executor
            .run("get_barrier", &self.cancel, move || async move {
                match store.get_data(path, false).await {
                    Ok(result) => Ok(Some(result.data)),
                    Err(StoreError::NoNode(_)) => Ok(None),
                    Err(err) => Err(err),
                }
            })
            .await?;
        Ok(data.map(|d| ClientId::new(String::from_utf8_lossy(&d).into_owned())))
    }

    /// The raw session.
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Close the session, deleting its ephemeral nodes.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await.map_err(RebalancerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebalancer_store::MemoryEnsemble;
    use std::time::Duration;

    fn context(ensemble: &MemoryEnsemble) -> SessionContext {
        SessionContext::new(
            ensemble.session(Duration::from_secs(20)),
            GroupId::new("g"),
            Arc::new(ClientConfig::default()),
            Arc::new(RebalanceMetrics::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_register_orders_clients() {
        let ensemble = MemoryEnsemble::new();
        let a = context(&ensemble);
        let b = context(&ensemble);
        a.initialize_group().await.unwrap();
        b.initialize_group().await.unwrap();

        let id_a = a.register().await.unwrap();
        let id_b = b.register().await.unwrap();
        assert!(id_a.sequence() < id_b.sequence());

        let (clients, _) = b.clients(false).await.unwrap();
        assert_eq!(clients, vec![id_a.clone(), id_b.clone()]);

        a.delete_registration(&id_a).await.unwrap();
        a.delete_registration(&id_a).await.unwrap();
        let (clients, _) = b.clients(false).await.unwrap();
        assert_eq!(clients, vec![id_b]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_retry_does_not_duplicate() {
        let ensemble = MemoryEnsemble::new();
        let ctx = context(&ensemble);
        ctx.initialize_group().await.unwrap();

        // Create succeeds but the reply is lost
        let store = ctx.store().clone();
        store
            .create_ephemeral_sequential(&ctx.paths().clients, CLIENT_NODE_PREFIX, Vec::new())
            .await
            .unwrap();
        ensemble.fail_next_calls(store.session_id(), 1);

        let id = ctx.register().await.unwrap();
        let (clients, _) = ctx.clients(false).await.unwrap();
        assert_eq!(clients, vec![id]);
    }

    #[tokio::test]
    async fn test_epoch_cas() {
        let ensemble = MemoryEnsemble::new();
        let ctx = context(&ensemble);
        ctx.initialize_group().await.unwrap();

        let (epoch, _) = ctx.epoch(false).await.unwrap();
        let next = ctx.increment_epoch(epoch).await.unwrap();
        assert_eq!(next, epoch + 1);

        let err = ctx.increment_epoch(epoch).await.unwrap_err();
        assert!(err.is_fenced());
    }

    #[tokio::test]
    async fn test_assignment_roundtrip_with_cas() {
        let ensemble = MemoryEnsemble::new();
        let ctx = context(&ensemble);
        ctx.initialize_group().await.unwrap();

        let (record, version, _) = ctx.read_assignment(false).await.unwrap();
        assert_eq!(record, AssignmentRecord::default());

        let revoking = AssignmentRecord::revoking(3);
        let next = ctx.write_assignment(&revoking, version).await.unwrap();
        let (stored, stored_version, _) = ctx.read_assignment(false).await.unwrap();
        assert!(stored.is_revoking());
        assert_eq!(stored.epoch, 3);
        assert_eq!(stored_version, next);

        assert!(ctx.write_assignment(&revoking, version).await.unwrap_err().is_fenced());
    }

    #[tokio::test]
    async fn test_watch_missing_client() {
        let ensemble = MemoryEnsemble::new();
        let ctx = context(&ensemble);
        ctx.initialize_group().await.unwrap();

        let err = ctx.watch_client(&ClientId::new("c_0000000099")).await.unwrap_err();
        assert_eq!(err.error_code(), "NO_EPHEMERAL_NODE");
    }

    #[tokio::test]
    async fn test_session_lost_on_expiry() {
        let ensemble = MemoryEnsemble::new();
        let ctx = context(&ensemble);
        ensemble.expire(ctx.store().session_id());
        assert!(matches!(ctx.session_lost().await, RebalancerError::SessionExpired(_)));
    }
}
