//! Rebalancing client and its lifecycle state machine.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use rebalancer_common::{
    AbortReason, ClientId, ClientInternalState, CoordinatorExitReason, FollowerExitReason, GroupId,
    RebalancerError, ResourceId, Result, SessionId,
};
use rebalancer_store::StoreConnector;

use crate::barrier::ResourceBarrier;
use crate::config::{ClientConfig, ClientOptions};
use crate::context::SessionContext;
use crate::coordinator::{BecomeCoordinatorResult, CoordinatorEngine};
use crate::follower::{BecomeFollowerResult, FollowerEngine};
use crate::handler::RebalanceHandler;
use crate::metrics::{MetricsSnapshot, RebalanceMetrics};
use crate::ownership::OwnershipTracker;

/// Session-scoped parts the state machine creates and `stop()` cleans up.
#[derive(Default)]
struct ActiveSession {
    ctx: Option<SessionContext>,
    client_id: Option<ClientId>,
    barrier: Option<Arc<ResourceBarrier>>,
}

struct Shared {
    config: Arc<ClientConfig>,
    connector: Arc<dyn StoreConnector>,
    handler: Arc<dyn RebalanceHandler>,
    metrics: Arc<RebalanceMetrics>,
    tracker: Arc<OwnershipTracker>,
    state_tx: watch::Sender<ClientInternalState>,
    active: Mutex<ActiveSession>,
}

impl Shared {
    fn state(&self) -> ClientInternalState {
        *self.state_tx.borrow()
    }

    fn transition(&self, to: ClientInternalState) {
        let from = self.state();
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "Unexpected state transition");
        }
        self.state_tx.send_replace(to);
        if from != to {
            info!(from = %from, to = %to, "Client state changed");
        }
    }
}

struct Runtime {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A member of a resource group.
///
/// After `start()` the client registers with the group, takes the
/// coordinator or follower role and reports ownership changes through its
/// `RebalanceHandler` until `stop()`.
pub struct RebalancerClient {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
}

impl RebalancerClient {
    /// Create a new client.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn StoreConnector>,
        handler: Arc<dyn RebalanceHandler>,
    ) -> Self {
        let metrics = Arc::new(RebalanceMetrics::new());
        let (state_tx, _) = watch::channel(ClientInternalState::NoSession);
        Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                connector,
                tracker: Arc::new(OwnershipTracker::new(handler.clone(), metrics.clone())),
                handler,
                metrics,
                state_tx,
                active: Mutex::new(ActiveSession::default()),
            }),
            runtime: Mutex::new(None),
        }
    }

    /// Join `group` and start rebalancing.
    ///
    /// Returns once the client is registered; role selection and all further
    /// work run on a background task.
    #[instrument(skip(self, options))]
    pub async fn start(&self, group: GroupId, options: ClientOptions) -> Result<()> {
        self.shared
            .config
            .validate()
            .map_err(RebalancerError::Configuration)?;
        if !group.is_valid() {
            return Err(RebalancerError::Configuration(format!(
                "invalid group name: {:?}",
                group.as_str()
            )));
        }
        if self.runtime.lock().is_some() || self.shared.state() != ClientInternalState::NoSession {
            return Err(RebalancerError::InvalidState(format!(
                "cannot start from {}",
                self.shared.state()
            )));
        }

        let cancel = CancellationToken::new();
        let machine = StateMachine {
            shared: self.shared.clone(),
            group,
            options,
            cancel: cancel.clone(),
        };

        if let Err(err) = machine.establish().await {
            warn!(error = %err, "Start failed");
            machine.discard_session().await;
            self.shared.state_tx.send_replace(ClientInternalState::NoSession);
            return Err(err);
        }

        let task = tokio::spawn(machine.run());
        *self.runtime.lock() = Some(Runtime { cancel, task });
        Ok(())
    }

    /// Leave the group.
    ///
    /// Waits up to `timeout` for the background task, then announces
    /// unassignment if resources are held, releases every barrier, deletes the
    /// registration and closes the session. Always ends in `Terminated`.
    #[instrument(skip(self))]
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let runtime = self.runtime.lock().take();
        if let Some(Runtime { cancel, mut task }) = runtime {
            cancel.cancel();
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                warn!("Client task did not stop in time, aborting");
                task.abort();
            }
        }

        let ActiveSession {
            ctx,
            client_id,
            barrier,
        } = std::mem::take(&mut *self.shared.active.lock());
        let ctx = ctx.map(|ctx| ctx.with_cancel(CancellationToken::new()));

        let cleanup = async {
            match (&ctx, &barrier) {
                (Some(ctx), Some(barrier)) => {
                    let barrier = barrier.with_context(ctx.clone());
                    if let Err(err) = self.shared.tracker.revoke(&barrier).await {
                        warn!(error = %err, "Failed to release barriers");
                    }
                }
                _ => self.shared.tracker.revoke_detached().await,
            }
            if let (Some(ctx), Some(client_id)) = (&ctx, &client_id) {
                if let Err(err) = ctx.delete_registration(client_id).await {
                    warn!(client_id = %client_id, error = %err, "Failed to delete registration");
                }
            }
        };
        if tokio::time::timeout(timeout, cleanup).await.is_err() {
            warn!("Cleanup did not finish in time");
        }
        if let Some(ctx) = &ctx {
            if let Err(err) = ctx.close().await {
                debug!(error = %err, "Session close failed");
            }
        }

        if self.shared.state() != ClientInternalState::Terminated {
            self.shared.transition(ClientInternalState::Terminated);
        }
        info!(client_id = ?client_id, "Client stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientInternalState {
        self.shared.state()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ClientInternalState> {
        self.shared.state_tx.subscribe()
    }

    /// Registration of the current session, if any.
    pub fn client_id(&self) -> Option<ClientId> {
        self.shared.active.lock().client_id.clone()
    }

    /// Store session currently in use.
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared
            .active
            .lock()
            .ctx
            .as_ref()
            .map(|ctx| ctx.store().session_id())
    }

    /// Resources currently owned.
    pub fn assigned_resources(&self) -> Vec<ResourceId> {
        self.shared.tracker.assigned()
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Default stop timeout from configuration.
    pub fn stop_timeout(&self) -> Duration {
        self.shared.config.stop_timeout
    }
}

enum Failure {
    /// The session or the client was shut down. Only a stop of the client
    /// itself ends the machine quietly.
    Cancelled(RebalancerError),
    Abort(AbortReason, RebalancerError),
}

impl From<RebalancerError> for Failure {
    fn from(err: RebalancerError) -> Self {
        let reason = match &err {
            RebalancerError::Cancelled(_) => return Failure::Cancelled(err),
            RebalancerError::SessionExpired(_) => AbortReason::SessionExpired,
            RebalancerError::InconsistentState(_) => AbortReason::PotentialInconsistentState,
            _ => AbortReason::FatalError,
        };
        Failure::Abort(reason, err)
    }
}

/// Background task driving one client through its states.
struct StateMachine {
    shared: Arc<Shared>,
    group: GroupId,
    options: ClientOptions,
    cancel: CancellationToken,
}

impl StateMachine {
    /// `NoSession` to `NoRole`: open a session, prepare the group and
    /// register.
    async fn establish(&self) -> Result<()> {
        self.open_session().await?;
        self.shared.transition(ClientInternalState::NoClientNode);
        self.register().await?;
        self.shared.transition(ClientInternalState::NoRole);
        Ok(())
    }

    async fn open_session(&self) -> Result<()> {
        let config = &self.shared.config;
        let store = tokio::time::timeout(
            config.connect_timeout,
            self.shared.connector.connect(config.session_timeout),
        )
        .await
        .map_err(|_| {
            RebalancerError::InvalidOperation(format!(
                "no session within {:?}",
                config.connect_timeout
            ))
        })??;
        self.shared.metrics.session_opened();

        let ctx = SessionContext::new(
            store,
            self.group.clone(),
            config.clone(),
            self.shared.metrics.clone(),
            self.cancel.clone(),
        );
        *self.shared.active.lock() = ActiveSession {
            ctx: Some(ctx.clone()),
            client_id: None,
            barrier: None,
        };
        debug!(session = %ctx.store().session_id(), "Session opened");

        ctx.initialize_group().await
    }

    async fn register(&self) -> Result<()> {
        let ctx = self.session_ctx()?;
        let client_id = ctx.register().await?;
        let barrier = Arc::new(ResourceBarrier::new(ctx.clone(), client_id.clone()));
        {
            let mut active = self.shared.active.lock();
            active.client_id = Some(client_id.clone());
            active.barrier = Some(barrier);
        }
        info!(client_id = %client_id, group = %self.group, "Registered");
        Ok(())
    }

    fn session_ctx(&self) -> Result<SessionContext> {
        self.shared
            .active
            .lock()
            .ctx
            .clone()
            .ok_or_else(|| RebalancerError::InvalidState("no active session".to_string()))
    }

    fn session_parts(&self) -> Result<(SessionContext, ClientId, Arc<ResourceBarrier>)> {
        let active = self.shared.active.lock();
        match (&active.ctx, &active.client_id, &active.barrier) {
            (Some(ctx), Some(id), Some(barrier)) => Ok((ctx.clone(), id.clone(), barrier.clone())),
            _ => Err(RebalancerError::InvalidState("not registered".to_string())),
        }
    }

    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let step = match self.shared.state() {
                ClientInternalState::NoSession => self.establish().await.map_err(Failure::from),
                ClientInternalState::NoClientNode => self
                    .register()
                    .await
                    .map(|_| self.shared.transition(ClientInternalState::NoRole))
                    .map_err(Failure::from),
                ClientInternalState::NoRole
                | ClientInternalState::IsLeader
                | ClientInternalState::IsFollower => self.take_role().await,
                ClientInternalState::Error | ClientInternalState::Terminated => return,
            };

            match step {
                Ok(()) => {}
                Err(Failure::Cancelled(_)) if self.cancel.is_cancelled() => return,
                Err(Failure::Cancelled(cause)) => {
                    if !self.recover(AbortReason::FatalError, cause).await {
                        return;
                    }
                }
                Err(Failure::Abort(reason, cause)) => {
                    if !self.recover(reason, cause).await {
                        return;
                    }
                }
            }
        }
    }

    /// Decide the role and run its engine until it exits.
    async fn take_role(&self) -> std::result::Result<(), Failure> {
        let (ctx, client_id, barrier) = self.session_parts()?;
        let tracker = self.shared.tracker.clone();

        let (epoch, _) = ctx.epoch(false).await?;
        let (clients, _) = ctx.clients(false).await?;

        if clients.first() == Some(&client_id) {
            let mut engine = CoordinatorEngine::new(ctx, client_id, barrier, tracker);
            if engine.become_coordinator(epoch).await? == BecomeCoordinatorResult::NotSmallest {
                return Ok(());
            }
            self.shared.transition(ClientInternalState::IsLeader);

            let exit = engine.run_event_loop().await;
            debug!(reason = ?exit.reason, "Coordinator exited");
            self.after_exit(
                exit.reason.abort_reason(),
                exit.reason == CoordinatorExitReason::Cancelled,
                exit.cause,
            )
        } else {
            let mut engine = FollowerEngine::new(ctx, client_id, barrier, tracker);
            match engine.become_follower().await? {
                BecomeFollowerResult::Ok => {}
                BecomeFollowerResult::RebecomeFollower | BecomeFollowerResult::IsSmallest => {
                    return Ok(())
                }
            }
            self.shared.transition(ClientInternalState::IsFollower);

            let exit = engine.run_event_loop().await;
            debug!(reason = ?exit.reason, "Follower exited");
            self.after_exit(
                exit.reason.abort_reason(),
                exit.reason == FollowerExitReason::Cancelled,
                exit.cause,
            )
        }
    }

    /// Map an engine exit onto the next machine step.
    fn after_exit(
        &self,
        abort: Option<AbortReason>,
        cancelled: bool,
        cause: Option<RebalancerError>,
    ) -> std::result::Result<(), Failure> {
        match abort {
            Some(reason) => Err(Failure::Abort(reason, exit_cause(cause))),
            None if cancelled || self.cancel.is_cancelled() => Err(Failure::Cancelled(
                cause.unwrap_or_else(|| RebalancerError::Cancelled("client stopped".to_string())),
            )),
            None => {
                self.shared.transition(ClientInternalState::NoRole);
                Ok(())
            }
        }
    }

    /// Handle a fatal failure: tear the session down, report the abort and
    /// either restart or terminate. Returns whether the machine continues.
    async fn recover(&self, reason: AbortReason, cause: RebalancerError) -> bool {
        error!(
            group = %self.group,
            reason = %reason,
            error_code = cause.error_code(),
            error = %cause,
            "Client aborted"
        );
        self.shared.transition(ClientInternalState::Error);

        self.discard_session().await;
        self.shared.metrics.aborted();
        self.shared.handler.on_aborted(reason, &cause).await;

        if !self.options.auto_recovery_on_error {
            self.shared.transition(ClientInternalState::Terminated);
            return false;
        }

        tokio::select! {
            _ = self.cancel.cancelled() => return false,
            _ = tokio::time::sleep(self.options.recovery_delay) => {}
        }
        info!(group = %self.group, "Recovering with a new session");
        self.shared.transition(ClientInternalState::NoSession);
        true
    }

    /// Best-effort teardown of the current session.
    async fn discard_session(&self) {
        let session = std::mem::take(&mut *self.shared.active.lock());
        match &session.barrier {
            Some(barrier) => {
                if let Err(err) = self.shared.tracker.revoke(barrier).await {
                    debug!(error = %err, "Barrier release failed");
                }
            }
            None => self.shared.tracker.revoke_detached().await,
        }
        if let Some(ctx) = &session.ctx {
            if let Some(client_id) = &session.client_id {
                if let Err(err) = ctx.delete_registration(client_id).await {
                    debug!(error = %err, "Registration delete failed");
                }
            }
            if let Err(err) = ctx.close().await {
                debug!(error = %err, "Session close failed");
            }
        }
    }
}

fn exit_cause(cause: Option<RebalancerError>) -> RebalancerError {
    cause.unwrap_or_else(|| RebalancerError::InvalidOperation("engine exited".to_string()))
}

/// Builder for RebalancerClient.
pub struct RebalancerClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn StoreConnector>>,
    handler: Option<Arc<dyn RebalanceHandler>>,
}

impl RebalancerClientBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            connector: None,
            handler: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the store root path.
    pub fn root_path(mut self, root: impl Into<String>) -> Self {
        self.config.root_path = root.into();
        self
    }

    /// Set the session timeout.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Set the minimum interval between rebalancing rounds.
    pub fn min_rebalance_interval(mut self, interval: Duration) -> Self {
        self.config.min_rebalance_interval = interval;
        self
    }

    /// Set the store connector.
    pub fn connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the rebalance handler.
    pub fn handler(mut self, handler: Arc<dyn RebalanceHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<RebalancerClient> {
        self.config
            .validate()
            .map_err(RebalancerError::Configuration)?;

        let connector = self.connector.ok_or(RebalancerError::Configuration(
            "Store connector is required".to_string(),
        ))?;

        let handler = self.handler.ok_or(RebalancerError::Configuration(
            "Rebalance handler is required".to_string(),
        ))?;

        Ok(RebalancerClient::new(self.config, connector, handler))
    }
}

impl Default for RebalancerClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ChannelHandler, ClientEvent, LoggingHandler};
    use rebalancer_store::MemoryEnsemble;

    fn client(ensemble: &MemoryEnsemble) -> RebalancerClient {
        RebalancerClientBuilder::new()
            .connector(ensemble.connector())
            .handler(Arc::new(LoggingHandler))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_connector() {
        let err = RebalancerClientBuilder::new()
            .handler(Arc::new(LoggingHandler))
            .build()
            .err()
            .unwrap();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_builder_validates_config() {
        let ensemble = MemoryEnsemble::new();
        let result = RebalancerClientBuilder::new()
            .root_path("relative")
            .connector(ensemble.connector())
            .handler(Arc::new(LoggingHandler))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_registers_before_returning() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble);
        assert_eq!(client.state(), ClientInternalState::NoSession);

        client.start(GroupId::new("g"), ClientOptions::default()).await.unwrap();
        let id = client.client_id().unwrap();
        assert!(ensemble.contains(&format!("/rebalancer/g/clients/{}", id)));
        assert_ne!(client.state(), ClientInternalState::NoSession);

        client.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.state(), ClientInternalState::Terminated);
        assert!(!ensemble.contains(&format!("/rebalancer/g/clients/{}", id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_rejected() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble);
        client.start(GroupId::new("g"), ClientOptions::default()).await.unwrap();

        let err = client
            .start(GroupId::new("g"), ClientOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE");
        client.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_group_rejected() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble);
        let err = client
            .start(GroupId::new(""), ClientOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
        assert_eq!(client.state(), ClientInternalState::NoSession);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_start() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble);
        client.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.state(), ClientInternalState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_client_becomes_leader() {
        let ensemble = MemoryEnsemble::new();
        let (handler, _events) = ChannelHandler::new();
        let client = RebalancerClientBuilder::new()
            .connector(ensemble.connector())
            .handler(Arc::new(handler))
            .build()
            .unwrap();
        let mut states = client.subscribe_state();

        client.start(GroupId::new("g"), ClientOptions::default()).await.unwrap();
        while *states.borrow_and_update() != ClientInternalState::IsLeader {
            states.changed().await.unwrap();
        }
        client.stop(Duration::from_secs(5)).await.unwrap();
    }

    async fn wait_for(
        states: &mut watch::Receiver<ClientInternalState>,
        target: ClientInternalState,
    ) {
        while *states.borrow_and_update() != target {
            states.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_closed_underneath_aborts() {
        let ensemble = MemoryEnsemble::new();
        let (handler, mut events) = ChannelHandler::new();
        let client = RebalancerClientBuilder::new()
            .connector(ensemble.connector())
            .handler(Arc::new(handler))
            .build()
            .unwrap();
        let mut states = client.subscribe_state();

        client.start(GroupId::new("g"), ClientOptions::default()).await.unwrap();
        wait_for(&mut states, ClientInternalState::IsLeader).await;

        let ctx = client.shared.active.lock().ctx.clone().unwrap();
        ctx.close().await.unwrap();
        wait_for(&mut states, ClientInternalState::Terminated).await;

        let mut aborted = None;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Aborted { reason, .. } = event {
                aborted = Some(reason);
            }
        }
        assert_eq!(aborted, Some(AbortReason::FatalError));
        assert!(client.client_id().is_none());
        client.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_closed_underneath_recovers() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble);
        let mut states = client.subscribe_state();

        client
            .start(GroupId::new("g"), ClientOptions::with_auto_recovery())
            .await
            .unwrap();
        wait_for(&mut states, ClientInternalState::IsLeader).await;
        let first = client.client_id().unwrap();

        let ctx = client.shared.active.lock().ctx.clone().unwrap();
        ctx.close().await.unwrap();
        loop {
            states.changed().await.unwrap();
            let leading = *states.borrow_and_update() == ClientInternalState::IsLeader;
            if leading && client.client_id().as_ref() != Some(&first) {
                break;
            }
        }
        assert_eq!(client.metrics().aborts, 1);
        client.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.state(), ClientInternalState::Terminated);
    }
}
