//! Follower engine.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use rebalancer_common::{ClientId, FollowerExitReason, RebalancerError, Result};
use rebalancer_store::Watch;

use crate::barrier::ResourceBarrier;
use crate::context::{check_watch, EngineExit, SessionContext};
use crate::ownership::OwnershipTracker;

/// Outcome of trying to take the follower role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BecomeFollowerResult {
    Ok,
    /// The predecessor vanished before its watch was set.
    RebecomeFollower,
    /// No smaller registration exists: this client should coordinate.
    IsSmallest,
}

/// Exit of the follower loop.
pub type FollowerExit = EngineExit<FollowerExitReason>;

/// The follower role for one session.
///
/// Watches only its immediate predecessor, so a departure wakes a single
/// follower rather than the whole group.
pub struct FollowerEngine {
    ctx: SessionContext,
    client_id: ClientId,
    barrier: Arc<ResourceBarrier>,
    tracker: Arc<OwnershipTracker>,
    predecessor: Option<ClientId>,
    predecessor_watch: Option<Watch>,
    epoch_watch: Option<Watch>,
    record_watch: Option<Watch>,
}

impl FollowerEngine {
    pub fn new(
        ctx: SessionContext,
        client_id: ClientId,
        barrier: Arc<ResourceBarrier>,
        tracker: Arc<OwnershipTracker>,
    ) -> Self {
        Self {
            ctx,
            client_id,
            barrier,
            tracker,
            predecessor: None,
            predecessor_watch: None,
            epoch_watch: None,
            record_watch: None,
        }
    }

    /// Set a watch on the next smaller registration.
    #[instrument(skip(self), fields(client_id = %self.client_id))]
    pub async fn become_follower(&mut self) -> Result<BecomeFollowerResult> {
        let (clients, _) = self.ctx.clients(false).await?;
        let position = clients
            .iter()
            .position(|c| c == &self.client_id)
            .ok_or_else(|| {
                RebalancerError::InvalidOperation(format!(
                    "registration {} missing from group",
                    self.client_id
                ))
            })?;
        if position == 0 {
            return Ok(BecomeFollowerResult::IsSmallest);
        }

        let predecessor = clients[position - 1].clone();
        match self.ctx.watch_client(&predecessor).await {
            Ok(watch) => {
                info!(
                    group = %self.ctx.group(),
                    predecessor = %predecessor,
                    "Became follower"
                );
                self.predecessor_watch = Some(watch);
                self.predecessor = Some(predecessor);
                Ok(BecomeFollowerResult::Ok)
            }
            Err(RebalancerError::NoEphemeralNode(_)) => {
                debug!(predecessor = %predecessor, "Predecessor already gone");
                Ok(BecomeFollowerResult::RebecomeFollower)
            }
            Err(err) => Err(err),
        }
    }

    /// Follow assignment records until the predecessor leaves or the
    /// session ends.
    pub async fn run_event_loop(&mut self) -> FollowerExit {
        loop {
            if let Err(err) = self.sync().await {
                return Self::classify(err);
            }

            tokio::select! {
                _ = self.ctx.cancel().cancelled() => {
                    return FollowerExit::new(FollowerExitReason::Cancelled);
                }
                err = self.ctx.session_lost() => return Self::classify(err),
                event = Watch::next_in(&mut self.predecessor_watch) => {
                    if let Err(err) = check_watch(&event) {
                        return Self::classify(err);
                    }
                    info!(
                        predecessor = ?self.predecessor,
                        "Predecessor changed, re-evaluating role"
                    );
                    return FollowerExit::new(FollowerExitReason::PossibleRoleChange);
                }
                event = Watch::next_in(&mut self.epoch_watch) => {
                    if let Err(err) = check_watch(&event) {
                        return Self::classify(err);
                    }
                    debug!("Epoch changed");
                }
                event = Watch::next_in(&mut self.record_watch) => {
                    if let Err(err) = check_watch(&event) {
                        return Self::classify(err);
                    }
                    debug!("Assignment record changed");
                }
            }
        }
    }

    /// Re-arm fired watches, then read and apply the current record.
    async fn sync(&mut self) -> Result<()> {
        if self.epoch_watch.is_none() {
            let (_, watch) = self.ctx.epoch(true).await?;
            self.epoch_watch = watch;
        }
        let (record, _, watch) = self.ctx.read_assignment(self.record_watch.is_none()).await?;
        if watch.is_some() {
            self.record_watch = watch;
        }

        self.tracker
            .apply(&record, &self.client_id, &self.barrier)
            .await
            .map_err(|err| match err {
                RebalancerError::InvalidOperation(msg) => RebalancerError::InconsistentState(msg),
                other => other,
            })
    }

    fn classify(err: RebalancerError) -> FollowerExit {
        let reason = match &err {
            RebalancerError::NoEphemeralNode(_) => FollowerExitReason::PossibleRoleChange,
            RebalancerError::Cancelled(_) => FollowerExitReason::Cancelled,
            RebalancerError::SessionExpired(_) => FollowerExitReason::SessionExpired,
            RebalancerError::InconsistentState(_) => FollowerExitReason::PotentialInconsistentState,
            _ => FollowerExitReason::FatalError,
        };
        FollowerExit::with_cause(reason, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::handler::{ChannelHandler, ClientEvent};
    use crate::metrics::RebalanceMetrics;
    use rebalancer_common::{AssignmentRecord, ClientAssignment, GroupId, ResourceId};
    use rebalancer_store::{GroupAdmin, MemoryEnsemble};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Member {
        ctx: SessionContext,
        id: ClientId,
        engine: FollowerEngine,
        events: tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
    }

    async fn member(ensemble: &MemoryEnsemble) -> Member {
        let metrics = Arc::new(RebalanceMetrics::new());
        let ctx = SessionContext::new(
            ensemble.session(Duration::from_secs(20)),
            GroupId::new("g"),
            Arc::new(ClientConfig::default()),
            metrics.clone(),
            CancellationToken::new(),
        );
        ctx.initialize_group().await.unwrap();
        let id = ctx.register().await.unwrap();
        let (handler, events) = ChannelHandler::new();
        let tracker = Arc::new(OwnershipTracker::new(Arc::new(handler), metrics));
        let barrier = Arc::new(ResourceBarrier::new(ctx.clone(), id.clone()));
        let engine = FollowerEngine::new(ctx.clone(), id.clone(), barrier, tracker);
        Member { ctx, id, engine, events }
    }

    #[tokio::test(start_paused = true)]
    async fn test_smallest_is_not_follower() {
        let ensemble = MemoryEnsemble::new();
        let mut a = member(&ensemble).await;
        assert_eq!(
            a.engine.become_follower().await.unwrap(),
            BecomeFollowerResult::IsSmallest
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_predecessor_departure_ends_loop() {
        let ensemble = MemoryEnsemble::new();
        let a = member(&ensemble).await;
        let mut b = member(&ensemble).await;
        assert_eq!(b.engine.become_follower().await.unwrap(), BecomeFollowerResult::Ok);

        let remover = a.ctx.clone();
        let a_id = a.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            remover.delete_registration(&a_id).await.unwrap();
        });

        let exit = b.engine.run_event_loop().await;
        assert_eq!(exit.reason, FollowerExitReason::PossibleRoleChange);
        assert!(exit.reason.abort_reason().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_record_changes() {
        let ensemble = MemoryEnsemble::new();
        let admin = GroupAdmin::new(
            ensemble.session(Duration::from_secs(20)),
            "/rebalancer",
            GroupId::new("g"),
            Duration::from_millis(100),
        );
        admin.prepare(&[ResourceId::new("res0")]).await.unwrap();
        let a = member(&ensemble).await;
        let mut b = member(&ensemble).await;
        b.engine.become_follower().await.unwrap();

        let writer = a.ctx.clone();
        let b_id = b.id.clone();
        tokio::spawn(async move {
            let (_, version, _) = writer.read_assignment(false).await.unwrap();
            let record = AssignmentRecord::assigned(
                1,
                vec![ClientAssignment::new(b_id, vec![ResourceId::new("res0")])],
            );
            let version = writer.write_assignment(&record, version).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            writer
                .write_assignment(&AssignmentRecord::revoking(2), version)
                .await
                .unwrap();
        });

        let cancel = b.ctx.cancel().clone();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        let exit = b.engine.run_event_loop().await;
        assert_eq!(exit.reason, FollowerExitReason::Cancelled);
        canceller.await.unwrap();

        assert_eq!(b.events.try_recv().unwrap(), ClientEvent::Assigned(vec![ResourceId::new("res0")]));
        assert_eq!(b.events.try_recv().unwrap(), ClientEvent::Unassigned);
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_classified() {
        let ensemble = MemoryEnsemble::new();
        let _a = member(&ensemble).await;
        let mut b = member(&ensemble).await;
        b.engine.become_follower().await.unwrap();

        ensemble.expire(b.ctx.store().session_id());
        let exit = b.engine.run_event_loop().await;
        assert_eq!(exit.reason, FollowerExitReason::SessionExpired);
        assert!(exit.cause.is_some());
    }
}
