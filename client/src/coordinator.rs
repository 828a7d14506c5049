//! Coordinator engine.
//!
//! Runs on the client with the smallest registration sequence. It watches
//! membership and the resource set, and on every (paced) round recomputes the
//! assignment and, when it changed, drives a stop-the-world handoff:
//!
//! 1. bump the epoch (fencing against other coordinators);
//! 2. write a `Revoking` record so every holder releases;
//! 3. wait until each reassigned resource's previous lock is gone;
//! 4. write the `Assigned` record at the new epoch.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use rebalancer_common::{
    AssignmentRecord, ClientId, CoordinatorExitReason, RebalancerError, Result,
};
use rebalancer_store::{Version, Watch};

use crate::assigner::assign;
use crate::barrier::ResourceBarrier;
use crate::context::{check_watch, EngineExit, SessionContext};
use crate::ownership::OwnershipTracker;

/// Outcome of trying to take the coordinator role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BecomeCoordinatorResult {
    Ok,
    NotSmallest,
}

enum RoundOutcome {
    Continue,
    Abdicate,
}

/// Exit of the coordinator loop.
pub type CoordinatorExit = EngineExit<CoordinatorExitReason>;

/// The coordinator role for one session.
pub struct CoordinatorEngine {
    ctx: SessionContext,
    client_id: ClientId,
    barrier: Arc<ResourceBarrier>,
    tracker: Arc<OwnershipTracker>,
    epoch_version: Version,
    clients_watch: Option<Watch>,
    resources_watch: Option<Watch>,
}

impl CoordinatorEngine {
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
            epoch_version: 0,
            clients_watch: None,
            resources_watch: None,
        }
    }

    /// Confirm this client is still the smallest registration and adopt
    /// `current_epoch` as the version the first round will advance.
    #[instrument(skip(self), fields(client_id = %self.client_id))]
    pub async fn become_coordinator(&mut self, current_epoch: Version) -> Result<BecomeCoordinatorResult> {
        let (clients, _) = self.ctx.clients(false).await?;
        if clients.first() != Some(&self.client_id) {
            debug!(smallest = ?clients.first(), "Not the smallest registration");
            return Ok(BecomeCoordinatorResult::NotSmallest);
        }
        self.epoch_version = current_epoch;
        info!(
            group = %self.ctx.group(),
            epoch = current_epoch,
            "Became coordinator"
        );
        Ok(BecomeCoordinatorResult::Ok)
    }

    /// Run rebalancing rounds until the role is lost or the session ends.
    pub async fn run_event_loop(&mut self) -> CoordinatorExit {
        let interval = self.ctx.config().min_rebalance_interval;
        let mut next_round = Instant::now() + interval;

        loop {
            // Pace: absorb notifications until the next round is due
            loop {
                tokio::select! {
                    _ = self.ctx.cancel().cancelled() => {
                        return CoordinatorExit::new(CoordinatorExitReason::Cancelled);
                    }
                    err = self.ctx.session_lost() => return Self::classify(err),
                    _ = tokio::time::sleep_until(next_round) => break,
                    event = Watch::next_in(&mut self.clients_watch) => {
                        if let Err(err) = check_watch(&event) {
                            return Self::classify(err);
                        }
                        debug!(path = %event.path, "Membership changed");
                    }
                    event = Watch::next_in(&mut self.resources_watch) => {
                        if let Err(err) = check_watch(&event) {
                            return Self::classify(err);
                        }
                        debug!(path = %event.path, "Resources changed");
                    }
                }
            }

            match self.round().await {
                Ok(RoundOutcome::Continue) => {}
                Ok(RoundOutcome::Abdicate) => {
                    self.ctx.metrics().abdicated();
                    return CoordinatorExit::new(CoordinatorExitReason::NoLongerCoordinator);
                }
                Err(err) => return Self::classify(err),
            }
            next_round = Instant::now() + interval;

            // Idle until something changes
            tokio::select! {
                _ = self.ctx.cancel().cancelled() => {
                    return CoordinatorExit::new(CoordinatorExitReason::Cancelled);
                }
                err = self.ctx.session_lost() => return Self::classify(err),
                event = Watch::next_in(&mut self.clients_watch) => {
                    if let Err(err) = check_watch(&event) {
                        return Self::classify(err);
                    }
                    debug!(path = %event.path, "Membership changed");
                }
                event = Watch::next_in(&mut self.resources_watch) => {
                    if let Err(err) = check_watch(&event) {
                        return Self::classify(err);
                    }
                    debug!(path = %event.path, "Resources changed");
                }
            }
        }
    }

    async fn round(&mut self) -> Result<RoundOutcome> {
        let epoch = self.ctx.increment_epoch(self.epoch_version).await?;
        self.epoch_version = epoch;

        // Re-arm only watches that have fired; a pending one still covers the path
        let (clients, clients_watch) = self.ctx.clients(self.clients_watch.is_none()).await?;
        if clients_watch.is_some() {
            self.clients_watch = clients_watch;
        }
        let (resources, resources_watch) =
            self.ctx.resources(self.resources_watch.is_none()).await?;
        if resources_watch.is_some() {
            self.resources_watch = resources_watch;
        }
        let (record, record_version, _) = self.ctx.read_assignment(false).await?;

        if clients.first() != Some(&self.client_id) {
            warn!(
                client_id = %self.client_id,
                smallest = ?clients.first(),
                "Lost coordinator priority"
            );
            return Ok(RoundOutcome::Abdicate);
        }

        let target = assign(&clients, &resources);
        if record.is_assigned_with(&target) {
            debug!(
                epoch = epoch,
                clients = clients.len(),
                resources = resources.len(),
                "Assignment unchanged"
            );
            self.ctx.metrics().round(false);
            self.tracker.apply(&record, &self.client_id, &self.barrier).await?;
            return Ok(RoundOutcome::Continue);
        }

        info!(
            group = %self.ctx.group(),
            epoch = epoch,
            clients = clients.len(),
            resources = resources.len(),
            "Rebalancing"
        );
        self.ctx.metrics().round(true);
        let revoking = AssignmentRecord::revoking(epoch);
        let revoking_version = self.ctx.write_assignment(&revoking, record_version).await?;

        let assigned = AssignmentRecord::assigned(epoch, target);
        self.handoff(&record, &revoking, &assigned, revoking_version)
            .await
            .map_err(|err| match err {
                RebalancerError::InvalidOperation(msg) => RebalancerError::InconsistentState(msg),
                other => other,
            })?;

        info!(epoch = epoch, "Rebalance committed");
        Ok(RoundOutcome::Continue)
    }

    /// Everything after the `Revoking` write. A failure here leaves the
    /// group revoked until the next coordinator round.
    async fn handoff(
        &self,
        previous: &AssignmentRecord,
        revoking: &AssignmentRecord,
        assigned: &AssignmentRecord,
        revoking_version: Version,
    ) -> Result<()> {
        self.tracker.apply(revoking, &self.client_id, &self.barrier).await?;

        let previous_owners = (!previous.is_revoking()).then(|| previous.owners());
        let mut handoffs: Vec<_> = assigned
            .owners()
            .into_iter()
            .filter(|(resource, owner)| {
                previous_owners
                    .as_ref()
                    .map(|owners| owners.get(resource) != Some(owner))
                    .unwrap_or(true)
            })
            .collect();
        handoffs.sort();

        for (resource, owner) in &handoffs {
            self.barrier.wait_until_free(resource, owner).await?;
        }
        debug!(moved = handoffs.len(), "Previous owners released");

        self.ctx.write_assignment(assigned, revoking_version).await?;
        self.tracker.apply(assigned, &self.client_id, &self.barrier).await
    }

    fn classify(err: RebalancerError) -> CoordinatorExit {
        let reason = match &err {
            RebalancerError::StaleVersion(_) => {
                warn!(error = %err, "Fenced by a newer coordinator");
                CoordinatorExitReason::NoLongerCoordinator
            }
            RebalancerError::Cancelled(_) => CoordinatorExitReason::Cancelled,
            RebalancerError::SessionExpired(_) => CoordinatorExitReason::SessionExpired,
            RebalancerError::InconsistentState(_) => {
                CoordinatorExitReason::PotentialInconsistentState
            }
            _ => CoordinatorExitReason::FatalError,
        };
        CoordinatorExit::with_cause(reason, err)
    }
}
