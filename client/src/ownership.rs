//! Local ownership tracking and event delivery.
//!
//! The tracker outlives engines and sessions: it remembers which resources
//! the application was told it owns and which mapping was last applied, and
//! it is the only place that invokes the rebalance handler for ownership
//! changes. All transitions are serialized behind one async mutex.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use rebalancer_common::{AssignmentRecord, ClientId, NormalizedMapping, ResourceId, Result};

use crate::barrier::ResourceBarrier;
use crate::handler::RebalanceHandler;
use crate::metrics::RebalanceMetrics;

#[derive(Debug, Default)]
struct TrackerState {
    held: Vec<ResourceId>,
    applied_epoch: u64,
    applied: Option<NormalizedMapping>,
}

/// Applies assignment records to this client's resources.
pub struct OwnershipTracker {
    handler: Arc<dyn RebalanceHandler>,
    metrics: Arc<RebalanceMetrics>,
    state: Mutex<TrackerState>,
    published: RwLock<Vec<ResourceId>>,
}

impl OwnershipTracker {
    pub fn new(handler: Arc<dyn RebalanceHandler>, metrics: Arc<RebalanceMetrics>) -> Self {
        Self {
            handler,
            metrics,
            state: Mutex::new(TrackerState::default()),
            published: RwLock::new(Vec::new()),
        }
    }

    /// Resources the application currently owns.
    pub fn assigned(&self) -> Vec<ResourceId> {
        self.published.read().clone()
    }

    /// Apply a record read from the store.
    ///
    /// Records older than the last applied one are discarded. A revoking
    /// record releases everything. An assigned record whose mapping differs
    /// from the last applied one revokes, acquires this client's slice and
    /// announces it; the same mapping again is a no-op.
    pub async fn apply(
        &self,
        record: &AssignmentRecord,
        client_id: &ClientId,
        barrier: &ResourceBarrier,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if record.epoch < state.applied_epoch {
            debug!(
                epoch = record.epoch,
                applied_epoch = state.applied_epoch,
                "Discarding stale assignment record"
            );
            return Ok(());
        }
        state.applied_epoch = record.epoch;

        if record.is_revoking() {
            return self.revoke_locked(&mut state, barrier).await;
        }

        let mapping = record.normalized();
        if state.applied.as_ref() == Some(&mapping) {
            return Ok(());
        }

        self.revoke_locked(&mut state, barrier).await?;

        let mut acquired = Vec::new();
        for resource in record.resources_for(client_id) {
            if barrier.try_acquire(&resource).await? {
                acquired.push(resource);
            }
        }
        state.applied = Some(mapping);

        if !acquired.is_empty() {
            state.held = acquired.clone();
            *self.published.write() = acquired.clone();
            info!(
                client_id = %client_id,
                epoch = record.epoch,
                count = acquired.len(),
                "Resources assigned"
            );
            self.metrics.assigned();
            self.handler.on_assignment(&acquired).await;
        }
        Ok(())
    }

    /// Take every held resource away and release the locks.
    pub async fn revoke(&self, barrier: &ResourceBarrier) -> Result<()> {
        let mut state = self.state.lock().await;
        self.revoke_locked(&mut state, barrier).await
    }

    /// Take held resources away when no lock handle exists any more.
    pub async fn revoke_detached(&self) {
        let mut state = self.state.lock().await;
        self.unassign(&mut state).await;
    }

    async fn revoke_locked(&self, state: &mut TrackerState, barrier: &ResourceBarrier) -> Result<()> {
        self.unassign(state).await;
        barrier.release_all().await
    }

    async fn unassign(&self, state: &mut TrackerState) {
        state.applied = None;
        if state.held.is_empty() {
            return;
        }
        info!(count = state.held.len(), "Resources unassigned");
        state.held.clear();
        self.published.write().clear();
        self.metrics.unassigned();
        self.handler.on_unassignment().await;
    }
}
