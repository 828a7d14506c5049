//! Metrics collection for rebalancing clients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Per-client rebalancing metrics.
pub struct RebalanceMetrics {
    /// Coordinator rounds run.
    pub rounds: AtomicU64,
    /// Rounds that performed a revoke/assign handoff.
    pub handoff_rounds: AtomicU64,
    /// Rounds that found the mapping already in force.
    pub idle_rounds: AtomicU64,
    /// Times this client lost the coordinator role.
    pub abdications: AtomicU64,
    /// Assignment events delivered.
    pub assignments: AtomicU64,
    /// Unassignment events delivered.
    pub unassignments: AtomicU64,
    /// Abort events delivered.
    pub aborts: AtomicU64,
    /// Barrier polls that found another holder.
    pub barrier_waits: AtomicU64,
    /// Store sessions opened.
    pub sessions: AtomicU64,
    /// Connection-loss retries, shared with the executor.
    pub store_retries: Arc<AtomicU64>,
}

impl RebalanceMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            rounds: AtomicU64::new(0),
            handoff_rounds: AtomicU64::new(0),
            idle_rounds: AtomicU64::new(0),
            abdications: AtomicU64::new(0),
            assignments: AtomicU64::new(0),
            unassignments: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            barrier_waits: AtomicU64::new(0),
            sessions: AtomicU64::new(0),
            store_retries: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a coordinator round; `handoff` when it rewrote the mapping.
    pub fn round(&self, handoff: bool) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        if handoff {
            self.handoff_rounds.fetch_add(1, Ordering::Relaxed);
        } else {
            self.idle_rounds.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record loss of the coordinator role.
    pub fn abdicated(&self) {
        self.abdications.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an assignment event.
    pub fn assigned(&self) {
        self.assignments.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an unassignment event.
    pub fn unassigned(&self) {
        self.unassignments.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an abort event.
    pub fn aborted(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a barrier poll that had to wait.
    pub fn barrier_wait(&self) {
        self.barrier_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new store session.
    pub fn session_opened(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rounds: self.rounds.load(Ordering::Relaxed),
            handoff_rounds: self.handoff_rounds.load(Ordering::Relaxed),
            idle_rounds: self.idle_rounds.load(Ordering::Relaxed),
            abdications: self.abdications.load(Ordering::Relaxed),
            assignments: self.assignments.load(Ordering::Relaxed),
            unassignments: self.unassignments.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            barrier_waits: self.barrier_waits.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
        }
    }
}

impl Default for RebalanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of `RebalanceMetrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub rounds: u64,
    pub handoff_rounds: u64,
    pub idle_rounds: u64,
    pub abdications: u64,
    pub assignments: u64,
    pub unassignments: u64,
    pub aborts: u64,
    pub barrier_waits: u64,
    pub sessions: u64,
    pub store_retries: u64,
}

impl MetricsSnapshot {
    /// Sum two snapshots field by field.
    pub fn merge(&self, other: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            rounds: self.rounds + other.rounds,
            handoff_rounds: self.handoff_rounds + other.handoff_rounds,
            idle_rounds: self.idle_rounds + other.idle_rounds,
            abdications: self.abdications + other.abdications,
            assignments: self.assignments + other.assignments,
            unassignments: self.unassignments + other.unassignments,
            aborts: self.aborts + other.aborts,
            barrier_waits: self.barrier_waits + other.barrier_waits,
            sessions: self.sessions + other.sessions,
            store_retries: self.store_retries + other.store_retries,
        }
    }
}
