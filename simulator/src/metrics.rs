//! Simulation metrics.

use std::sync::atomic::Ordering;

use rebalancer_client::MetricsSnapshot;
use serde::Serialize;

use crate::member::MemberEvents;

/// Simulation metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationMetrics {
    /// Scenario or churn steps executed.
    pub steps: u64,
    /// Members started.
    pub joins: u64,
    /// Members stopped.
    pub leaves: u64,
    /// Faults injected.
    pub faults: u64,
    /// Resources added or removed.
    pub resource_changes: u64,
    /// Ownership checks performed.
    pub checks: u64,
    /// Checks that found a resource with two holders.
    pub exclusivity_violations: u64,
    /// Checks that found unowned resources after settling.
    pub uncovered: u64,
    /// Client-side counters summed over every member.
    pub clients: MetricsSnapshot,
    /// Handler callbacks summed over every member.
    pub events: EventTotals,
}

/// Ownership callbacks observed across members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventTotals {
    pub assignments: u64,
    pub unassignments: u64,
    pub aborts: u64,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one ownership check.
    pub fn record_check(&mut self, exclusive: bool, covered: bool) {
        self.checks += 1;
        if !exclusive {
            self.exclusivity_violations += 1;
        }
        if !covered {
            self.uncovered += 1;
        }
    }

    /// Fold a member's client metrics in.
    pub fn absorb(&mut self, snapshot: &MetricsSnapshot) {
        self.clients = self.clients.merge(snapshot);
    }

    /// Fold a member's handler callback counts in.
    pub fn absorb_events(&mut self, events: &MemberEvents) {
        self.events.assignments += events.assignments.load(Ordering::Relaxed);
        self.events.unassignments += events.unassignments.load(Ordering::Relaxed);
        self.events.aborts += events.aborts.load(Ordering::Relaxed);
    }

    /// Share of checks that found full coverage.
    pub fn coverage_rate(&self) -> f64 {
        if self.checks == 0 {
            return 0.0;
        }

        (self.checks - self.uncovered) as f64 / self.checks as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let mut metrics = SimulationMetrics::new();

        metrics.record_check(true, true);
        metrics.record_check(true, false);
        metrics.record_check(false, true);
        metrics.record_check(true, true);

        assert_eq!(metrics.checks, 4);
        assert_eq!(metrics.exclusivity_violations, 1);
        assert_eq!(metrics.uncovered, 1);
        assert_eq!(metrics.coverage_rate(), 0.75);
    }

    #[test]
    fn test_absorb_sums_clients() {
        let mut metrics = SimulationMetrics::new();
        let snapshot = MetricsSnapshot {
            rounds: 2,
            sessions: 1,
            ..Default::default()
        };
        metrics.absorb(&snapshot);
        metrics.absorb(&snapshot);
        assert_eq!(metrics.clients.rounds, 4);
        assert_eq!(metrics.clients.sessions, 2);
    }

    #[test]
    fn test_absorb_events_sums_members() {
        let mut metrics = SimulationMetrics::new();
        let first = MemberEvents::default();
        first.assignments.store(3, Ordering::Relaxed);
        first.unassignments.store(2, Ordering::Relaxed);
        let second = MemberEvents::default();
        second.assignments.store(1, Ordering::Relaxed);
        second.aborts.store(1, Ordering::Relaxed);

        metrics.absorb_events(&first);
        metrics.absorb_events(&second);
        assert_eq!(
            metrics.events,
            EventTotals {
                assignments: 4,
                unassignments: 2,
                aborts: 1,
            }
        );
    }
}
