//! Simulated group member.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rebalancer_client::{
    CallbackHandler, ClientConfig, ClientInternalState, ClientOptions, GroupId, RebalancerClient,
    RebalancerClientBuilder, ResourceId,
};
use rebalancer_common::SessionId;
use rebalancer_store::MemoryEnsemble;
use tracing::{info, warn};

/// Ownership events observed by one member.
#[derive(Debug, Default)]
pub struct MemberEvents {
    pub assignments: AtomicU64,
    pub unassignments: AtomicU64,
    pub aborts: AtomicU64,
}

/// A rebalancing client driven by the simulation.
pub struct SimulatedMember {
    /// Member name.
    pub name: String,
    client: RebalancerClient,
    events: Arc<MemberEvents>,
}

impl SimulatedMember {
    /// Create a member over the shared ensemble.
    pub fn new(
        name: impl Into<String>,
        ensemble: &MemoryEnsemble,
        config: ClientConfig,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let events = Arc::new(MemberEvents::default());

        let handler = {
            let (assigned, unassigned, aborted) = (events.clone(), events.clone(), events.clone());
            let (n1, n2, n3) = (name.clone(), name.clone(), name.clone());
            CallbackHandler::new()
                .with_assignment(move |resources: &[ResourceId]| {
                    assigned.assignments.fetch_add(1, Ordering::Relaxed);
                    info!(member = %n1, count = resources.len(), "Member assigned");
                })
                .with_unassignment(move || {
                    unassigned.unassignments.fetch_add(1, Ordering::Relaxed);
                    info!(member = %n2, "Member unassigned");
                })
                .with_aborted(move |reason, cause| {
                    aborted.aborts.fetch_add(1, Ordering::Relaxed);
                    warn!(member = %n3, reason = %reason, error = %cause, "Member aborted");
                })
        };

        let client = RebalancerClientBuilder::new()
            .config(config)
            .connector(ensemble.connector())
            .handler(Arc::new(handler))
            .build()?;

        Ok(Self {
            name,
            client,
            events,
        })
    }

    /// Join the group.
    pub async fn start(&self, group: &GroupId) -> anyhow::Result<()> {
        self.client
            .start(group.clone(), ClientOptions::with_auto_recovery())
            .await?;
        info!(member = %self.name, client_id = ?self.client.client_id(), "Member joined");
        Ok(())
    }

    /// Leave the group.
    pub async fn stop(&self, timeout: Duration) -> anyhow::Result<()> {
        self.client.stop(timeout).await?;
        info!(member = %self.name, "Member left");
        Ok(())
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.client.session_id()
    }

    pub fn state(&self) -> ClientInternalState {
        self.client.state()
    }

    pub fn assigned(&self) -> Vec<ResourceId> {
        self.client.assigned_resources()
    }

    pub fn client(&self) -> &RebalancerClient {
        &self.client
    }

    pub fn events(&self) -> &MemberEvents {
        &self.events
    }
}

/// Member naming.
pub struct MemberFactory;

impl MemberFactory {
    /// Name of the member created at `index`.
    pub fn name(index: usize) -> String {
        format!("member-{}", index)
    }

    /// Names of the first `count` resources.
    pub fn resources(count: usize) -> Vec<ResourceId> {
        (0..count)
            .map(|i| ResourceId::new(format!("res{}", i)))
            .collect()
    }
}
