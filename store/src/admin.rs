//! Group administration: layout preparation and resource set changes.
//!
//! Used by operators, tests and the simulator. Clients never mutate the
//! resource set themselves.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use rebalancer_common::{AssignmentRecord, ClientId, GroupId, RebalancerError, ResourceId, Result};

use crate::executor::ResilientExecutor;
use crate::paths::GroupPaths;
use crate::store::CoordinationStore;

/// Administrative handle on one group.
#[derive(Clone)]
pub struct GroupAdmin {
    executor: ResilientExecutor,
    paths: GroupPaths,
    group: GroupId,
    cancel: CancellationToken,
}

impl GroupAdmin {
    /// Create an admin handle over a store session.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        root: &str,
        group: GroupId,
        retry_interval: std::time::Duration,
    ) -> Self {
        Self {
            executor: ResilientExecutor::new(store, retry_interval),
            paths: GroupPaths::new(root, &group),
            group,
            cancel: CancellationToken::new(),
        }
    }

    /// Paths of the administered group.
    pub fn paths(&self) -> &GroupPaths {
        &self.paths
    }

    /// Create the group layout and the given resources.
    #[instrument(skip(self, resources), fields(group = %self.group))]
    pub async fn prepare(&self, resources: &[ResourceId]) -> Result<()> {
        if !self.group.is_valid() {
            return Err(RebalancerError::Configuration(format!(
                "invalid group name: {:?}",
                self.group.as_str()
            )));
        }
        for root in self.paths.roots() {
            let store = self.executor.store();
            self.executor
                .run("ensure_path", &self.cancel, move || async move {
                    store.ensure_path(root, None).await
                })
                .await?;
        }
        for resource in resources {
            self.add_resource(resource).await?;
        }
        info!(resources = resources.len(), "Group prepared");
        Ok(())
    }

    /// Add a resource to the group.
    #[instrument(skip(self), fields(group = %self.group))]
    pub async fn add_resource(&self, resource: &ResourceId) -> Result<()> {
        let path = self.paths.resource(resource);
        let store = self.executor.store();
        let path_ref = path.as_str();
        self.executor
            .run("add_resource", &self.cancel, move || async move {
                store.ensure_path(path_ref, None).await
            })
            .await?;
        info!(resource = %resource, "Resource added");
        Ok(())
    }

    /// Remove a resource and its barrier lock, if any.
    #[instrument(skip(self), fields(group = %self.group))]
    pub async fn remove_resource(&self, resource: &ResourceId) -> Result<()> {
        let barrier = self.paths.barrier(resource);
        let path = self.paths.resource(resource);
        let store = self.executor.store();
        let (barrier_ref, path_ref) = (barrier.as_str(), path.as_str());
        self.executor
            .run("remove_resource", &self.cancel, move || async move {
                store.delete(barrier_ref).await?;
                store.delete(path_ref).await
            })
            .await?;
        info!(resource = %resource, "Resource removed");
        Ok(())
    }

    /// Current resources, sorted.
    pub async fn resources(&self) -> Result<Vec<ResourceId>> {
        let store = self.executor.store();
        let path = self.paths.resources.as_str();
        let listing = self
            .executor
            .run("resources", &self.cancel, move || async move {
                store.get_children(path, false).await
            })
            .await?;
        let mut resources: Vec<ResourceId> =
            listing.children.into_iter().map(ResourceId::from).collect();
        resources.sort();
        Ok(resources)
    }

    /// Registered clients, sorted by join sequence.
    pub async fn active_clients(&self) -> Result<Vec<ClientId>> {
        let store = self.executor.store();
        let path = self.paths.clients.as_str();
        let listing = self
            .executor
            .run("clients", &self.cancel, move || async move {
                store.get_children(path, false).await
            })
            .await?;
        let mut clients: Vec<ClientId> = listing.children.into_iter().map(ClientId::new).collect();
        ClientId::sort_by_sequence(&mut clients);
        Ok(clients)
    }

    /// The persisted assignment record.
    pub async fn read_assignment(&self) -> Result<AssignmentRecord> {
        let store = self.executor.store();
        let path = self.paths.assignment.as_str();
        let data = self
            .executor
            .run("read_assignment", &self.cancel, move || async move {
                store.get_data(path, false).await
            })
            .await?;
        AssignmentRecord::from_bytes(&data.data)
    }

    /// Holder of a resource's barrier lock, if any.
    pub async fn barrier_holder(&self, resource: &ResourceId) -> Result<Option<ClientId>> {
        let store = self.executor.store();
        let path = self.paths.barrier(resource);
        let path_ref = path.as_str();
        let result = self
            .executor
            .run("barrier_holder", &self.cancel, move || async move {
                match store.get_data(path_ref, false).await {
                    Ok(data) => Ok(Some(data.data)),
                    Err(crate::StoreError::NoNode(_)) => Ok(None),
                    Err(err) => Err(err),
                }
            })
            .await?;
        Ok(result.map(|data| ClientId::new(String::from_utf8_lossy(&data).into_owned())))
    }
}
