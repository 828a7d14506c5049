//! Per-resource handoff barrier.
//!
//! A resource may be processed only by the client holding its `barrier`
//! lock node. The lock is ephemeral, so a crashed holder releases it when its
//! session expires.

use dashmap::DashSet;
use tracing::{debug, trace};

use rebalancer_common::{ClientId, RebalancerError, ResourceId, Result};
use rebalancer_store::StoreError;

use crate::context::SessionContext;

enum Attempt {
    Created,
    HeldBy(Vec<u8>),
    Vanished,
    ResourceMissing,
}

/// Lock handle for the resources of one client in one session.
pub struct ResourceBarrier {
    ctx: SessionContext,
    owner: ClientId,
    held: DashSet<ResourceId>,
}

impl ResourceBarrier {
    /// Create a barrier handle acquiring on behalf of `owner`.
    pub fn new(ctx: SessionContext, owner: ClientId) -> Self {
        Self {
            ctx,
            owner,
            held: DashSet::new(),
        }
    }

    /// The same locks driven under another context (e.g. a fresh
    /// cancellation token for cleanup).
    pub fn with_context(&self, ctx: SessionContext) -> Self {
        let held = DashSet::new();
        for resource in self.held.iter() {
            held.insert(resource.clone());
        }
        Self {
            ctx,
            owner: self.owner.clone(),
            held,
        }
    }

    /// Client the locks are taken for.
    pub fn owner_id(&self) -> &ClientId {
        &self.owner
    }

    /// Resources whose lock this handle holds.
    pub fn held(&self) -> Vec<ResourceId> {
        let mut held: Vec<ResourceId> = self.held.iter().map(|r| r.clone()).collect();
        held.sort();
        held
    }

    /// Take the lock of `resource`, waiting while another client holds it.
    ///
    /// Returns `Ok(false)` if the resource was removed from the group.
    pub async fn try_acquire(&self, resource: &ResourceId) -> Result<bool> {
        let path = self.ctx.paths().barrier(resource);
        let path_ref = path.as_str();
        let store = self.ctx.store();
        let payload = self.owner.as_str().as_bytes();
        let poll_interval = self.ctx.config().barrier_poll_interval;

        loop {
            let attempt = self
                .ctx
                .executor()
                .run("acquire_barrier", self.ctx.cancel(), move || async move {
                    match store.create_ephemeral(path_ref, payload.to_vec()).await {
                        Ok(()) => Ok(Attempt::Created),
                        Err(StoreError::NodeExists(_)) => {
                            match store.get_data(path_ref, false).await {
                                Ok(result) => Ok(Attempt::HeldBy(result.data)),
                                Err(StoreError::NoNode(_)) => Ok(Attempt::Vanished),
                                Err(err) => Err(err),
                            }
                        }
                        Err(StoreError::NoNode(_)) => Ok(Attempt::ResourceMissing),
                        Err(err) => Err(err),
                    }
                })
                .await?;

            match attempt {
                Attempt::Created => break,
                Attempt::HeldBy(holder) if holder == payload => break,
                Attempt::HeldBy(holder) => {
                    self.ctx.metrics().barrier_wait();
                    trace!(
                        resource = %resource,
                        holder = %String::from_utf8_lossy(&holder),
                        "Barrier held by another client"
                    );
                    tokio::select! {
                        _ = self.ctx.cancel().cancelled() => {
                            return Err(RebalancerError::Cancelled(format!(
                                "waiting for barrier of {}",
                                resource
                            )));
                        }
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                Attempt::Vanished => continue,
                Attempt::ResourceMissing => {
                    debug!(resource = %resource, "Resource removed before barrier acquired");
                    return Ok(false);
                }
            }
        }

        self.held.insert(resource.clone());
        debug!(resource = %resource, client_id = %self.owner, "Barrier acquired");
        Ok(true)
    }

    /// Release the lock of `resource` if this client holds it.
    pub async fn release(&self, resource: &ResourceId) -> Result<()> {
        if self.owner(resource).await?.as_ref() == Some(&self.owner) {
            let path = self.ctx.paths().barrier(resource);
            let path_ref = path.as_str();
            let store = self.ctx.store();
            self.ctx
                .executor()
                .run("release_barrier", self.ctx.cancel(), move || async move {
                    store.delete(path_ref).await
                })
                .await?;
            debug!(resource = %resource, client_id = %self.owner, "Barrier released");
        }
        self.held.remove(resource);
        Ok(())
    }

    /// Release every held lock. Continues past failures and returns the
    /// first one.
    pub async fn release_all(&self) -> Result<()> {
        let mut first_error = None;
        for resource in self.held() {
            if let Err(err) = self.release(&resource).await {
                self.held.remove(&resource);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Current holder of a resource's lock.
    pub async fn owner(&self, resource: &ResourceId) -> Result<Option<ClientId>> {
        self.ctx.barrier_owner(resource).await
    }

    /// Wait until a resource's lock is absent or held by `allowed_owner`.
    ///
    /// Used by the coordinator before committing a handoff.
    pub async fn wait_until_free(
        &self,
        resource: &ResourceId,
        allowed_owner: &ClientId,
    ) -> Result<()> {
        let poll_interval = self.ctx.config().barrier_poll_interval;
        loop {
            match self.owner(resource).await? {
                None => return Ok(()),
                Some(holder) if &holder == allowed_owner => return Ok(()),
                Some(holder) => {
                    self.ctx.metrics().barrier_wait();
                    trace!(resource = %resource, holder = %holder, "Waiting for previous owner");
                }
            }
            tokio::select! {
                _ = self.ctx.cancel().cancelled() => {
                    return Err(RebalancerError::Cancelled(format!(
                        "waiting for release of {}",
                        resource
                    )));
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}
