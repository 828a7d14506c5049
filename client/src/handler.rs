//! Rebalance event handlers.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info};

use rebalancer_common::{AbortReason, RebalancerError, ResourceId};

/// Receives ownership changes for one client.
///
/// Calls are serialized: at most one callback runs at a time, and
/// `on_unassignment` always precedes the next `on_assignment`.
#[async_trait]
pub trait RebalanceHandler: Send + Sync {
    /// The client now exclusively owns `resources` (never empty).
    async fn on_assignment(&self, resources: &[ResourceId]);

    /// Every resource held so far is being taken away. Processing must stop
    /// before this returns.
    async fn on_unassignment(&self);

    /// A fatal failure ended the current session.
    async fn on_aborted(&self, reason: AbortReason, cause: &RebalancerError);
}

/// Default handler that logs events but does nothing else.
pub struct LoggingHandler;

#[async_trait]
impl RebalanceHandler for LoggingHandler {
    async fn on_assignment(&self, resources: &[ResourceId]) {
        info!(count = resources.len(), resources = ?resources, "Resources assigned");
    }

    async fn on_unassignment(&self) {
        info!("Resources unassigned");
    }

    async fn on_aborted(&self, reason: AbortReason, cause: &RebalancerError) {
        error!(reason = %reason, error = %cause, "Client aborted");
    }
}

type AssignFn = Box<dyn Fn(&[ResourceId]) + Send + Sync>;
type UnassignFn = Box<dyn Fn() + Send + Sync>;
type AbortFn = Box<dyn Fn(AbortReason, &RebalancerError) + Send + Sync>;

/// Handler that forwards events to callback functions.
#[derive(Default)]
pub struct CallbackHandler {
    on_assignment: Option<AssignFn>,
    on_unassignment: Option<UnassignFn>,
    on_aborted: Option<AbortFn>,
}

impl CallbackHandler {
    /// Create a handler with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set assignment callback.
    pub fn with_assignment<F>(mut self, callback: F) -> Self
    where
        F: Fn(&[ResourceId]) + Send + Sync + 'static,
    {
        self.on_assignment = Some(Box::new(callback));
        self
    }

    /// Set unassignment callback.
    pub fn with_unassignment<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_unassignment = Some(Box::new(callback));
        self
    }

    /// Set abort callback.
    pub fn with_aborted<F>(mut self, callback: F) -> Self
    where
        F: Fn(AbortReason, &RebalancerError) + Send + Sync + 'static,
    {
        self.on_aborted = Some(Box::new(callback));
        self
    }
}

#[async_trait]
impl RebalanceHandler for CallbackHandler {
    async fn on_assignment(&self, resources: &[ResourceId]) {
        if let Some(callback) = &self.on_assignment {
            callback(resources);
        }
    }

    async fn on_unassignment(&self) {
        if let Some(callback) = &self.on_unassignment {
            callback();
        }
    }

    async fn on_aborted(&self, reason: AbortReason, cause: &RebalancerError) {
        if let Some(callback) = &self.on_aborted {
            callback(reason, cause);
        }
    }
}

/// An event as delivered by `ChannelHandler`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Assigned(Vec<ResourceId>),
    Unassigned,
    Aborted { reason: AbortReason, cause: String },
}

/// Handler that forwards events into an unbounded channel.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RebalanceHandler for ChannelHandler {
    async fn on_assignment(&self, resources: &[ResourceId]) {
        let _ = self.tx.send(ClientEvent::Assigned(resources.to_vec()));
    }

    async fn on_unassignment(&self) {
        let _ = self.tx.send(ClientEvent::Unassigned);
    }

    async fn on_aborted(&self, reason: AbortReason, cause: &RebalancerError) {
        let _ = self.tx.send(ClientEvent::Aborted {
            reason,
            cause: cause.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_callback_handler() {
        let assigned = Arc::new(AtomicUsize::new(0));
        let counter = assigned.clone();
        let handler = CallbackHandler::new().with_assignment(move |resources| {
            counter.fetch_add(resources.len(), Ordering::SeqCst);
        });

        tokio_test::block_on(async {
            handler
                .on_assignment(&[ResourceId::new("a"), ResourceId::new("b")])
                .await;
            handler.on_unassignment().await;
        });
        assert_eq!(assigned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_channel_handler() {
        let (handler, mut rx) = ChannelHandler::new();
        handler.on_assignment(&[ResourceId::new("a")]).await;
        handler.on_unassignment().await;
        handler
            .on_aborted(
                AbortReason::SessionExpired,
                &RebalancerError::SessionExpired("gone".into()),
            )
            .await;

        assert_eq!(rx.recv().await, Some(ClientEvent::Assigned(vec![ResourceId::new("a")])));
        assert_eq!(rx.recv().await, Some(ClientEvent::Unassigned));
        assert!(matches!(
            rx.recv().await,
            Some(ClientEvent::Aborted { reason: AbortReason::SessionExpired, .. })
        ));
    }
}
