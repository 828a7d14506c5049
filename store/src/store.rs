//! Coordination store capability surface.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use rebalancer_common::SessionId;

use crate::error::StoreResult;

/// Store version of a node. Incremented on every data write.
pub type Version = u64;

/// Connectivity of a store session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Establishing the initial connection.
    Connecting,
    /// Connected; calls can be issued.
    Connected,
    /// Temporarily disconnected; the session may still be alive.
    Disconnected,
    /// The session has expired. Terminal.
    Expired,
    /// The session was closed locally. Terminal.
    Closed,
}

impl SessionState {
    /// Check if the session can never be used again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Closed)
    }
}

/// Node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Data version.
    pub version: Version,
    /// Children version, bumped on every child create/delete.
    pub cversion: Version,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<SessionId>,
}

/// Kind of change a watch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The watched node was created.
    NodeCreated,
    /// The watched node was deleted.
    NodeDeleted,
    /// The watched node's data changed.
    DataChanged,
    /// A child was added to or removed from the watched node.
    ChildrenChanged,
    /// The session that armed the watch expired.
    SessionExpired,
    /// The watch was dropped without firing (session closed).
    Closed,
}

/// A fired watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub kind: WatchEventKind,
    /// Path the watch was armed on.
    pub path: String,
}

impl WatchEvent {
    /// Create a new watch event.
    pub fn new(kind: WatchEventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// One-shot change notification armed by a read.
///
/// Resolves once, on the next change of the watched path. It must be re-armed
/// with a fresh read after it fires.
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    /// Create a watch and the sender that fires it.
    pub fn channel(path: impl Into<String>) -> (oneshot::Sender<WatchEvent>, Watch) {
        let (tx, rx) = oneshot::channel();
        (tx, Watch { path: path.into(), rx })
    }

    /// Path the watch is armed on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait on an optional armed watch, clearing the slot once it fires.
    ///
    /// An empty slot never resolves, so it can sit in a `select!` until the
    /// caller re-arms it.
    pub async fn next_in(slot: &mut Option<Watch>) -> WatchEvent {
        match slot {
            Some(watch) => {
                let event = watch.await;
                *slot = None;
                event
            }
            None => std::future::pending().await,
        }
    }
}

impl Future for Watch {
    type Output = WatchEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(event)) => Poll::Ready(event),
            Poll::Ready(Err(_)) => {
                Poll::Ready(WatchEvent::new(WatchEventKind::Closed, self.path.clone()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Result of reading a node's data.
#[derive(Debug)]
pub struct DataResult {
    /// Node payload.
    pub data: Vec<u8>,
    /// Node metadata.
    pub stat: Stat,
    /// Armed watch, when requested.
    pub watch: Option<Watch>,
}

/// Result of listing a node's children.
#[derive(Debug)]
pub struct ChildrenResult {
    /// Child names (not full paths), unordered.
    pub children: Vec<String>,
    /// Parent metadata.
    pub stat: Stat,
    /// Armed watch, when requested.
    pub watch: Option<Watch>,
}

/// Result of an existence check.
#[derive(Debug)]
pub struct ExistsResult {
    /// Metadata if the node exists.
    pub stat: Option<Stat>,
    /// Armed watch, when requested. Fires on create, delete or data change.
    pub watch: Option<Watch>,
}

/// A session on a consistent coordination store.
///
/// One instance is one session: ephemeral nodes it creates live exactly as
/// long as the session does.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Identifier of this session.
    fn session_id(&self) -> SessionId;

    /// Connectivity notifications for this session.
    fn session_state(&self) -> watch::Receiver<SessionState>;

    /// Create a persistent node (and missing ancestors) if absent.
    async fn ensure_path(&self, path: &str, data: Option<Vec<u8>>) -> StoreResult<()>;

    /// Create an ephemeral sequential child; returns the created path.
    async fn create_ephemeral_sequential(
        &self,
        parent: &str,
        prefix: &str,
        data: Vec<u8>,
    ) -> StoreResult<String>;

    /// Create an ephemeral node; fails with `NodeExists` if present.
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> StoreResult<()>;

    /// Delete a node. Returns `false` when it was already absent.
    async fn delete(&self, path: &str) -> StoreResult<bool>;

    /// List children, optionally arming a children watch.
    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<ChildrenResult>;

    /// Read data, optionally arming a data watch.
    async fn get_data(&self, path: &str, watch: bool) -> StoreResult<DataResult>;

    /// Compare-and-set write. `None` skips the version check.
    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<Version>,
    ) -> StoreResult<Stat>;

    /// Check existence, optionally arming a watch even when absent.
    async fn exists(&self, path: &str, watch: bool) -> StoreResult<ExistsResult>;

    /// Close the session; its ephemeral nodes are removed.
    async fn close(&self) -> StoreResult<()>;
}

/// Opens new store sessions.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Open a session with the given expiry timeout.
    async fn connect(&self, session_timeout: Duration) -> StoreResult<Arc<dyn CoordinationStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watch_fires_once() {
        let (tx, watch) = Watch::channel("/a");
        let mut slot = Some(watch);
        tx.send(WatchEvent::new(WatchEventKind::DataChanged, "/a")).unwrap();

        let event = Watch::next_in(&mut slot).await;
        assert_eq!(event.kind, WatchEventKind::DataChanged);
        assert!(slot.is_none());
    }

    #[test]
    fn test_watch_pending_until_sent() {
        let (tx, watch) = Watch::channel("/a");
        let mut task = tokio_test::task::spawn(watch);
        tokio_test::assert_pending!(task.poll());

        tx.send(WatchEvent::new(WatchEventKind::NodeDeleted, "/a")).unwrap();
        assert!(task.is_woken());
        let event = tokio_test::assert_ready!(task.poll());
        assert_eq!(event.kind, WatchEventKind::NodeDeleted);
    }

    #[tokio::test]
    async fn test_dropped_watch_reports_closed() {
        let (tx, watch) = Watch::channel("/a");
        drop(tx);
        assert_eq!(watch.await.kind, WatchEventKind::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_slot_never_resolves() {
        let mut slot: Option<Watch> = None;
        let result =
            tokio::time::timeout(Duration::from_secs(1), Watch::next_in(&mut slot)).await;
        assert!(result.is_err());
    }
}
