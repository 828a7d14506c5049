//! In-memory coordination store.
//!
//! A single `MemoryEnsemble` holds the node tree shared by every session it
//! hands out. It models the parts of a consistent coordination service the
//! rebalancer depends on: versioned nodes, ephemeral and sequential creation,
//! one-shot watches and session loss. Fault injection hooks let tests and the
//! simulator disconnect, reconnect and expire individual sessions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use rebalancer_common::SessionId;

use crate::error::{StoreError, StoreResult};
use crate::store::{
    ChildrenResult, CoordinationStore, DataResult, ExistsResult, Stat, StoreConnector, Version,
    Watch, WatchEvent, WatchEventKind, SessionState,
};

type Watchers = HashMap<String, Vec<(SessionId, oneshot::Sender<WatchEvent>)>>;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: Version,
    cversion: Version,
    ephemeral_owner: Option<SessionId>,
    next_seq: u64,
    children: BTreeSet<String>,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: 0,
            cversion: 0,
            ephemeral_owner,
            next_seq: 0,
            children: BTreeSet::new(),
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            cversion: self.cversion,
            ephemeral_owner: self.ephemeral_owner,
        }
    }
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<String, Node>,
    data_watches: Watchers,
    child_watches: Watchers,
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn fire(watchers: &mut Watchers, path: &str, kind: WatchEventKind) {
    if let Some(list) = watchers.remove(path) {
        for (_, tx) in list {
            let _ = tx.send(WatchEvent::new(kind, path));
        }
    }
}

fn validate_path(path: &str) -> StoreResult<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(StoreError::Other(format!("Invalid path: {}", path)));
    }
    Ok(())
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }

    fn create(
        &mut self,
        path: String,
        data: Vec<u8>,
        owner: Option<SessionId>,
    ) -> StoreResult<()> {
        if self.nodes.contains_key(&path) {
            return Err(StoreError::NodeExists(path));
        }
        let parent_path = parent_of(&path)
            .ok_or_else(|| StoreError::NodeExists(path.clone()))?
            .to_string();
        let parent = self
            .nodes
            .get_mut(&parent_path)
            .ok_or_else(|| StoreError::NoNode(parent_path.clone()))?;
        if parent.ephemeral_owner.is_some() {
            return Err(StoreError::NoChildrenForEphemerals(parent_path));
        }
        parent.children.insert(name_of(&path).to_string());
        parent.cversion += 1;

        self.nodes.insert(path.clone(), Node::new(data, owner));
        fire(&mut self.child_watches, &parent_path, WatchEventKind::ChildrenChanged);
        fire(&mut self.data_watches, &path, WatchEventKind::NodeCreated);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> StoreResult<bool> {
        let node = match self.nodes.get(path) {
            Some(node) => node,
            None => return Ok(false),
        };
        if !node.children.is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        self.nodes.remove(path);
        if let Some(parent_path) = parent_of(path) {
            if let Some(parent) = self.nodes.get_mut(parent_path) {
                parent.children.remove(name_of(path));
                parent.cversion += 1;
            }
            fire(&mut self.child_watches, parent_path, WatchEventKind::ChildrenChanged);
        }
        fire(&mut self.data_watches, path, WatchEventKind::NodeDeleted);
        fire(&mut self.child_watches, path, WatchEventKind::NodeDeleted);
        Ok(true)
    }

    fn arm(watchers: &mut Watchers, session: SessionId, path: &str) -> Watch {
        let (tx, watch) = Watch::channel(path);
        let list = watchers.entry(path.to_string()).or_default();
        // Watches whose receiver was dropped can never be delivered
        list.retain(|(_, tx)| !tx.is_closed());
        list.push((session, tx));
        watch
    }

    /// Remove every watch armed by a session, notifying it with `kind` or
    /// dropping it silently.
    fn disarm_session(&mut self, session: SessionId, kind: Option<WatchEventKind>) {
        for watchers in [&mut self.data_watches, &mut self.child_watches] {
            for (path, list) in watchers.iter_mut() {
                let (mine, rest): (Vec<_>, Vec<_>) =
                    list.drain(..).partition(|(owner, _)| *owner == session);
                *list = rest;
                if let Some(kind) = kind {
                    for (_, tx) in mine {
                        let _ = tx.send(WatchEvent::new(kind, path.clone()));
                    }
                }
            }
            watchers.retain(|_, list| !list.is_empty());
        }
    }

    fn ephemerals_of(&self, session: SessionId) -> Vec<String> {
        let mut paths: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }
}

#[derive(Debug)]
struct SessionSlot {
    state: watch::Sender<SessionState>,
    session_timeout: Duration,
    /// Incremented on every disconnect; guards delayed expiry timers.
    disconnects: u64,
    /// Pending injected connection-loss failures.
    fail_next: u32,
}

#[derive(Debug)]
struct Inner {
    tree: Mutex<Tree>,
    sessions: DashMap<SessionId, SessionSlot>,
}

/// Shared in-memory node tree and session registry.
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    inner: Arc<Inner>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    /// Create an empty ensemble containing only the root node.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(Tree::new()),
                sessions: DashMap::new(),
            }),
        }
    }

    /// Connector handing out sessions on this ensemble.
    pub fn connector(&self) -> Arc<dyn StoreConnector> {
        Arc::new(MemoryConnector {
            ensemble: self.clone(),
        })
    }

    /// Open a connected session directly.
    pub fn session(&self, session_timeout: Duration) -> Arc<MemorySession> {
        let id = SessionId::new();
        let (tx, rx) = watch::channel(SessionState::Connected);
        self.inner.sessions.insert(
            id,
            SessionSlot {
                state: tx,
                session_timeout,
                disconnects: 0,
                fail_next: 0,
            },
        );
        debug!(session = %id, "Memory session opened");
        Arc::new(MemorySession {
            id,
            inner: self.inner.clone(),
            state_rx: rx,
        })
    }

    /// Current state of a session that is still registered here. Closed and
    /// expired sessions are forgotten.
    pub fn session_state(&self, session: SessionId) -> Option<SessionState> {
        self.inner
            .sessions
            .get(&session)
            .map(|slot| *slot.state.borrow())
    }

    /// Drop a session's connection. It expires if not reconnected within its
    /// session timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn disconnect(&self, session: SessionId) {
        let (generation, timeout) = {
            let mut slot = match self.inner.sessions.get_mut(&session) {
                Some(slot) => slot,
                None => return,
            };
            if *slot.state.borrow() != SessionState::Connected {
                return;
            }
            slot.disconnects += 1;
            slot.state.send_replace(SessionState::Disconnected);
            (slot.disconnects, slot.session_timeout)
        };
        info!(session = %session, "Session disconnected");

        let ensemble = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_down = ensemble
                .inner
                .sessions
                .get(&session)
                .map(|slot| {
                    slot.disconnects == generation
                        && *slot.state.borrow() == SessionState::Disconnected
                })
                .unwrap_or(false);
            if still_down {
                ensemble.expire(session);
            }
        });
    }

    /// Restore a disconnected session.
    pub fn reconnect(&self, session: SessionId) {
        if let Some(slot) = self.inner.sessions.get(&session) {
            if *slot.state.borrow() == SessionState::Disconnected {
                slot.state.send_replace(SessionState::Connected);
                info!(session = %session, "Session reconnected");
            }
        }
    }

    /// Expire a session: delete its ephemeral nodes, fire the affected
    /// watches and notify its own watches with `SessionExpired`.
    pub fn expire(&self, session: SessionId) {
        {
            let slot = match self.inner.sessions.get(&session) {
                Some(slot) => slot,
                None => return,
            };
            if slot.state.borrow().is_terminal() {
                return;
            }
            slot.state.send_replace(SessionState::Expired);
        }
        self.end_session(session, Some(WatchEventKind::SessionExpired));
        self.inner.sessions.remove(&session);
        info!(session = %session, "Session expired");
    }

    /// Fail the next `count` calls of a session with `ConnectionLoss`.
    pub fn fail_next_calls(&self, session: SessionId, count: u32) {
        if let Some(mut slot) = self.inner.sessions.get_mut(&session) {
            slot.fail_next = count;
        }
    }

    /// Number of sessions still registered.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Data and child watch registrations held on a path.
    pub fn watch_count(&self, path: &str) -> usize {
        let tree = self.inner.tree.lock();
        [&tree.data_watches, &tree.child_watches]
            .iter()
            .filter_map(|watchers| watchers.get(path))
            .map(Vec::len)
            .sum()
    }

    /// Check whether a node exists, bypassing sessions.
    pub fn contains(&self, path: &str) -> bool {
        self.inner.tree.lock().nodes.contains_key(path)
    }

    /// Read a node's payload, bypassing sessions.
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.tree.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// Child names of a node in lexicographic order, bypassing sessions.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.inner
            .tree
            .lock()
            .nodes
            .get(path)
            .map(|n| n.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn end_session(&self, session: SessionId, notify: Option<WatchEventKind>) {
        let mut tree = self.inner.tree.lock();
        tree.disarm_session(session, notify);
        for path in tree.ephemerals_of(session) {
            let _ = tree.remove(&path);
        }
    }
}

/// Connector over a `MemoryEnsemble`.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    ensemble: MemoryEnsemble,
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, session_timeout: Duration) -> StoreResult<Arc<dyn CoordinationStore>> {
        let session: Arc<dyn CoordinationStore> = self.ensemble.session(session_timeout);
        Ok(session)
    }
}

/// One session on a `MemoryEnsemble`.
#[derive(Debug)]
pub struct MemorySession {
    id: SessionId,
    inner: Arc<Inner>,
    state_rx: watch::Receiver<SessionState>,
}

impl MemorySession {
    fn check(&self) -> StoreResult<()> {
        let mut slot = match self.inner.sessions.get_mut(&self.id) {
            Some(slot) => slot,
            None => {
                return match *self.state_rx.borrow() {
                    SessionState::Expired => Err(StoreError::SessionExpired),
                    _ => Err(StoreError::Closed),
                }
            }
        };
        let state = *slot.state.borrow();
        match state {
            SessionState::Connected => {
                if slot.fail_next > 0 {
                    slot.fail_next -= 1;
                    return Err(StoreError::ConnectionLoss);
                }
                Ok(())
            }
            SessionState::Connecting | SessionState::Disconnected => {
                Err(StoreError::ConnectionLoss)
            }
            SessionState::Expired => Err(StoreError::SessionExpired),
            SessionState::Closed => Err(StoreError::Closed),
        }
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    async fn ensure_path(&self, path: &str, data: Option<Vec<u8>>) -> StoreResult<()> {
        self.check()?;
        validate_path(path)?;
        let mut tree = self.inner.tree.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if tree.nodes.contains_key(&current) {
                continue;
            }
            let payload = if current == path {
                data.clone().unwrap_or_default()
            } else {
                Vec::new()
            };
            tree.create(current.clone(), payload, None)?;
        }
        Ok(())
    }

    async fn create_ephemeral_sequential(
        &self,
        parent: &str,
        prefix: &str,
        data: Vec<u8>,
    ) -> StoreResult<String> {
        self.check()?;
        validate_path(parent)?;
        let mut tree = self.inner.tree.lock();
        let seq = {
            let node = tree
                .nodes
                .get_mut(parent)
                .ok_or_else(|| StoreError::NoNode(parent.to_string()))?;
            let seq = node.next_seq;
            node.next_seq += 1;
            seq
        };
        let path = join(parent, &format!("{}{:010}", prefix, seq));
        tree.create(path.clone(), data, Some(self.id))?;
        Ok(path)
    }

    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> StoreResult<()> {
        self.check()?;
        validate_path(path)?;
        self.inner
            .tree
            .lock()
            .create(path.to_string(), data, Some(self.id))
    }

    async fn delete(&self, path: &str) -> StoreResult<bool> {
        self.check()?;
        validate_path(path)?;
        self.inner.tree.lock().remove(path)
    }

    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<ChildrenResult> {
        self.check()?;
        let mut tree = self.inner.tree.lock();
        let (children, stat) = {
            let node = tree
                .nodes
                .get(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            (node.children.iter().cloned().collect(), node.stat())
        };
        let watch = watch.then(|| Tree::arm(&mut tree.child_watches, self.id, path));
        Ok(ChildrenResult {
            children,
            stat,
            watch,
        })
    }

    async fn get_data(&self, path: &str, watch: bool) -> StoreResult<DataResult> {
        self.check()?;
        let mut tree = self.inner.tree.lock();
        let (data, stat) = {
            let node = tree
                .nodes
                .get(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            (node.data.clone(), node.stat())
        };
        let watch = watch.then(|| Tree::arm(&mut tree.data_watches, self.id, path));
        Ok(DataResult { data, stat, watch })
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<Version>,
    ) -> StoreResult<Stat> {
        self.check()?;
        let mut tree = self.inner.tree.lock();
        let stat = {
            let node = tree
                .nodes
                .get_mut(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            if let Some(expected) = expected_version {
                if node.version != expected {
                    return Err(StoreError::BadVersion {
                        path: path.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
            }
            node.data = data;
            node.version += 1;
            node.stat()
        };
        fire(&mut tree.data_watches, path, WatchEventKind::DataChanged);
        Ok(stat)
    }

    async fn exists(&self, path: &str, watch: bool) -> StoreResult<ExistsResult> {
        self.check()?;
        let mut tree = self.inner.tree.lock();
        let stat = tree.nodes.get(path).map(Node::stat);
        let watch = watch.then(|| Tree::arm(&mut tree.data_watches, self.id, path));
        Ok(ExistsResult { stat, watch })
    }

    async fn close(&self) -> StoreResult<()> {
        {
            let slot = match self.inner.sessions.get(&self.id) {
                Some(slot) => slot,
                None => return Ok(()),
            };
            if slot.state.borrow().is_terminal() {
                return Ok(());
            }
            slot.state.send_replace(SessionState::Closed);
        }
        {
            let mut tree = self.inner.tree.lock();
            tree.disarm_session(self.id, None);
            for path in tree.ephemerals_of(self.id) {
                let _ = tree.remove(&path);
            }
        }
        self.inner.sessions.remove(&self.id);
        debug!(session = %self.id, "Memory session closed");
        Ok(())
    }
}
