//! Resilient operation executor.
//!
//! Wraps every store call: waits for connectivity, runs the call, retries on
//! connection loss and classifies everything else into `RebalancerError`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use rebalancer_common::{RebalancerError, Result};

use crate::error::{StoreError, StoreResult};
use crate::store::{CoordinationStore, SessionState};

/// Runs store operations with connectivity gating and retry.
#[derive(Clone)]
pub struct ResilientExecutor {
    store: Arc<dyn CoordinationStore>,
    retry_interval: Duration,
    retries: Arc<AtomicU64>,
}

impl ResilientExecutor {
    /// Create an executor over one store session.
    pub fn new(store: Arc<dyn CoordinationStore>, retry_interval: Duration) -> Self {
        Self {
            store,
            retry_interval,
            retries: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Report retries into a shared counter.
    pub fn with_retry_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.retries = counter;
        self
    }

    /// The wrapped session.
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Number of connection-loss retries so far.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Wait until the session is connected.
    ///
    /// Fails with `SessionExpired` if the session expires while waiting and
    /// with `Cancelled` if the session is closed or `cancel` fires.
    pub async fn block_until_connected(&self, cancel: &CancellationToken) -> Result<()> {
        let mut state_rx = self.store.session_state();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                SessionState::Connected => return Ok(()),
                SessionState::Expired => {
                    return Err(RebalancerError::SessionExpired(
                        "expired while waiting for connection".to_string(),
                    ))
                }
                SessionState::Closed => {
                    return Err(RebalancerError::Cancelled("session closed".to_string()))
                }
                SessionState::Connecting | SessionState::Disconnected => {
                    trace!(state = ?state, "Waiting for connection");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RebalancerError::Cancelled(
                        "cancelled while waiting for connection".to_string(),
                    ));
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(RebalancerError::Cancelled("session dropped".to_string()));
                    }
                }
            }
        }
    }

    /// Run a store operation until it produces a non-retryable outcome.
    ///
    /// `op` is invoked once per attempt. Connection loss pauses for the retry
    /// interval and tries again; a version conflict surfaces as
    /// `StaleVersion` and is never retried.
    pub async fn run<T, F, Fut>(&self, action: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(RebalancerError::Cancelled(action.to_string()));
            }
            self.block_until_connected(cancel).await?;

            match op().await {
                Ok(value) => return Ok(value),
                Err(StoreError::ConnectionLoss) => {
                    let attempt = self.retries.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(action = action, attempt = attempt, "Connection lost, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(RebalancerError::Cancelled(action.to_string()));
                        }
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
                Err(err) => {
                    debug!(action = action, error = %err, "Store call failed");
                    return Err(err.into());
                }
            }
        }
    }
}
