//! Client lifecycle states and engine exit reasons.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle position of a client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientInternalState {
    /// No store session.
    NoSession,
    /// Session established, not yet registered.
    NoClientNode,
    /// Registered, role not yet decided.
    NoRole,
    /// Running the coordinator engine.
    IsLeader,
    /// Running the follower engine.
    IsFollower,
    /// A fatal failure ended the current session.
    Error,
    /// Stopped for good.
    Terminated,
}

impl ClientInternalState {
    /// Check if this is the absorbing state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientInternalState::Terminated)
    }

    /// Check if an engine loop runs in this state.
    pub fn has_role(&self) -> bool {
        matches!(
            self,
            ClientInternalState::IsLeader | ClientInternalState::IsFollower
        )
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[ClientInternalState] {
        use ClientInternalState::*;
        match self {
            NoSession => &[NoClientNode, Error, Terminated],
            NoClientNode => &[NoRole, Error, Terminated],
            NoRole => &[NoRole, IsLeader, IsFollower, Error, Terminated],
            IsLeader => &[NoRole, Error, Terminated],
            IsFollower => &[NoRole, Error, Terminated],
            Error => &[NoSession, Terminated],
            Terminated => &[],
        }
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: ClientInternalState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for ClientInternalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why the coordinator engine loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordinatorExitReason {
    /// Lost the fencing race or sequence priority.
    NoLongerCoordinator,
    /// The session signal fired.
    Cancelled,
    /// The store session expired.
    SessionExpired,
    /// A multi-step write partially succeeded.
    PotentialInconsistentState,
    /// Unclassified failure.
    FatalError,
}

/// Why the follower engine loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FollowerExitReason {
    /// The watched predecessor is gone; the role must be re-evaluated.
    PossibleRoleChange,
    /// The session signal fired.
    Cancelled,
    /// The store session expired.
    SessionExpired,
    /// Local ownership could not be reconciled with the record.
    PotentialInconsistentState,
    /// Unclassified failure.
    FatalError,
}

/// Reason carried by the aborted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbortReason {
    /// The store session expired.
    SessionExpired,
    /// A partial write left the group state uncertain.
    PotentialInconsistentState,
    /// Unclassified failure.
    FatalError,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl CoordinatorExitReason {
    /// Abort reason for exits that end the session; `None` otherwise.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            CoordinatorExitReason::SessionExpired => Some(AbortReason::SessionExpired),
            CoordinatorExitReason::PotentialInconsistentState => {
                Some(AbortReason::PotentialInconsistentState)
            }
            CoordinatorExitReason::FatalError => Some(AbortReason::FatalError),
            CoordinatorExitReason::NoLongerCoordinator | CoordinatorExitReason::Cancelled => None,
        }
    }
}

impl FollowerExitReason {
    /// Abort reason for exits that end the session; `None` otherwise.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            FollowerExitReason::SessionExpired => Some(AbortReason::SessionExpired),
            FollowerExitReason::PotentialInconsistentState => {
                Some(AbortReason::PotentialInconsistentState)
            }
            FollowerExitReason::FatalError => Some(AbortReason::FatalError),
            FollowerExitReason::PossibleRoleChange | FollowerExitReason::Cancelled => None,
        }
    }
}
