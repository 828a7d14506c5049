//! Rebalancer Store
//!
//! The coordination store surface the rebalancer runs against, an in-memory
//! implementation of it, the group path layout and the resilient executor
//! that wraps every store call with connectivity gating and retry.

pub mod store;
pub mod error;
pub mod memory;
pub mod executor;
pub mod paths;
pub mod admin;

pub use store::{
    ChildrenResult, CoordinationStore, DataResult, ExistsResult, SessionState, Stat,
    StoreConnector, Version, Watch, WatchEvent, WatchEventKind,
};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryConnector, MemoryEnsemble, MemorySession};
pub use executor::ResilientExecutor;
pub use paths::GroupPaths;
pub use admin::GroupAdmin;
