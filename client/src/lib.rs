//! Rebalancer Client
//!
//! Distributes a group's resources across its live members through a
//! coordination store. One member coordinates: it computes the mapping,
//! writes the assignment record and hands resources over through per-resource
//! barriers. Every member applies the record to itself and reports ownership
//! changes through a `RebalanceHandler`.

pub mod config;
pub mod handler;
pub mod metrics;
pub mod assigner;
pub mod context;
pub mod barrier;
pub mod ownership;
pub mod coordinator;
pub mod follower;
pub mod client;

pub use config::{ClientConfig, ClientOptions};
pub use handler::{CallbackHandler, ChannelHandler, ClientEvent, LoggingHandler, RebalanceHandler};
pub use metrics::{MetricsSnapshot, RebalanceMetrics};
pub use assigner::assign;
pub use client::{RebalancerClient, RebalancerClientBuilder};

pub use rebalancer_common::{
    AbortReason, AssignmentRecord, ClientAssignment, ClientId, ClientInternalState, GroupId,
    RebalancerError, ResourceId, Result,
};
