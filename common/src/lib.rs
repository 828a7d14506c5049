//! Rebalancer Common Types
//!
//! Shared types for the rebalancer protocol: identifiers, the persisted
//! assignment record, client lifecycle states and the error taxonomy.

pub mod identifiers;
pub mod assignment;
pub mod state;
pub mod error;

pub use identifiers::*;
pub use assignment::*;
pub use state::*;
pub use error::*;
