//! The persisted assignment record.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClientId, ResourceId, Result};

/// Phase of the assignment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentPhase {
    /// The assignments are in force.
    #[default]
    Assigned,
    /// A handoff is in progress: every holder must release its resources.
    Revoking,
}

/// Resources owned by a single client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAssignment {
    /// The owning client.
    pub client_id: ClientId,
    /// Owned resources, in resource sort order.
    pub resources: Vec<ResourceId>,
}

impl ClientAssignment {
    /// Create a new client assignment.
    pub fn new(client_id: ClientId, resources: Vec<ResourceId>) -> Self {
        Self {
            client_id,
            resources,
        }
    }
}

/// Group-wide mapping with empty entries dropped, used for equality checks.
pub type NormalizedMapping = BTreeMap<ClientId, Vec<ResourceId>>;

/// Versioned mapping of client to owned resources.
///
/// Written only by the coordinator via compare-and-set on the store version
/// of the node holding it. Each resource appears in at most one list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssignmentRecord {
    /// Epoch under which the record was written.
    pub epoch: u64,
    /// Current phase.
    pub phase: AssignmentPhase,
    /// Per-client assignments in join order.
    pub assignments: Vec<ClientAssignment>,
    /// When the record was written.
    pub updated_at: Option<DateTime<Utc>>,
}

impl AssignmentRecord {
    /// A record that asks every holder to release.
    pub fn revoking(epoch: u64) -> Self {
        Self {
            epoch,
            phase: AssignmentPhase::Revoking,
            assignments: Vec::new(),
            updated_at: Some(Utc::now()),
        }
    }

    /// A record putting the given assignments in force.
    pub fn assigned(epoch: u64, assignments: Vec<ClientAssignment>) -> Self {
        Self {
            epoch,
            phase: AssignmentPhase::Assigned,
            assignments,
            updated_at: Some(Utc::now()),
        }
    }

    /// Check if the record is in the revoke phase.
    pub fn is_revoking(&self) -> bool {
        self.phase == AssignmentPhase::Revoking
    }

    /// Resources assigned to a client; empty if it has no entry.
    pub fn resources_for(&self, client_id: &ClientId) -> Vec<ResourceId> {
        self.assignments
            .iter()
            .find(|a| &a.client_id == client_id)
            .map(|a| a.resources.clone())
            .unwrap_or_default()
    }

    /// Owner of every assigned resource.
    pub fn owners(&self) -> HashMap<ResourceId, ClientId> {
        self.assignments
            .iter()
            .flat_map(|a| a.resources.iter().map(move |r| (r.clone(), a.client_id.clone())))
            .collect()
    }

    /// Mapping with empty entries removed.
    pub fn normalized(&self) -> NormalizedMapping {
        normalize(&self.assignments)
    }

    /// Check if the record is in force with exactly the given mapping.
    ///
    /// Clients with no resources are ignored on both sides.
    pub fn is_assigned_with(&self, assignments: &[ClientAssignment]) -> bool {
        self.phase == AssignmentPhase::Assigned && self.normalized() == normalize(assignments)
    }

    /// Check that no resource appears in more than one list.
    pub fn is_exclusive(&self) -> bool {
        let total: usize = self.assignments.iter().map(|a| a.resources.len()).sum();
        self.owners().len() == total
    }

    /// Encode for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from storage; an empty payload is the default record.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(data)?)
    }
}

/// Drop empty entries and index by client.
pub fn normalize(assignments: &[ClientAssignment]) -> NormalizedMapping {
    assignments
        .iter()
        .filter(|a| !a.resources.is_empty())
        .map(|a| (a.client_id.clone(), a.resources.clone()))
        .collect()
}
