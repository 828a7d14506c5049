//! Identifier types for group members, resources and store sessions.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Name prefix of every client registration node.
pub const CLIENT_NODE_PREFIX: &str = "c_";

/// Identity of a registered group member.
///
/// This is the name of the member's ephemeral sequential registration node,
/// e.g. `c_0000000007`. The numeric suffix is the join sequence and is the
/// only ordering used for leadership and partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client ID from a registration node name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a client ID from the full path of its registration node.
    pub fn from_path(path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path);
        Self(name.to_string())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Join sequence parsed from the node name suffix.
    pub fn sequence(&self) -> Option<u64> {
        self.0
            .rsplit('_')
            .next()
            .and_then(|suffix| suffix.parse::<u64>().ok())
    }

    /// Sort client IDs by ascending join sequence.
    ///
    /// IDs without a parsable sequence sort last, by name.
    pub fn sort_by_sequence(ids: &mut [ClientId]) {
        ids.sort_by(|a, b| match (a.sequence(), b.sequence()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.0.cmp(&b.0),
        });
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a shared resource (a child of the resources root).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a new resource ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Name of a resource group shared by cooperating clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(String);

impl GroupId {
    /// Create a new group ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A group name must be a single non-empty path segment.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= 255 && !self.0.contains('/')
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a store session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_sequence() {
        assert_eq!(ClientId::new("c_0000000042").sequence(), Some(42));
        assert_eq!(ClientId::from_path("/r/g/clients/c_0000000003").as_str(), "c_0000000003");
        assert_eq!(ClientId::new("nosequence").sequence(), None);
    }

    #[test]
    fn test_sort_by_sequence() {
        let mut ids = vec![
            ClientId::new("c_0000000010"),
            ClientId::new("c_0000000002"),
            ClientId::new("odd"),
            ClientId::new("c_0000000007"),
        ];
        ClientId::sort_by_sequence(&mut ids);
        let names: Vec<&str> = ids.iter().map(|c| c.as_str()).collect();
        assert_eq!(names, vec!["c_0000000002", "c_0000000007", "c_0000000010", "odd"]);
    }

    #[test]
    fn test_group_id_validation() {
        assert!(GroupId::new("orders").is_valid());
        assert!(!GroupId::new("").is_valid());
        assert!(!GroupId::new("a/b").is_valid());
    }
}
