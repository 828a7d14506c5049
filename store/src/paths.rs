//! Persisted layout of a resource group.

use rebalancer_common::{ClientId, GroupId, ResourceId};

/// Name of the lock node under a resource.
pub const BARRIER_NODE: &str = "barrier";

/// Node paths of one group under a root.
///
/// ```text
/// <root>/<group>/clients/c_<seq>
/// <root>/<group>/resources/<resource>[/barrier]
/// <root>/<group>/epoch
/// <root>/<group>/assignment
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPaths {
    pub group: String,
    pub clients: String,
    pub resources: String,
    pub epoch: String,
    pub assignment: String,
}

impl GroupPaths {
    pub fn new(root: &str, group: &GroupId) -> Self {
        let root = root.trim_end_matches('/');
        let group_path = format!("{}/{}", root, group.as_str());
        Self {
            clients: format!("{}/clients", group_path),
            resources: format!("{}/resources", group_path),
            epoch: format!("{}/epoch", group_path),
            assignment: format!("{}/assignment", group_path),
            group: group_path,
        }
    }

    /// Persistent nodes that must exist before any client registers.
    pub fn roots(&self) -> [&str; 4] {
        [&self.clients, &self.resources, &self.epoch, &self.assignment]
    }

    pub fn client(&self, id: &ClientId) -> String {
        format!("{}/{}", self.clients, id.as_str())
    }

    pub fn resource(&self, resource: &ResourceId) -> String {
        format!("{}/{}", self.resources, resource.as_str())
    }

    pub fn barrier(&self, resource: &ResourceId) -> String {
        format!("{}/{}/{}", self.resources, resource.as_str(), BARRIER_NODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = GroupPaths::new("/rebalancer/", &GroupId::new("orders"));
        assert_eq!(paths.clients, "/rebalancer/orders/clients");
        assert_eq!(paths.assignment, "/rebalancer/orders/assignment");
        assert_eq!(
            paths.barrier(&ResourceId::new("res0")),
            "/rebalancer/orders/resources/res0/barrier"
        );
        assert_eq!(
            paths.client(&ClientId::new("c_0000000001")),
            "/rebalancer/orders/clients/c_0000000001"
        );
    }
}
