//! Simulation scenarios.

use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Wait for a number of rebalance intervals.
    Settle { intervals: u32 },
    /// Start a new member.
    Join,
    /// Stop a running member.
    Leave { member: usize },
    /// Inject a fault.
    InjectFault { fault_type: FaultType, member: usize },
    /// Add a resource to the group.
    AddResource { name: String },
    /// Remove a resource from the group.
    RemoveResource { name: String },
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Types of faults that can be injected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum FaultType {
    /// The member's session expires.
    SessionExpiry,
    /// The member loses its connection for a while, then reconnects.
    Disconnect { millis: u64 },
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// No resource has two holders and every resource has one.
    Balanced,
    /// The given member runs the coordinator.
    Leader { member: usize },
    /// The given member owns exactly this many resources.
    Owns { member: usize, count: usize },
}

impl Scenario {
    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "join-leave" => Ok(Self::join_leave()),
            "leader-failover" => Ok(Self::leader_failover()),
            "session-expiry" => Ok(Self::session_expiry()),
            "resource-churn" => Ok(Self::resource_churn()),
            _ => Err(anyhow::anyhow!(
                "Unknown scenario: {} (expected one of: {})",
                name,
                Self::names().join(", ")
            )),
        }
    }

    /// Names accepted by `load`.
    pub fn names() -> &'static [&'static str] {
        &["join-leave", "leader-failover", "session-expiry", "resource-churn"]
    }

    fn settle() -> ScenarioStep {
        ScenarioStep::Settle { intervals: 3 }
    }

    fn balanced() -> ScenarioStep {
        ScenarioStep::Assert {
            condition: AssertCondition::Balanced,
        }
    }

    /// Members join one by one, then the first two leave.
    fn join_leave() -> Self {
        Self {
            name: "join-leave".to_string(),
            description: "Members join one by one and leave again".to_string(),
            steps: vec![
                Self::settle(),
                Self::balanced(),
                ScenarioStep::Join,
                Self::settle(),
                Self::balanced(),
                ScenarioStep::Join,
                Self::settle(),
                Self::balanced(),
                ScenarioStep::Leave { member: 0 },
                Self::settle(),
                Self::balanced(),
                ScenarioStep::Leave { member: 1 },
                Self::settle(),
                Self::balanced(),
            ],
        }
    }

    /// The coordinator leaves and the next member takes over.
    fn leader_failover() -> Self {
        Self {
            name: "leader-failover".to_string(),
            description: "Coordinator leaves, its successor takes over".to_string(),
            steps: vec![
                Self::settle(),
                ScenarioStep::Assert {
                    condition: AssertCondition::Leader { member: 0 },
                },
                ScenarioStep::Leave { member: 0 },
                Self::settle(),
                ScenarioStep::Assert {
                    condition: AssertCondition::Leader { member: 1 },
                },
                Self::balanced(),
            ],
        }
    }

    /// The coordinator's session expires; it recovers as a follower.
    fn session_expiry() -> Self {
        Self {
            name: "session-expiry".to_string(),
            description: "Coordinator session expires and recovers".to_string(),
            steps: vec![
                Self::settle(),
                Self::balanced(),
                ScenarioStep::InjectFault {
                    fault_type: FaultType::SessionExpiry,
                    member: 0,
                },
                Self::settle(),
                ScenarioStep::Assert {
                    condition: AssertCondition::Leader { member: 1 },
                },
                Self::balanced(),
                ScenarioStep::InjectFault {
                    fault_type: FaultType::Disconnect { millis: 200 },
                    member: 1,
                },
                Self::settle(),
                Self::balanced(),
            ],
        }
    }

    /// Resources come and go while membership is stable.
    fn resource_churn() -> Self {
        Self {
            name: "resource-churn".to_string(),
            description: "Resources are added and removed".to_string(),
            steps: vec![
                Self::settle(),
                Self::balanced(),
                ScenarioStep::AddResource {
                    name: "extra0".to_string(),
                },
                Self::settle(),
                Self::balanced(),
                ScenarioStep::AddResource {
                    name: "extra1".to_string(),
                },
                Self::settle(),
                Self::balanced(),
                ScenarioStep::RemoveResource {
                    name: "res0".to_string(),
                },
                Self::settle(),
                Self::balanced(),
            ],
        }
    }
}
