//! Simulation controller.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use rebalancer_client::{ClientConfig, ClientInternalState, GroupId, ResourceId};
use rebalancer_store::{GroupAdmin, MemoryEnsemble};

use crate::member::{MemberFactory, SimulatedMember};
use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, FaultType, Scenario, ScenarioStep};

/// Controls the simulation.
pub struct SimulationController {
    /// Members started at initialization.
    member_count: usize,
    /// Resources created at initialization.
    resource_count: usize,
    /// Configuration every member runs with.
    config: ClientConfig,
    group: GroupId,
    ensemble: MemoryEnsemble,
    admin: GroupAdmin,
    /// Random number generator.
    rng: RwLock<StdRng>,
    /// Live members by creation index.
    members: RwLock<BTreeMap<usize, SimulatedMember>>,
    next_index: RwLock<usize>,
    /// Simulation metrics.
    metrics: RwLock<SimulationMetrics>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(
        member_count: usize,
        resource_count: usize,
        config: ClientConfig,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let ensemble = MemoryEnsemble::new();
        let group = GroupId::new("simulation");
        let admin = GroupAdmin::new(
            ensemble.session(config.session_timeout),
            &config.root_path,
            group.clone(),
            config.retry_interval,
        );

        Self {
            member_count,
            resource_count,
            config,
            group,
            ensemble,
            admin,
            rng: RwLock::new(rng),
            members: RwLock::new(BTreeMap::new()),
            next_index: RwLock::new(0),
            metrics: RwLock::new(SimulationMetrics::new()),
        }
    }

    /// Create the group and start the initial members.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        info!(
            members = self.member_count,
            resources = self.resource_count,
            "Initializing simulation"
        );

        self.admin
            .prepare(&MemberFactory::resources(self.resource_count))
            .await
            .context("preparing group")?;

        for _ in 0..self.member_count {
            self.join().await?;
        }
        Ok(())
    }

    /// Run a scenario.
    pub async fn run_scenario(&self, scenario: Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        for step in &scenario.steps {
            self.execute_step(step).await?;
            self.metrics.write().await.steps += 1;
        }
        Ok(())
    }

    /// Apply random membership, fault and resource changes until `duration`
    /// elapses or Ctrl+C.
    pub async fn run(&self, duration: Option<Duration>) -> anyhow::Result<()> {
        info!("Running random churn");
        let start = Instant::now();

        loop {
            if duration.map(|d| start.elapsed() >= d).unwrap_or(false) {
                break;
            }

            let step = self.random_step().await;
            info!(step = ?step, "Churn step");
            if let Err(err) = self.execute_step(&step).await {
                warn!(error = %err, "Churn step failed");
            }
            self.metrics.write().await.steps += 1;

            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = tokio::time::sleep(self.interval()) => {}
            }
            self.settle(3).await;
            self.check().await?;
        }
        Ok(())
    }

    async fn random_step(&self) -> ScenarioStep {
        let live: Vec<usize> = self.members.read().await.keys().copied().collect();
        let resources = self.admin.resources().await.unwrap_or_default();
        let mut rng = self.rng.write().await;

        let roll = rng.gen_range(0..100);
        let member = if live.is_empty() {
            None
        } else {
            Some(live[rng.gen_range(0..live.len())])
        };

        match (roll, member) {
            (_, None) => ScenarioStep::Join,
            (0..=29, _) if live.len() < self.member_count * 2 => ScenarioStep::Join,
            (0..=54, Some(member)) if live.len() > 1 => ScenarioStep::Leave { member },
            (55..=64, Some(member)) => ScenarioStep::InjectFault {
                fault_type: FaultType::SessionExpiry,
                member,
            },
            (65..=74, Some(member)) => ScenarioStep::InjectFault {
                fault_type: FaultType::Disconnect {
                    millis: rng.gen_range(50..500),
                },
                member,
            },
            (75..=87, _) => ScenarioStep::AddResource {
                name: format!("dyn{}", rng.gen_range(0..1000)),
            },
            (88..=99, _) if resources.len() > 1 => ScenarioStep::RemoveResource {
                name: resources[rng.gen_range(0..resources.len())].to_string(),
            },
            _ => ScenarioStep::Settle { intervals: 1 },
        }
    }

    /// Execute a single scenario step.
    async fn execute_step(&self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Settle { intervals } => {
                self.settle(*intervals).await;
            }
            ScenarioStep::Join => {
                self.join().await?;
            }
            ScenarioStep::Leave { member } => {
                let removed = self.members.write().await.remove(member);
                let Some(removed) = removed else {
                    bail!("member {} is not running", member);
                };
                removed.stop(self.config.stop_timeout).await?;
                let mut metrics = self.metrics.write().await;
                metrics.leaves += 1;
                metrics.absorb(&removed.client().metrics());
                metrics.absorb_events(removed.events());
            }
            ScenarioStep::InjectFault { fault_type, member } => {
                let session = {
                    let members = self.members.read().await;
                    members.get(member).and_then(|m| m.session_id())
                };
                let Some(session) = session else {
                    bail!("member {} has no session", member);
                };
                info!(member = member, fault = ?fault_type, "Injecting fault");
                match *fault_type {
                    FaultType::SessionExpiry => self.ensemble.expire(session),
                    FaultType::Disconnect { millis } => {
                        self.ensemble.disconnect(session);
                        let ensemble = self.ensemble.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(millis)).await;
                            ensemble.reconnect(session);
                        });
                    }
                }
                self.metrics.write().await.faults += 1;
            }
            ScenarioStep::AddResource { name } => {
                self.admin.add_resource(&ResourceId::new(name.as_str())).await?;
                self.metrics.write().await.resource_changes += 1;
            }
            ScenarioStep::RemoveResource { name } => {
                self.admin
                    .remove_resource(&ResourceId::new(name.as_str()))
                    .await?;
                self.metrics.write().await.resource_changes += 1;
            }
            ScenarioStep::Assert { condition } => {
                self.assert(condition).await?;
            }
        }

        Ok(())
    }

    async fn join(&self) -> anyhow::Result<()> {
        let index = {
            let mut next = self.next_index.write().await;
            let index = *next;
            *next += 1;
            index
        };
        let member = SimulatedMember::new(
            MemberFactory::name(index),
            &self.ensemble,
            self.config.clone(),
        )?;
        member.start(&self.group).await?;
        self.members.write().await.insert(index, member);
        self.metrics.write().await.joins += 1;
        Ok(())
    }

    async fn assert(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::Balanced => {
                let (exclusive, covered) = self.check().await?;
                if !exclusive || !covered {
                    bail!("ownership not balanced (exclusive={}, covered={})", exclusive, covered);
                }
            }
            AssertCondition::Leader { member } => {
                let members = self.members.read().await;
                let state = members.get(member).map(|m| m.state());
                if state != Some(ClientInternalState::IsLeader) {
                    bail!("member {} is {:?}, expected leader", member, state);
                }
            }
            AssertCondition::Owns { member, count } => {
                let members = self.members.read().await;
                let owned = members.get(member).map(|m| m.assigned().len());
                if owned != Some(*count) {
                    bail!("member {} owns {:?}, expected {}", member, owned, count);
                }
            }
        }
        info!(condition = ?condition, "Assertion held");
        Ok(())
    }

    /// Check that no resource has two holders and that every resource has
    /// one. Returns `(exclusive, covered)`.
    pub async fn check(&self) -> anyhow::Result<(bool, bool)> {
        let resources: HashSet<ResourceId> = self.admin.resources().await?.into_iter().collect();

        let mut seen = HashSet::new();
        let mut exclusive = true;
        for (index, member) in self.members.read().await.iter() {
            for resource in member.assigned() {
                if !seen.insert(resource.clone()) {
                    error!(member = index, resource = %resource, "Resource owned twice");
                    exclusive = false;
                }
            }
        }
        let covered = resources.iter().all(|r| seen.contains(r));
        if !covered {
            warn!(
                owned = seen.len(),
                resources = resources.len(),
                "Some resources are unowned"
            );
        }

        self.metrics.write().await.record_check(exclusive, covered);
        if !exclusive {
            bail!("exclusivity violated");
        }
        Ok((exclusive, covered))
    }

    async fn settle(&self, intervals: u32) {
        tokio::time::sleep(self.interval() * intervals).await;
    }

    fn interval(&self) -> Duration {
        self.config.min_rebalance_interval + Duration::from_millis(100)
    }

    /// Stop every member and fold their metrics and callback counts in.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let members = std::mem::take(&mut *self.members.write().await);
        let timeout = self.config.stop_timeout;
        let results = futures::future::join_all(members.values().map(|m| m.stop(timeout))).await;

        let mut metrics = self.metrics.write().await;
        for member in members.values() {
            metrics.absorb(&member.client().metrics());
            metrics.absorb_events(member.events());
        }
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Get simulation metrics.
    pub async fn get_metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }
}
