use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::plan::{RampUpCalculator, RampUpExecution, RampUpStrategy};
use crate::protocol::{AgentRegistration, ExecutionStatus};

/// Agents unseen for this long are removed by the janitor.
pub const STALE_AFTER: Duration = Duration::from_secs(60);
/// Janitor sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Display-only threshold: still registered, but flagged in the status API.
const DISPLAY_STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub id: String,
    pub region: String,
    pub concurrency: u32,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub execution_state: ExecutionStatus,
    pub ramp_up_execution: Option<RampUpExecution>,
}

impl AgentInfo {
    /// Connection label for the status API: `stale` once the agent has been
    /// quiet for a while, before the janitor removes it.
    pub fn connection_status(&self) -> &'static str {
        let quiet = (Utc::now() - self.last_seen)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if quiet > DISPLAY_STALE_AFTER {
            "stale"
        } else {
            "connected"
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AgentStatusInfo {
    pub id: String,
    pub region: String,
    pub concurrency: u32,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub status: &'static str,
    pub execution_state: &'static str,
}

/// Connected-agent map. Writers are the registration handler and the
/// janitor; everyone else takes short read locks on snapshots.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentInfo>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the agent. Returns `(is_new, total_connected)`.
    pub fn register(
        &self,
        registration: &AgentRegistration,
        ramp_up_execution: Option<RampUpExecution>,
    ) -> (bool, usize) {
        let now = Utc::now();
        let info = AgentInfo {
            id: registration.agent_id.clone(),
            region: registration.region.clone(),
            concurrency: registration.concurrency,
            connected_at: now,
            last_seen: now,
            execution_state: ExecutionStatus::Idle,
            ramp_up_execution,
        };

        let mut agents = self.write();
        let is_new = !agents.contains_key(&registration.agent_id);
        agents.insert(registration.agent_id.clone(), info);
        let total = agents.len();
        drop(agents);

        if is_new {
            info!(
                "Agent registered: {} (region: {}, concurrency: {})",
                registration.agent_id, registration.region, registration.concurrency
            );
            info!("Total connected agents: {}", total);
        } else {
            debug!("Agent re-registered: {}", registration.agent_id);
        }
        (is_new, total)
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        let mut agents = self.write();
        let removed = agents.remove(agent_id).is_some();
        let total = agents.len();
        drop(agents);
        if removed {
            info!("Agent unregistered: {}", agent_id);
            info!("Total connected agents: {}", total);
        }
        removed
    }

    /// Heartbeat and telemetry both land here.
    pub fn touch(&self, agent_id: &str) {
        if let Some(agent) = self.write().get_mut(agent_id) {
            agent.last_seen = Utc::now();
        }
    }

    pub fn set_execution_state(&self, agent_id: &str, state: ExecutionStatus) {
        if let Some(agent) = self.write().get_mut(agent_id) {
            agent.execution_state = state;
            agent.last_seen = Utc::now();
        }
    }

    /// Seeds a ramp-up execution for every agent missing one, sized to that
    /// agent's declared capacity. Used when a strategy-bearing run starts.
    pub fn seed_ramp_up(&self, strategy: &RampUpStrategy) {
        let mut agents = self.write();
        for agent in agents.values_mut() {
            if agent.ramp_up_execution.is_none() {
                match RampUpCalculator::new(strategy.clone(), agent.concurrency) {
                    Ok(calculator) => {
                        agent.ramp_up_execution = Some(RampUpExecution::start(calculator));
                    }
                    Err(err) => {
                        warn!("Skipping ramp-up seed for agent {}: {}", agent.id, err);
                    }
                }
            }
        }
    }

    pub fn clear_ramp_up(&self) {
        for agent in self.write().values_mut() {
            agent.ramp_up_execution = None;
        }
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn snapshot(&self) -> Vec<AgentInfo> {
        self.read().values().cloned().collect()
    }

    /// Sorted ids, the deterministic ordering sequential phases rely on.
    pub fn sorted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drops agents quiet for longer than `threshold`; returns their ids.
    pub fn remove_stale(&self, threshold: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut agents = self.write();
        let stale: Vec<String> = agents
            .iter()
            .filter(|(_, agent)| {
                (now - agent.last_seen)
                    .to_std()
                    .map(|quiet| quiet > threshold)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(agent) = agents.remove(id) {
                warn!(
                    "Removed stale agent: {} (last seen: {})",
                    id,
                    agent.last_seen.format("%H:%M:%S")
                );
            }
        }
        if !stale.is_empty() {
            info!("Total connected agents: {}", agents.len());
        }
        stale
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, AgentInfo>> {
        self.agents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AgentInfo>> {
        self.agents
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Periodic sweep for agents that stopped heartbeating. Removal does not
/// fail running runs; completion timers are authoritative.
pub fn spawn_janitor(registry: Arc<AgentRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            registry.remove_stale(STALE_AFTER);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{now_rfc3339, RegisterAction};

    fn registration(agent_id: &str) -> AgentRegistration {
        AgentRegistration {
            agent_id: agent_id.to_owned(),
            region: "eu-central".to_owned(),
            concurrency: 8,
            status: "ready".to_owned(),
            timestamp: now_rfc3339(),
            action: RegisterAction::Register,
        }
    }

    #[test]
    fn register_is_an_upsert() {
        let registry = AgentRegistry::new();
        let (is_new, total) = registry.register(&registration("a"), None);
        assert!(is_new);
        assert_eq!(total, 1);

        let (is_new, total) = registry.register(&registration("a"), None);
        assert!(!is_new);
        assert_eq!(total, 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn unregister_removes() {
        let registry = AgentRegistry::new();
        registry.register(&registration("a"), None);
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn stale_agents_are_swept() {
        let registry = AgentRegistry::new();
        registry.register(&registration("old"), None);
        registry.register(&registration("fresh"), None);
        {
            let mut agents = registry.write();
            agents.get_mut("old").unwrap().last_seen = Utc::now() - chrono::Duration::seconds(120);
        }

        let removed = registry.remove_stale(STALE_AFTER);
        assert_eq!(removed, vec!["old".to_owned()]);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn touch_refreshes_last_seen() {
        let registry = AgentRegistry::new();
        registry.register(&registration("a"), None);
        {
            let mut agents = registry.write();
            agents.get_mut("a").unwrap().last_seen = Utc::now() - chrono::Duration::seconds(120);
        }
        registry.touch("a");
        assert!(registry.remove_stale(STALE_AFTER).is_empty());
    }

    #[test]
    fn sorted_ids_are_deterministic() {
        let registry = AgentRegistry::new();
        for id in ["charlie", "alpha", "bravo"] {
            registry.register(&registration(id), None);
        }
        assert_eq!(registry.sorted_ids(), vec!["alpha", "bravo", "charlie"]);
    }

    #[test]
    fn seed_ramp_up_sizes_to_agent_capacity() {
        let registry = AgentRegistry::new();
        registry.register(&registration("a"), None);
        registry.seed_ramp_up(&RampUpStrategy::immediate());
        let snapshot = registry.snapshot();
        let execution = snapshot[0].ramp_up_execution.as_ref().unwrap();
        assert_eq!(execution.max_concurrency(), 8);
    }
}
