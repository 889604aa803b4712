//! Subjects and payload shapes spoken between coordinator and agents.
//! Every payload is UTF-8 JSON; timestamps are RFC3339 in UTC.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::plan::{PhaseMode, TestPlan};

pub mod subjects {
    pub const AGENT_REGISTER: &str = "armonite.agent.register";
    pub const AGENT_HEARTBEAT: &str = "armonite.agent.heartbeat";
    pub const AGENT_STATUS: &str = "armonite.agent.status";
    pub const TELEMETRY: &str = "armonite.telemetry";
    pub const TEST_COMMAND: &str = "armonite.test.command";
    pub const PING: &str = "armonite.ping";

    /// Per-agent command subject used for phase coordination.
    pub fn agent_command(agent_id: &str) -> String {
        format!("armonite.agent.{}.command", agent_id)
    }

    /// Per-run phase-completion subject.
    pub fn phase_complete(run_id: &str) -> String {
        format!("armonite.phase.complete.{}", run_id)
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterAction {
    Register,
    Unregister,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    #[serde(default)]
    pub region: String,
    pub concurrency: u32,
    pub status: String,
    pub timestamp: String,
    pub action: RegisterAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_id: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Completed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusUpdate {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_id: Option<String>,
    pub status: ExecutionStatus,
    pub message: String,
    pub timestamp: String,
}

/// Periodic metrics snapshot for the run so far on one agent. Counters are
/// monotonically non-decreasing within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub timestamp: String,
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    #[serde(default)]
    pub status_codes: BTreeMap<u16, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Start,
    Stop,
    StartPhase,
    StopPhase,
}

/// One segment of an orchestrated custom ramp-up, as sent to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseInfo {
    pub phase_index: usize,
    pub phase_id: String,
    pub mode: PhaseMode,
    pub concurrency: u32,
    pub duration: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_order: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_plan: Option<TestPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    pub command: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PhaseInfo>,
}

impl TestCommand {
    pub fn start(test_run_id: String, test_plan: TestPlan) -> Self {
        Self {
            test_run_id: Some(test_run_id),
            test_plan: Some(test_plan),
            start_time: Some(now_rfc3339()),
            command: CommandKind::Start,
            current_phase: None,
        }
    }

    pub fn stop(test_run_id: String) -> Self {
        Self {
            test_run_id: Some(test_run_id),
            test_plan: None,
            start_time: None,
            command: CommandKind::Stop,
            current_phase: None,
        }
    }

    pub fn start_phase(test_run_id: String, phase: PhaseInfo) -> Self {
        Self {
            test_run_id: Some(test_run_id),
            test_plan: None,
            start_time: None,
            command: CommandKind::StartPhase,
            current_phase: Some(phase),
        }
    }

    pub fn stop_phase(test_run_id: String) -> Self {
        Self {
            test_run_id: Some(test_run_id),
            test_plan: None,
            start_time: None,
            command: CommandKind::StopPhase,
            current_phase: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCompletion {
    pub agent_id: String,
    pub phase_id: String,
    pub phase_index: usize,
    pub completed_at: String,
}
