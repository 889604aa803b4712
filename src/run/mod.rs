use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::TestPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunStatus {
    Created,
    WaitingForAgents,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl TestRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// A run that currently owns the fleet: waiting for quorum, generating
    /// load, or winding down. At most one run may be active at a time.
    pub fn is_active(self) -> bool {
        matches!(self, Self::WaitingForAgents | Self::Running | Self::Completing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::WaitingForAgents => "waiting_for_agents",
            Self::Running => "running",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "waiting_for_agents" => Some(Self::WaitingForAgents),
            "running" => Some(Self::Running),
            "completing" => Some(Self::Completing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Latest per-agent rollup for one run, fed by telemetry snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    #[serde(default)]
    pub region: String,
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    #[serde(default)]
    pub status_codes: BTreeMap<u16, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunResults {
    pub total_requests: u64,
    pub total_errors: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub requests_per_sec: f64,
    pub status_codes: BTreeMap<u16, u64>,
    pub agent_results: Vec<AgentResult>,
}

impl TestRunResults {
    /// Rolls per-agent results up into run totals.
    ///
    /// The global minimum skips agents that never recorded a latency (their
    /// min is zero); the average is weighted by request count; throughput is
    /// totals over the completion duration.
    pub fn aggregate(agent_results: Vec<AgentResult>, completion: Option<Duration>) -> Self {
        let mut total_requests: u64 = 0;
        let mut total_errors: u64 = 0;
        let mut latency_weighted_sum = 0.0;
        let mut min_latency_ms = 0.0f64;
        let mut max_latency_ms = 0.0f64;
        let mut status_codes: BTreeMap<u16, u64> = BTreeMap::new();

        for result in &agent_results {
            total_requests += result.requests;
            total_errors += result.errors;
            latency_weighted_sum += result.avg_latency_ms * result.requests as f64;

            if result.min_latency_ms > 0.0
                && (min_latency_ms == 0.0 || result.min_latency_ms < min_latency_ms)
            {
                min_latency_ms = result.min_latency_ms;
            }
            if result.max_latency_ms > max_latency_ms {
                max_latency_ms = result.max_latency_ms;
            }
            for (code, count) in &result.status_codes {
                *status_codes.entry(*code).or_default() += count;
            }
        }

        let avg_latency_ms = if total_requests > 0 {
            latency_weighted_sum / total_requests as f64
        } else {
            0.0
        };

        let success_rate = if total_requests > 0 {
            (total_requests - total_errors.min(total_requests)) as f64 / total_requests as f64
                * 100.0
        } else {
            100.0
        };

        let requests_per_sec = completion
            .map(|elapsed| elapsed.as_secs_f64())
            .filter(|secs| *secs > 0.0)
            .map_or(0.0, |secs| total_requests as f64 / secs);

        Self {
            total_requests,
            total_errors,
            success_rate,
            avg_latency_ms,
            min_latency_ms,
            max_latency_ms,
            requests_per_sec,
            status_codes,
            agent_results,
        }
    }
}

/// A stateful instance of executing a test plan. Mutated only by the run
/// manager; everything else reads snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub name: String,
    pub test_plan: TestPlan,
    pub status: TestRunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<TestRunResults>,
    #[serde(rename = "agent_count")]
    pub min_agents: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl TestRun {
    pub fn new(
        name: impl Into<String>,
        test_plan: TestPlan,
        min_agents: u32,
        parameters: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            test_plan,
            status: TestRunStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration: None,
            results: None,
            min_agents,
            parameters,
        }
    }

    /// Leaves `created`: stamps `started_at` and parks the run in the
    /// waiting state until quorum promotes it.
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = TestRunStatus::WaitingForAgents;
    }

    pub fn mark_running(&mut self) {
        self.status = TestRunStatus::Running;
    }

    pub fn mark_completing(&mut self) {
        self.status = TestRunStatus::Completing;
    }

    pub fn complete(&mut self, results: TestRunResults) {
        self.finish(TestRunStatus::Completed);
        self.results = Some(results);
    }

    pub fn fail(&mut self) {
        self.finish(TestRunStatus::Failed);
    }

    pub fn cancel(&mut self) {
        self.finish(TestRunStatus::Cancelled);
    }

    /// Wall-clock span between start and completion, when both are known.
    pub fn completion_duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        (completed - started).to_std().ok()
    }

    fn finish(&mut self, status: TestRunStatus) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.status = status;
        if let Some(started) = self.started_at {
            if let Ok(elapsed) = (now - started).to_std() {
                self.duration = Some(humantime::format_duration(elapsed).to_string());
            }
        }
    }
}
