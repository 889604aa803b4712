use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::bus::BusClient;
use crate::error::PlanError;
use crate::persist::Store;
use crate::plan::{parse_duration, TestPlan};
use crate::protocol::{subjects, TestCommand};
use crate::run::{TestRun, TestRunResults, TestRunStatus};

use super::orchestrator::PhaseOrchestrator;
use super::registry::AgentRegistry;
use super::telemetry::TelemetryAggregator;

/// Plans with unparseable durations still complete, after this long.
const FALLBACK_RUN_DURATION: Duration = Duration::from_secs(60);
/// Grace before finalising a run stopped while still waiting for quorum,
/// which never armed a completion timer.
const STOPPED_WAITING_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct CreateTestRunRequest {
    #[serde(default)]
    pub name: String,
    pub test_plan: TestPlan,
    #[serde(default)]
    pub min_agents: u32,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteRequest {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub older_than: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Serialize)]
pub struct BulkDeleteOutcome {
    pub message: String,
    pub deleted_count: u64,
}

#[derive(Debug, Error)]
pub enum RunOpError {
    #[error("Test run not found")]
    NotFound,
    #[error("{message}")]
    BadRequest { message: String },
    #[error("{message}")]
    InvalidState {
        message: String,
        status: TestRunStatus,
    },
    #[error("{message}")]
    Conflict {
        message: String,
        status: Option<TestRunStatus>,
        active_test_run: Option<String>,
    },
    #[error("{0}")]
    Validation(#[from] PlanError),
}

struct RunState {
    runs: HashMap<String, TestRun>,
    current: Option<String>,
    orchestrator: Option<PhaseOrchestrator>,
}

/// Single writer for every [`TestRun`]. All transitions happen inside its
/// lock; bus callbacks and timers call in through `Arc<RunManager>`.
pub struct RunManager {
    state: Mutex<RunState>,
    store: Arc<Store>,
    bus: BusClient,
    registry: Arc<AgentRegistry>,
    aggregator: Arc<TelemetryAggregator>,
    default_min_agents: u32,
}

impl RunManager {
    pub fn new(
        store: Arc<Store>,
        bus: BusClient,
        registry: Arc<AgentRegistry>,
        aggregator: Arc<TelemetryAggregator>,
        default_min_agents: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RunState {
                runs: HashMap::new(),
                current: None,
                orchestrator: None,
            }),
            store,
            bus,
            registry,
            aggregator,
            default_min_agents: default_min_agents.max(1),
        })
    }

    /// Reloads persisted runs; a run left active by a previous process
    /// becomes current again with its rollups restored.
    pub async fn load_persisted(&self) {
        let runs = match self.store.list_test_runs(100, 0).await {
            Ok(runs) => runs,
            Err(err) => {
                warn!("Failed to load test runs from database: {}", err);
                return;
            }
        };

        let mut state = self.state.lock().await;
        let count = runs.len();
        for run in runs {
            if run.status.is_active() {
                state.current = Some(run.id.clone());
                match self.store.get_agent_results(&run.id).await {
                    Ok(results) => self.aggregator.seed_run(&run.id, results),
                    Err(err) => warn!("Failed to load agent results for {}: {}", run.id, err),
                }
            }
            state.runs.insert(run.id.clone(), run);
        }
        info!("Loaded {} test runs from database", count);
    }

    /// Validates and records a new run in `created`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a nameless run or an invalid plan.
    pub async fn create(&self, request: CreateTestRunRequest) -> Result<TestRun, RunOpError> {
        if request.name.trim().is_empty() {
            return Err(RunOpError::Validation(PlanError::MissingName));
        }
        request.test_plan.validate()?;

        let min_agents = if request.min_agents == 0 {
            self.default_min_agents
        } else {
            request.min_agents
        };

        let run = TestRun::new(
            request.name,
            request.test_plan,
            min_agents,
            request.parameters,
        );

        let mut state = self.state.lock().await;
        state.runs.insert(run.id.clone(), run.clone());
        drop(state);

        self.persist(&run).await;
        info!("Test run created: {} (ID: {})", run.name, run.id);
        Ok(run)
    }

    /// Starts a created run: `running` when quorum is already met,
    /// `waiting_for_agents` otherwise.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidState` outside `created`, or `Conflict` when
    /// another run is active.
    pub async fn start(self: &Arc<Self>, id: &str) -> Result<TestRun, RunOpError> {
        let mut state = self.state.lock().await;
        if !state.runs.contains_key(id) {
            return Err(RunOpError::NotFound);
        }
        self.ensure_no_active_run(&state, id)?;

        let run = state.runs.get_mut(id).ok_or(RunOpError::NotFound)?;
        if run.status != TestRunStatus::Created {
            return Err(RunOpError::InvalidState {
                message: "Test run cannot be started".to_owned(),
                status: run.status,
            });
        }

        run.start();
        let snapshot = run.clone();
        state.current = Some(id.to_owned());
        self.persist(&snapshot).await;

        if self.registry.count() >= snapshot.min_agents as usize {
            info!(
                "Starting test run immediately: {} ({} agents available)",
                snapshot.name,
                self.registry.count()
            );
            self.begin_execution(&mut state, id).await;
        } else {
            info!(
                "Test run waiting for agents: {} ({}/{} agents)",
                snapshot.name,
                self.registry.count(),
                snapshot.min_agents
            );
        }

        let run = state.runs.get(id).cloned().ok_or(RunOpError::NotFound)?;
        drop(state);
        info!("Test run started: {} (ID: {})", run.name, run.id);
        Ok(run)
    }

    /// Registration hook: promotes a waiting run once quorum is met.
    pub async fn on_agent_registered(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        let Some(current_id) = state.current.clone() else {
            info!("Agent registered - coordinator idle, waiting for test run");
            return;
        };
        let Some(run) = state.runs.get(&current_id) else {
            return;
        };
        match run.status {
            TestRunStatus::WaitingForAgents => {
                if self.registry.count() >= run.min_agents as usize {
                    info!(
                        "Starting waiting test run: {} ({} agents now available)",
                        run.name,
                        self.registry.count()
                    );
                    self.begin_execution(&mut state, &current_id).await;
                } else {
                    info!(
                        "Test run still waiting for agents: {} ({}/{} connected)",
                        run.name,
                        self.registry.count(),
                        run.min_agents
                    );
                }
            }
            _ => info!("Agent joined during active test: {}", current_id),
        }
    }

    /// Broadcasts STOP and parks the run in `completing`; the completion
    /// timer still finalises it. Repeats are no-ops.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `InvalidState` for runs that are not active.
    pub async fn stop(self: &Arc<Self>, id: &str) -> Result<(), RunOpError> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(id).ok_or(RunOpError::NotFound)?;

        match run.status {
            TestRunStatus::Completing => return Ok(()),
            TestRunStatus::Running | TestRunStatus::WaitingForAgents => {}
            status => {
                return Err(RunOpError::InvalidState {
                    message: "Test run is not running".to_owned(),
                    status,
                });
            }
        }

        let was_waiting = run.status == TestRunStatus::WaitingForAgents;
        run.mark_completing();
        let snapshot = run.clone();

        if let Some(orchestrator) = &state.orchestrator {
            orchestrator.stop();
        }

        self.persist(&snapshot).await;
        if let Err(err) = self
            .bus
            .publish(subjects::TEST_COMMAND, &TestCommand::stop(id.to_owned()))
        {
            error!("Failed to broadcast stop command: {}", err);
        }
        info!("Stop command sent for test run: {}", snapshot.name);
        drop(state);

        if was_waiting {
            // Nothing armed a completion timer for a run that never began.
            let manager = Arc::clone(self);
            let run_id = id.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(STOPPED_WAITING_GRACE).await;
                manager.complete(&run_id).await;
            });
        }
        Ok(())
    }

    /// Clones a terminal run as `<name> (Rerun)` and starts it.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidState` for non-terminal sources, or `Conflict`
    /// when another run is active.
    pub async fn rerun(self: &Arc<Self>, id: &str) -> Result<TestRun, RunOpError> {
        let mut state = self.state.lock().await;
        let original = state.runs.get(id).ok_or(RunOpError::NotFound)?;
        if !original.status.is_terminal() {
            return Err(RunOpError::InvalidState {
                message: "Can only rerun completed, failed, or cancelled test runs".to_owned(),
                status: original.status,
            });
        }
        self.ensure_no_active_run(&state, id)?;

        let mut new_run = TestRun::new(
            format!("{} (Rerun)", original.name),
            original.test_plan.clone(),
            original.min_agents,
            original.parameters.clone(),
        );
        new_run.start();
        let new_id = new_run.id.clone();
        state.runs.insert(new_id.clone(), new_run.clone());
        state.current = Some(new_id.clone());
        self.persist(&new_run).await;

        if self.registry.count() >= new_run.min_agents as usize {
            info!(
                "Starting rerun test immediately: {} ({} agents available)",
                new_run.name,
                self.registry.count()
            );
            self.begin_execution(&mut state, &new_id).await;
        } else {
            info!(
                "Rerun test waiting for agents: {} ({}/{} agents)",
                new_run.name,
                self.registry.count(),
                new_run.min_agents
            );
        }

        let run = state.runs.get(&new_id).cloned().ok_or(RunOpError::NotFound)?;
        drop(state);
        info!(
            "Test run rerun started: {} (Original ID: {}, New ID: {})",
            run.name, id, run.id
        );
        Ok(run)
    }

    /// Removes a dormant run from memory and the store.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `Conflict` when the run is still active.
    pub async fn delete(&self, id: &str) -> Result<(), RunOpError> {
        let mut state = self.state.lock().await;
        let run = state.runs.get(id).ok_or(RunOpError::NotFound)?;
        if run.status.is_active() {
            return Err(RunOpError::Conflict {
                message: "Cannot delete active test run".to_owned(),
                status: Some(run.status),
                active_test_run: None,
            });
        }

        let name = run.name.clone();
        if state.current.as_deref() == Some(id) {
            state.current = None;
        }
        state.runs.remove(id);
        drop(state);

        self.aggregator.remove_run(id);
        if let Err(err) = self.store.delete_test_run(id).await {
            error!("Failed to delete test run from database: {}", err);
        }
        info!("Test run deleted: {} (ID: {})", name, id);
        Ok(())
    }

    /// Bulk delete by status or age. Requires `confirm: true`.
    ///
    /// # Errors
    ///
    /// `BadRequest` without confirmation, with an unknown criterion, or
    /// with an unparseable age.
    pub async fn bulk_delete(
        &self,
        request: BulkDeleteRequest,
    ) -> Result<BulkDeleteOutcome, RunOpError> {
        if !request.confirm {
            return Err(RunOpError::BadRequest {
                message: "Bulk deletion requires confirmation (set confirm: true)".to_owned(),
            });
        }

        if let Some(status) = request.status.as_deref() {
            let deleted_count = self
                .store
                .delete_test_runs_by_status(status)
                .await
                .map_err(|err| {
                    error!("Failed to bulk delete test runs by status {}: {}", status, err);
                    RunOpError::BadRequest {
                        message: format!("Failed to delete test runs: {}", err),
                    }
                })?;

            let mut state = self.state.lock().await;
            let doomed: Vec<String> = state
                .runs
                .iter()
                .filter(|(_, run)| run.status.as_str() == status && !run.status.is_active())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &doomed {
                state.runs.remove(id);
                self.aggregator.remove_run(id);
            }
            drop(state);

            info!("Bulk deleted {} test runs with status: {}", deleted_count, status);
            return Ok(BulkDeleteOutcome {
                message: format!("Deleted {} test runs with status: {}", deleted_count, status),
                deleted_count,
            });
        }

        if let Some(older_than) = request.older_than.as_deref() {
            let age = humantime::parse_duration(older_than).map_err(|err| {
                RunOpError::BadRequest {
                    message: format!("Invalid duration format: {}", err),
                }
            })?;
            let cutoff = Utc::now()
                - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());

            let deleted_count = self
                .store
                .delete_test_runs_older_than(cutoff)
                .await
                .map_err(|err| {
                    error!("Failed to bulk delete test runs older than {}: {}", older_than, err);
                    RunOpError::BadRequest {
                        message: format!("Failed to delete test runs: {}", err),
                    }
                })?;

            let mut state = self.state.lock().await;
            let doomed: Vec<String> = state
                .runs
                .iter()
                .filter(|(_, run)| run.created_at < cutoff && !run.status.is_active())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &doomed {
                state.runs.remove(id);
                self.aggregator.remove_run(id);
            }
            drop(state);

            info!("Bulk deleted {} test runs older than: {}", deleted_count, older_than);
            return Ok(BulkDeleteOutcome {
                message: format!("Deleted {} test runs older than {}", deleted_count, older_than),
                deleted_count,
            });
        }

        Err(RunOpError::BadRequest {
            message: "Must specify either 'status' or 'older_than' parameter".to_owned(),
        })
    }

    /// Finalises the run: rolls up agent results, stamps completion, and
    /// releases the fleet. Invoked by the completion timer; harmless when
    /// the run is already terminal.
    pub async fn complete(self: &Arc<Self>, run_id: &str) {
        let mut state = self.state.lock().await;
        let Some(run) = state.runs.get_mut(run_id) else {
            return;
        };
        if run.status.is_terminal() {
            return;
        }

        let agent_results = self.aggregator.results_for(run_id);
        let completion = run
            .started_at
            .and_then(|started| (Utc::now() - started).to_std().ok());
        let results = TestRunResults::aggregate(agent_results.clone(), completion);
        run.complete(results);
        let snapshot = run.clone();

        state.orchestrator = None;
        if state.current.as_deref() == Some(run_id) {
            state.current = None;
        }
        drop(state);

        self.registry.clear_ramp_up();
        self.persist(&snapshot).await;
        if let Err(err) = self.store.save_agent_results(run_id, &agent_results).await {
            error!("Failed to save agent results to database: {}", err);
        }
        info!("Test run completed: {}", snapshot.name);
    }

    pub async fn get(&self, id: &str) -> Option<TestRun> {
        if let Some(run) = self.state.lock().await.runs.get(id) {
            return Some(run.clone());
        }
        self.store.get_test_run(id).await.ok()
    }

    /// Most recent first. The store is authoritative; memory covers a
    /// store that cannot be read.
    pub async fn list(&self) -> Vec<TestRun> {
        match self.store.list_test_runs(100, 0).await {
            Ok(runs) => runs,
            Err(err) => {
                warn!("Failed to load test runs from database, using in-memory: {}", err);
                let state = self.state.lock().await;
                let mut runs: Vec<TestRun> = state.runs.values().cloned().collect();
                runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                runs
            }
        }
    }

    pub async fn current_run(&self) -> Option<TestRun> {
        let state = self.state.lock().await;
        let id = state.current.as_deref()?;
        state.runs.get(id).cloned()
    }

    pub async fn current_run_id(&self) -> Option<String> {
        self.state.lock().await.current.clone()
    }

    pub async fn stats(&self) -> serde_json::Value {
        let total = self.store.count_test_runs().await.unwrap_or_else(|err| {
            error!("Failed to get test run count: {}", err);
            0
        });

        let mut status_counts = serde_json::Map::new();
        for status in [
            "created",
            "waiting_for_agents",
            "running",
            "completing",
            "completed",
            "failed",
            "cancelled",
        ] {
            let count = self
                .store
                .count_test_runs_by_status(status)
                .await
                .unwrap_or_else(|err| {
                    warn!("Failed to get count for status {}: {}", status, err);
                    0
                });
            status_counts.insert(status.to_owned(), json!(count));
        }

        let state = self.state.lock().await;
        let in_memory = state.runs.len();
        let current = state
            .current
            .as_deref()
            .and_then(|id| state.runs.get(id))
            .map(|run| {
                json!({
                    "id": run.id,
                    "name": run.name,
                    "status": run.status,
                })
            });
        drop(state);

        json!({
            "total_test_runs": total,
            "status_breakdown": status_counts,
            "in_memory": { "test_runs": in_memory },
            "current_test_run": current,
        })
    }

    /// Transitions the current run to `running` and launches its traffic:
    /// simple broadcast, or the phase orchestrator for custom strategies
    /// with sequential phases.
    async fn begin_execution(self: &Arc<Self>, state: &mut RunState, run_id: &str) {
        let Some(run) = state.runs.get_mut(run_id) else {
            return;
        };
        run.mark_running();
        let snapshot = run.clone();
        self.persist(&snapshot).await;
        self.aggregator.reset_run(run_id);

        let strategy = snapshot.test_plan.ramp_up_strategy.clone();
        if let Some(strategy) = &strategy {
            self.registry.seed_ramp_up(strategy);
        }

        let orchestrated = strategy.filter(|strategy| strategy.has_sequential_phases());

        if let Some(strategy) = orchestrated {
            info!("Starting phase orchestration for test run: {}", snapshot.name);
            match self.bus.subscribe(&subjects::phase_complete(run_id)).await {
                Ok(completions) => {
                    state.orchestrator = Some(PhaseOrchestrator::start(
                        run_id.to_owned(),
                        strategy,
                        self.registry.clone(),
                        Arc::new(self.bus.clone()),
                        completions,
                    ));
                }
                Err(err) => {
                    error!("Failed to subscribe to phase completions: {}", err);
                    run_failed(state, run_id);
                    let failed = state.runs.get(run_id).cloned();
                    if let Some(failed) = failed {
                        self.persist(&failed).await;
                    }
                    return;
                }
            }
        } else {
            let command = TestCommand::start(run_id.to_owned(), snapshot.test_plan.clone());
            if let Err(err) = self.bus.publish(subjects::TEST_COMMAND, &command) {
                error!("Failed to start test run {}: {}", run_id, err);
                run_failed(state, run_id);
                let failed = state.runs.get(run_id).cloned();
                if let Some(failed) = failed {
                    self.persist(&failed).await;
                }
                return;
            }
            info!(
                "Test start command sent to {} agents for test run: {}",
                self.registry.count(),
                snapshot.name
            );
        }

        let duration = match parse_duration(&snapshot.test_plan.duration) {
            Ok(duration) => duration,
            Err(_) => {
                warn!(
                    "Invalid duration {}, using {}",
                    snapshot.test_plan.duration,
                    humantime::format_duration(FALLBACK_RUN_DURATION)
                );
                FALLBACK_RUN_DURATION
            }
        };

        let manager = Arc::clone(self);
        let run_id = run_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            manager.complete(&run_id).await;
        });
        info!(
            "Test will complete automatically in {}",
            humantime::format_duration(duration)
        );
    }

    fn ensure_no_active_run(&self, state: &RunState, requested: &str) -> Result<(), RunOpError> {
        let Some(current_id) = state.current.as_deref() else {
            return Ok(());
        };
        if current_id == requested {
            return Ok(());
        }
        if let Some(current) = state.runs.get(current_id) {
            if current.status.is_active() {
                return Err(RunOpError::Conflict {
                    message: "Another test run is already active".to_owned(),
                    status: None,
                    active_test_run: Some(current.id.clone()),
                });
            }
        }
        Ok(())
    }

    /// Persistence failures are logged; in-memory state stays authoritative.
    async fn persist(&self, run: &TestRun) {
        if let Err(err) = self.store.save_test_run(run).await {
            error!("Failed to save test run to database: {}", err);
        }
    }
}

fn run_failed(state: &mut RunState, run_id: &str) {
    if let Some(run) = state.runs.get_mut(run_id) {
        run.fail();
    }
    if state.current.as_deref() == Some(run_id) {
        state.current = None;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::bus::{BusServer, ConnectOptions};
    use crate::coordinator::registry::AgentRegistry;
    use crate::coordinator::telemetry::TelemetryAggregator;
    use crate::plan::{Endpoint, HttpMethod};
    use crate::protocol::{now_rfc3339, AgentMetrics, AgentRegistration, RegisterAction};

    struct Harness {
        manager: Arc<RunManager>,
        registry: Arc<AgentRegistry>,
        aggregator: Arc<TelemetryAggregator>,
        test_client: BusClient,
        _server: BusServer,
    }

    async fn harness(min_agents: u32) -> Harness {
        let server = BusServer::start("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();
        let bus = BusClient::connect(&addr, ConnectOptions::default())
            .await
            .unwrap();
        let test_client = BusClient::connect(&addr, ConnectOptions::default())
            .await
            .unwrap();

        let store = Arc::new(Store::open(":memory:").await.unwrap());
        let registry = Arc::new(AgentRegistry::new());
        let aggregator = Arc::new(TelemetryAggregator::new(store.clone()));
        let manager = RunManager::new(
            store,
            bus,
            registry.clone(),
            aggregator.clone(),
            min_agents,
        );

        Harness {
            manager,
            registry,
            aggregator,
            test_client,
            _server: server,
        }
    }

    fn plan(duration: &str) -> TestPlan {
        TestPlan {
            name: "api-soak".to_owned(),
            duration: duration.to_owned(),
            concurrency: 2,
            ramp_up_strategy: None,
            endpoints: vec![Endpoint {
                method: HttpMethod::Get,
                url: "http://localhost:9000/".to_owned(),
                headers: BTreeMap::new(),
                body: None,
                think_time: None,
            }],
        }
    }

    fn create_request(duration: &str) -> CreateTestRunRequest {
        CreateTestRunRequest {
            name: "api-soak".to_owned(),
            test_plan: plan(duration),
            min_agents: 0,
            parameters: None,
        }
    }

    fn register(harness: &Harness, agent_id: &str) {
        harness.registry.register(
            &AgentRegistration {
                agent_id: agent_id.to_owned(),
                region: "local".to_owned(),
                concurrency: 4,
                status: "ready".to_owned(),
                timestamp: now_rfc3339(),
                action: RegisterAction::Register,
            },
            None,
        );
    }

    fn metrics(agent_id: &str, requests: u64) -> AgentMetrics {
        AgentMetrics {
            agent_id: agent_id.to_owned(),
            timestamp: now_rfc3339(),
            requests,
            errors: 0,
            avg_latency_ms: 3.0,
            min_latency_ms: 1.0,
            max_latency_ms: 8.0,
            status_codes: BTreeMap::from([(200, requests)]),
        }
    }

    #[tokio::test]
    async fn create_rejects_invalid_plans() {
        let harness = harness(1).await;

        let mut nameless = create_request("1s");
        nameless.name = String::new();
        assert!(matches!(
            harness.manager.create(nameless).await,
            Err(RunOpError::Validation(PlanError::MissingName))
        ));

        let mut empty = create_request("1s");
        empty.test_plan.endpoints.clear();
        assert!(matches!(
            harness.manager.create(empty).await,
            Err(RunOpError::Validation(PlanError::EmptyEndpoints))
        ));
    }

    #[tokio::test]
    async fn quorum_gates_the_start_broadcast() {
        let harness = harness(2).await;
        let mut commands = harness
            .test_client
            .subscribe(subjects::TEST_COMMAND)
            .await
            .unwrap();

        let run = harness.manager.create(create_request("1s")).await.unwrap();
        register(&harness, "agent-1");

        let started = harness.manager.start(&run.id).await.unwrap();
        assert_eq!(started.status, TestRunStatus::WaitingForAgents);
        assert!(started.started_at.is_some());

        register(&harness, "agent-2");
        harness.manager.on_agent_registered().await;

        let current = harness.manager.get(&run.id).await.unwrap();
        assert_eq!(current.status, TestRunStatus::Running);

        let payload = tokio::time::timeout(Duration::from_secs(2), commands.recv())
            .await
            .expect("START broadcast expected")
            .unwrap();
        let command: TestCommand = serde_json::from_value(payload).unwrap();
        assert_eq!(command.test_run_id.as_deref(), Some(run.id.as_str()));
        assert!(command.test_plan.is_some());
    }

    #[tokio::test]
    async fn completion_timer_finalises_results() {
        let harness = harness(1).await;
        register(&harness, "agent-1");

        let run = harness.manager.create(create_request("1s")).await.unwrap();
        harness.manager.start(&run.id).await.unwrap();
        harness.aggregator.record(&run.id, "local", metrics("agent-1", 40));

        tokio::time::sleep(Duration::from_millis(1600)).await;

        let finished = harness.manager.get(&run.id).await.unwrap();
        assert_eq!(finished.status, TestRunStatus::Completed);
        assert!(finished.completed_at.is_some());
        assert!(finished.started_at.unwrap() <= finished.completed_at.unwrap());
        let results = finished.results.unwrap();
        assert_eq!(results.total_requests, 40);
        assert!(results.requests_per_sec > 20.0);
        assert!(harness.manager.current_run_id().await.is_none());
    }

    #[tokio::test]
    async fn only_one_run_may_be_active() {
        let harness = harness(1).await;
        register(&harness, "agent-1");

        let first = harness.manager.create(create_request("30s")).await.unwrap();
        let second = harness.manager.create(create_request("30s")).await.unwrap();
        harness.manager.start(&first.id).await.unwrap();

        match harness.manager.start(&second.id).await {
            Err(RunOpError::Conflict {
                active_test_run, ..
            }) => assert_eq!(active_test_run.as_deref(), Some(first.id.as_str())),
            other => panic!("expected conflict, got {:?}", other.map(|run| run.status)),
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let harness = harness(1).await;
        register(&harness, "agent-1");

        let run = harness.manager.create(create_request("30s")).await.unwrap();
        harness.manager.start(&run.id).await.unwrap();

        harness.manager.stop(&run.id).await.unwrap();
        let stopped = harness.manager.get(&run.id).await.unwrap();
        assert_eq!(stopped.status, TestRunStatus::Completing);

        // A second stop changes nothing.
        harness.manager.stop(&run.id).await.unwrap();
        let still = harness.manager.get(&run.id).await.unwrap();
        assert_eq!(still.status, TestRunStatus::Completing);
    }

    #[tokio::test]
    async fn stopping_a_waiting_run_finalises_it() {
        let harness = harness(5).await;
        register(&harness, "agent-1");

        let run = harness.manager.create(create_request("30s")).await.unwrap();
        let started = harness.manager.start(&run.id).await.unwrap();
        assert_eq!(started.status, TestRunStatus::WaitingForAgents);

        harness.manager.stop(&run.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let finished = harness.manager.get(&run.id).await.unwrap();
        assert!(finished.status.is_terminal());
    }

    #[tokio::test]
    async fn active_runs_cannot_be_deleted() {
        let harness = harness(1).await;
        register(&harness, "agent-1");

        let run = harness.manager.create(create_request("30s")).await.unwrap();
        harness.manager.start(&run.id).await.unwrap();

        match harness.manager.delete(&run.id).await {
            Err(RunOpError::Conflict {
                message, status, ..
            }) => {
                assert_eq!(message, "Cannot delete active test run");
                assert_eq!(status, Some(TestRunStatus::Running));
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        // Created (dormant) runs delete fine.
        let dormant = harness.manager.create(create_request("30s")).await.unwrap();
        harness.manager.delete(&dormant.id).await.unwrap();
        assert!(harness.manager.get(&dormant.id).await.is_none());
    }

    #[tokio::test]
    async fn rerun_clones_terminal_runs() {
        let harness = harness(1).await;
        register(&harness, "agent-1");

        let run = harness.manager.create(create_request("1s")).await.unwrap();
        harness.manager.start(&run.id).await.unwrap();
        harness.manager.complete(&run.id).await;

        let rerun = harness.manager.rerun(&run.id).await.unwrap();
        assert_eq!(rerun.name, "api-soak (Rerun)");
        assert_ne!(rerun.id, run.id);
        assert_eq!(rerun.status, TestRunStatus::Running);

        // Rerunning a non-terminal run is rejected.
        assert!(matches!(
            harness.manager.rerun(&run.id).await,
            Err(RunOpError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn bulk_delete_requires_confirmation() {
        let harness = harness(1).await;
        let outcome = harness
            .manager
            .bulk_delete(BulkDeleteRequest {
                status: Some("completed".to_owned()),
                older_than: None,
                confirm: false,
            })
            .await;
        assert!(matches!(outcome, Err(RunOpError::BadRequest { .. })));

        let outcome = harness
            .manager
            .bulk_delete(BulkDeleteRequest {
                status: None,
                older_than: None,
                confirm: true,
            })
            .await;
        assert!(matches!(outcome, Err(RunOpError::BadRequest { .. })));
    }
}
