use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bus::BusClient;
use crate::plan::{
    parse_duration_or, RampUpCalculator, RampUpExecution, RampUpStrategy, TestPlan,
};
use crate::protocol::{
    now_rfc3339, subjects, AgentStatusUpdate, CommandKind, ExecutionStatus, PhaseCompletion,
    PhaseInfo, TestCommand,
};

use super::metrics::MetricsRecorder;
use super::rate::RateLimiter;
use super::worker::{run_load, LoadSession};
use super::AgentConfig;

const FALLBACK_RUN_DURATION: Duration = Duration::from_secs(60);
const FALLBACK_PHASE_DURATION: Duration = Duration::from_secs(30);

pub(super) enum Internal {
    RunFinished,
    PhaseFinished { phase: PhaseInfo },
}

struct RunState {
    running: bool,
    current_run_id: Option<String>,
    current_plan: Option<TestPlan>,
    stop_tx: Option<watch::Sender<bool>>,
    phase_stop_tx: Option<watch::Sender<bool>>,
}

/// Processes coordinator commands sequentially. Owns all execution state;
/// load sessions report back through an internal channel, so no lock is
/// shared with the workers.
pub(super) struct ControlLoop {
    config: AgentConfig,
    bus: BusClient,
    client: Client,
    recorder: Arc<MetricsRecorder>,
    rate_limiter: RateLimiter,
    state: RunState,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl ControlLoop {
    pub(super) fn new(
        config: AgentConfig,
        bus: BusClient,
        client: Client,
        recorder: Arc<MetricsRecorder>,
        rate_limiter: RateLimiter,
    ) -> (Self, mpsc::UnboundedReceiver<Internal>) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                bus,
                client,
                recorder,
                rate_limiter,
                state: RunState {
                    running: false,
                    current_run_id: None,
                    current_plan: None,
                    stop_tx: None,
                    phase_stop_tx: None,
                },
                internal_tx,
            },
            internal_rx,
        )
    }

    pub(super) async fn run(
        mut self,
        mut broadcast_rx: mpsc::UnboundedReceiver<serde_json::Value>,
        mut direct_rx: mpsc::UnboundedReceiver<serde_json::Value>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                payload = broadcast_rx.recv() => {
                    let Some(payload) = payload else { return };
                    if let Some(command) = decode_command(payload) {
                        self.handle_broadcast(command);
                    }
                }
                payload = direct_rx.recv() => {
                    let Some(payload) = payload else { return };
                    if let Some(command) = decode_command(payload) {
                        self.handle_direct(command);
                    }
                }
                event = internal_rx.recv() => {
                    let Some(event) = event else { return };
                    self.handle_internal(event);
                }
            }
        }
    }

    fn handle_broadcast(&mut self, command: TestCommand) {
        match command.command {
            CommandKind::Start => self.handle_start(command),
            CommandKind::Stop => self.handle_stop(command),
            CommandKind::StartPhase | CommandKind::StopPhase => {
                // Phase commands arrive on the agent's private subject.
            }
        }
    }

    fn handle_direct(&mut self, command: TestCommand) {
        match command.command {
            CommandKind::StartPhase => self.handle_start_phase(command),
            CommandKind::StopPhase => self.stop_current_phase(),
            CommandKind::Start | CommandKind::Stop => {}
        }
    }

    fn handle_start(&mut self, command: TestCommand) {
        if self.state.running {
            return;
        }
        let Some(plan) = command.test_plan else {
            error!("START command without a test plan");
            return;
        };

        match &command.test_run_id {
            Some(run_id) => {
                info!("Received test plan: {} (Test Run ID: {})", plan.name, run_id);
            }
            None => info!("Received test plan: {}", plan.name),
        }
        info!(
            "Test configuration - Duration: {}, Concurrency: {}, Endpoints: {}",
            plan.duration,
            self.config.concurrency,
            plan.endpoints.len()
        );
        info!("Starting test execution...");

        self.state.running = true;
        self.state.current_run_id = command.test_run_id.clone();
        self.state.current_plan = Some(plan.clone());
        self.recorder.reset();
        self.send_status(
            ExecutionStatus::Starting,
            format!("Starting test execution: {}", plan.name),
        );

        let strategy = plan
            .ramp_up_strategy
            .clone()
            .unwrap_or_else(RampUpStrategy::immediate);
        let ramp_up = self.build_ramp_up(&strategy);
        let duration = match plan.parsed_duration() {
            Ok(duration) => duration,
            Err(_) => {
                warn!(
                    "Invalid duration {}, using {}",
                    plan.duration,
                    humantime::format_duration(FALLBACK_RUN_DURATION)
                );
                FALLBACK_RUN_DURATION
            }
        };

        info!(
            "Starting load test: {} for {} with ramp-up strategy: {:?}",
            plan.name,
            humantime::format_duration(duration),
            strategy.kind
        );
        self.send_status(
            ExecutionStatus::Running,
            format!(
                "Load test running with {:?} ramp-up, {} duration",
                strategy.kind,
                humantime::format_duration(duration)
            ),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        self.state.stop_tx = Some(stop_tx);

        let session = LoadSession {
            client: self.client.clone(),
            endpoints: plan.endpoints,
            concurrency: self.config.concurrency,
            duration,
            ramp_up,
            rate_limiter: self.rate_limiter.clone(),
            default_think_time: self.config.default_think_time,
            recorder: self.recorder.clone(),
        };
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            run_load(session, stop_rx).await;
            drop(internal_tx.send(Internal::RunFinished));
        });
    }

    fn handle_stop(&mut self, command: TestCommand) {
        if let (Some(incoming), Some(current)) =
            (command.test_run_id.as_deref(), self.state.current_run_id.as_deref())
        {
            if incoming != current {
                debug!(
                    "Ignoring stop command for different test run: {} (current: {})",
                    incoming, current
                );
                return;
            }
        }

        info!("Received test stop command");
        self.send_status(
            ExecutionStatus::Stopping,
            "Received stop command from coordinator".to_owned(),
        );
        if let Some(stop_tx) = &self.state.stop_tx {
            drop(stop_tx.send(true));
        }
        self.stop_current_phase();
    }

    fn handle_start_phase(&mut self, command: TestCommand) {
        let Some(phase) = command.current_phase else {
            error!("Received START_PHASE without phase info");
            return;
        };
        // Orchestrated runs skip the broadcast START, so the run id rides
        // on the phase command.
        if command.test_run_id.is_some() {
            self.state.current_run_id = command.test_run_id;
        }

        info!(
            "Agent {} executing phase {} in {:?} mode (concurrency: {}, duration: {})",
            self.config.id, phase.phase_index, phase.mode, phase.concurrency, phase.duration
        );

        let concurrency = phase.concurrency.min(self.config.concurrency);
        let duration = parse_duration_or(&phase.duration, FALLBACK_PHASE_DURATION);
        let endpoints = self
            .state
            .current_plan
            .as_ref()
            .map(|plan| plan.endpoints.clone())
            .unwrap_or_default();

        self.send_status(
            ExecutionStatus::Running,
            format!(
                "Phase {}: {:?} mode, {} workers, {} duration",
                phase.phase_index,
                phase.mode,
                concurrency,
                humantime::format_duration(duration)
            ),
        );

        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.state.phase_stop_tx = Some(stop_tx);
        let internal_tx = self.internal_tx.clone();

        if endpoints.is_empty() {
            // No plan on this agent yet; hold the phase window open so the
            // orchestrator's schedule stays intact.
            warn!("No current plan for phase {}, idling", phase.phase_index);
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(duration) => {}
                    _ = stop_rx.changed() => {}
                }
                drop(internal_tx.send(Internal::PhaseFinished { phase }));
            });
            return;
        }

        let session = LoadSession {
            client: self.client.clone(),
            endpoints,
            concurrency,
            duration,
            ramp_up: None,
            rate_limiter: self.rate_limiter.clone(),
            default_think_time: self.config.default_think_time,
            recorder: self.recorder.clone(),
        };
        tokio::spawn(async move {
            run_load(session, stop_rx).await;
            drop(internal_tx.send(Internal::PhaseFinished { phase }));
        });
    }

    fn stop_current_phase(&mut self) {
        if let Some(stop_tx) = self.state.phase_stop_tx.take() {
            drop(stop_tx.send(true));
            info!("Agent {} stopped current phase", self.config.id);
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::RunFinished => {
                self.state.running = false;
                self.state.stop_tx = None;
                let (requests, errors) = self.recorder.totals();
                info!("Load test completed");
                self.send_status(
                    ExecutionStatus::Completed,
                    format!("Test completed: {} requests, {} errors", requests, errors),
                );
                self.publish_final_telemetry();
            }
            Internal::PhaseFinished { phase } => {
                self.state.phase_stop_tx = None;
                let Some(run_id) = self.state.current_run_id.clone() else {
                    warn!("Phase {} finished without a run id", phase.phase_index);
                    return;
                };
                let completion = PhaseCompletion {
                    agent_id: self.config.id.clone(),
                    phase_id: phase.phase_id.clone(),
                    phase_index: phase.phase_index,
                    completed_at: now_rfc3339(),
                };
                if let Err(err) = self
                    .bus
                    .publish(&subjects::phase_complete(&run_id), &completion)
                {
                    error!("Failed to send phase completion: {}", err);
                }
                info!(
                    "Agent {} completed phase {}",
                    self.config.id, phase.phase_index
                );
            }
        }
    }

    /// Falls back to an immediate ramp when the strategy does not validate
    /// at runtime.
    fn build_ramp_up(&self, strategy: &RampUpStrategy) -> Option<RampUpExecution> {
        match RampUpCalculator::new(strategy.clone(), self.config.concurrency) {
            Ok(calculator) => Some(RampUpExecution::start(calculator)),
            Err(err) => {
                warn!(
                    "Failed to create ramp-up calculator: {}, using immediate ramp-up",
                    err
                );
                RampUpCalculator::new(RampUpStrategy::immediate(), self.config.concurrency)
                    .ok()
                    .map(RampUpExecution::start)
            }
        }
    }

    fn send_status(&self, status: ExecutionStatus, message: String) {
        let update = AgentStatusUpdate {
            agent_id: self.config.id.clone(),
            test_run_id: self.state.current_run_id.clone(),
            status,
            message,
            timestamp: now_rfc3339(),
        };
        if let Err(err) = self.bus.publish(subjects::AGENT_STATUS, &update) {
            error!("Failed to send execution update: {}", err);
        }
    }

    fn publish_final_telemetry(&self) {
        let snapshot = self.recorder.snapshot();
        if snapshot.requests == 0 {
            return;
        }
        if let Err(err) = self.bus.publish(subjects::TELEMETRY, &snapshot) {
            error!("Failed to publish metrics: {}", err);
        }
    }
}

fn decode_command(payload: serde_json::Value) -> Option<TestCommand> {
    match serde_json::from_value(payload) {
        Ok(command) => Some(command),
        Err(err) => {
            error!("Failed to decode test command: {}", err);
            None
        }
    }
}
