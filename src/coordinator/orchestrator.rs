use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::BusClient;
use crate::error::BusResult;
use crate::plan::{parse_duration_or, PhaseMode, RampPhase, RampUpStrategy};
use crate::protocol::{subjects, PhaseCompletion, PhaseInfo, TestCommand};

use super::registry::AgentRegistry;

/// Unparseable phase durations fall back to this window.
const FALLBACK_PHASE_DURATION: Duration = Duration::from_secs(30);

/// Outbound half of the orchestrator's bus access, abstracted so the
/// sequencing logic can be exercised without a broker.
pub trait PhaseTransport: Send + Sync + 'static {
    /// Sends a command to one agent's private subject.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is gone or the payload does not
    /// serialize.
    fn send_phase_command(&self, agent_id: &str, command: &TestCommand) -> BusResult<()>;
}

impl PhaseTransport for BusClient {
    fn send_phase_command(&self, agent_id: &str, command: &TestCommand) -> BusResult<()> {
        self.publish(&subjects::agent_command(agent_id), command)
    }
}

/// Sequences the custom phases of one run across the fleet. Owned by the
/// run manager for the lifetime of that run.
pub struct PhaseOrchestrator {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PhaseOrchestrator {
    pub fn start(
        run_id: String,
        strategy: RampUpStrategy,
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn PhaseTransport>,
        completions: mpsc::UnboundedReceiver<serde_json::Value>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(execute_phases(
            run_id,
            strategy,
            registry,
            transport,
            completions,
            stop_rx,
        ));
        Self { stop_tx, handle }
    }

    /// Idempotent: the current phase wait observes the signal and no
    /// further phases start.
    pub fn stop(&self) {
        drop(self.stop_tx.send(true));
    }
}

impl Drop for PhaseOrchestrator {
    fn drop(&mut self) {
        drop(self.stop_tx.send(true));
        self.handle.abort();
    }
}

async fn execute_phases(
    run_id: String,
    strategy: RampUpStrategy,
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn PhaseTransport>,
    mut completions: mpsc::UnboundedReceiver<serde_json::Value>,
    mut stop_rx: watch::Receiver<bool>,
) {
    if strategy.phases.is_empty() {
        info!("No custom phases defined, using standard ramp-up");
        return;
    }

    info!(
        "Starting phase orchestration for test run {} with {} phases",
        run_id,
        strategy.phases.len()
    );

    for (phase_index, phase) in strategy.phases.iter().enumerate() {
        if *stop_rx.borrow() {
            info!("Phase orchestration stopped for test run {}", run_id);
            return;
        }

        let phase_entry = Instant::now();
        let phase_id = format!("{}-phase-{}", run_id, phase_index);
        let phase_duration = parse_duration_or(&phase.duration, FALLBACK_PHASE_DURATION);

        // The execution set is fixed at phase entry; late joiners wait for
        // the next phase.
        let agent_ids = registry.sorted_ids();
        info!(
            "Starting phase {} ({:?} mode, {} concurrency, {} duration, {} agents)",
            phase_index,
            phase.mode,
            phase.concurrency,
            phase.duration,
            agent_ids.len()
        );

        let dispatched = match phase.mode {
            PhaseMode::Sequential => {
                dispatch_sequential(
                    &run_id,
                    phase_index,
                    phase,
                    &phase_id,
                    phase_duration,
                    &agent_ids,
                    transport.as_ref(),
                    &mut stop_rx,
                )
                .await
            }
            PhaseMode::Parallel => dispatch_parallel(
                &run_id,
                phase_index,
                phase,
                &phase_id,
                &agent_ids,
                transport.as_ref(),
            ),
        };
        if !dispatched {
            return;
        }

        let deadline = phase_entry + phase_duration;
        if !wait_for_phase(
            phase_index,
            &agent_ids,
            deadline,
            &mut completions,
            &mut stop_rx,
        )
        .await
        {
            return;
        }
    }

    info!("Phase orchestration completed for test run {}", run_id);
}

/// Staggers agents over the phase window: agent k starts at `k * per_agent`
/// and runs for `per_agent`. Returns `false` when stopped mid-dispatch.
#[allow(clippy::too_many_arguments)]
async fn dispatch_sequential(
    run_id: &str,
    phase_index: usize,
    phase: &RampPhase,
    phase_id: &str,
    phase_duration: Duration,
    agent_ids: &[String],
    transport: &dyn PhaseTransport,
    stop_rx: &mut watch::Receiver<bool>,
) -> bool {
    if agent_ids.is_empty() {
        warn!("No active agents for sequential phase {}", phase_index);
        return true;
    }

    let per_agent = phase_duration / agent_ids.len() as u32;
    let per_agent_label = humantime::format_duration(per_agent).to_string();
    info!(
        "Sequential phase {}: {} agents, {} per agent",
        phase_index,
        agent_ids.len(),
        per_agent_label
    );

    for (slot, agent_id) in agent_ids.iter().enumerate() {
        if slot > 0 {
            tokio::select! {
                () = tokio::time::sleep(per_agent) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return false;
                    }
                }
            }
        }

        let info = PhaseInfo {
            phase_index,
            phase_id: phase_id.to_owned(),
            mode: phase.mode,
            concurrency: phase.concurrency,
            duration: per_agent_label.clone(),
            agent_order: vec![agent_id.clone()],
        };
        send_command(run_id, agent_id, info, transport);
        info!(
            "Sequential phase {}: started agent {} ({}/{})",
            phase_index,
            agent_id,
            slot + 1,
            agent_ids.len()
        );
    }
    true
}

fn dispatch_parallel(
    run_id: &str,
    phase_index: usize,
    phase: &RampPhase,
    phase_id: &str,
    agent_ids: &[String],
    transport: &dyn PhaseTransport,
) -> bool {
    for agent_id in agent_ids {
        let info = PhaseInfo {
            phase_index,
            phase_id: phase_id.to_owned(),
            mode: phase.mode,
            concurrency: phase.concurrency,
            duration: phase.duration.clone(),
            agent_order: Vec::new(),
        };
        send_command(run_id, agent_id, info, transport);
    }
    info!(
        "Parallel phase {}: started {} agents simultaneously",
        phase_index,
        agent_ids.len()
    );
    true
}

fn send_command(run_id: &str, agent_id: &str, info: PhaseInfo, transport: &dyn PhaseTransport) {
    let command = TestCommand::start_phase(run_id.to_owned(), info);
    if let Err(err) = transport.send_phase_command(agent_id, &command) {
        error!("Failed to send phase command to agent {}: {}", agent_id, err);
    }
}

/// Blocks until the phase window elapses, every snapshot agent reports
/// completion, or a stop arrives. Returns `false` on stop.
async fn wait_for_phase(
    phase_index: usize,
    agent_ids: &[String],
    deadline: Instant,
    completions: &mut mpsc::UnboundedReceiver<serde_json::Value>,
    stop_rx: &mut watch::Receiver<bool>,
) -> bool {
    let expected: HashSet<&str> = agent_ids.iter().map(String::as_str).collect();
    let mut completed: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                info!("Phase {} completed by timeout", phase_index);
                return true;
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return false;
                }
            }
            payload = completions.recv() => {
                let Some(payload) = payload else {
                    // Completion feed gone; the timer still bounds the phase.
                    tokio::time::sleep_until(deadline).await;
                    return true;
                };
                let completion: PhaseCompletion = match serde_json::from_value(payload) {
                    Ok(completion) => completion,
                    Err(err) => {
                        error!("Failed to decode phase completion: {}", err);
                        continue;
                    }
                };
                if completion.phase_index != phase_index {
                    continue;
                }
                if expected.contains(completion.agent_id.as_str()) {
                    debug!(
                        "Agent {} completed phase {} ({}/{} agents done)",
                        completion.agent_id,
                        phase_index,
                        completed.len() + 1,
                        expected.len()
                    );
                    completed.insert(completion.agent_id);
                }
                if !expected.is_empty() && completed.len() == expected.len() {
                    info!("All agents completed phase {}", phase_index);
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::{now_rfc3339, AgentRegistration, CommandKind, RegisterAction};

    struct RecordingTransport {
        sends: Mutex<Vec<(String, TestCommand, Instant)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sends: Mutex::new(Vec::new()),
            })
        }

        fn sends(&self) -> Vec<(String, TestCommand, Instant)> {
            self.sends.lock().unwrap().clone()
        }
    }

    impl PhaseTransport for RecordingTransport {
        fn send_phase_command(&self, agent_id: &str, command: &TestCommand) -> BusResult<()> {
            self.sends
                .lock()
                .unwrap()
                .push((agent_id.to_owned(), command.clone(), Instant::now()));
            Ok(())
        }
    }

    fn registry_with(ids: &[&str]) -> Arc<AgentRegistry> {
        let registry = Arc::new(AgentRegistry::new());
        for id in ids {
            registry.register(
                &AgentRegistration {
                    agent_id: (*id).to_owned(),
                    region: String::new(),
                    concurrency: 10,
                    status: "ready".to_owned(),
                    timestamp: now_rfc3339(),
                    action: RegisterAction::Register,
                },
                None,
            );
        }
        registry
    }

    fn sequential_strategy(duration: &str) -> RampUpStrategy {
        RampUpStrategy::custom(
            duration,
            vec![RampPhase {
                duration: duration.to_owned(),
                concurrency: 10,
                mode: PhaseMode::Sequential,
            }],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_phase_staggers_agents_over_the_window() {
        let transport = RecordingTransport::new();
        let registry = registry_with(&["c", "a", "b"]);
        let (_tx, completions) = mpsc::unbounded_channel();

        let started = Instant::now();
        let orchestrator = PhaseOrchestrator::start(
            "run-1".to_owned(),
            sequential_strategy("9s"),
            registry,
            transport.clone(),
            completions,
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(orchestrator);

        let sends = transport.sends();
        assert_eq!(sends.len(), 3);
        // Sorted order, slots at 0s / 3s / 6s, each 3s long.
        let offsets: Vec<u64> = sends
            .iter()
            .map(|(_, _, at)| at.duration_since(started).as_secs())
            .collect();
        assert_eq!(
            sends.iter().map(|(id, _, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(offsets, vec![0, 3, 6]);
        for (_, command, _) in &sends {
            assert_eq!(command.command, CommandKind::StartPhase);
            let phase = command.current_phase.as_ref().unwrap();
            assert_eq!(phase.duration, "3s");
            assert_eq!(phase.phase_id, "run-1-phase-0");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_phase_reaches_every_agent_at_once() {
        let transport = RecordingTransport::new();
        let registry = registry_with(&["a", "b"]);
        let (_tx, completions) = mpsc::unbounded_channel();

        let strategy = RampUpStrategy::custom(
            "4s",
            vec![RampPhase {
                duration: "4s".to_owned(),
                concurrency: 5,
                mode: PhaseMode::Parallel,
            }],
        );
        let started = Instant::now();
        let orchestrator = PhaseOrchestrator::start(
            "run-2".to_owned(),
            strategy,
            registry,
            transport.clone(),
            completions,
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(orchestrator);

        let sends = transport.sends();
        assert_eq!(sends.len(), 2);
        for (_, _, at) in &sends {
            assert_eq!(at.duration_since(started).as_secs(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_agents_completing_ends_the_phase_early() {
        let transport = RecordingTransport::new();
        let registry = registry_with(&["a"]);
        let (completions_tx, completions) = mpsc::unbounded_channel();

        let strategy = RampUpStrategy::custom(
            "60s",
            vec![
                RampPhase {
                    duration: "60s".to_owned(),
                    concurrency: 2,
                    mode: PhaseMode::Sequential,
                },
                RampPhase {
                    duration: "60s".to_owned(),
                    concurrency: 4,
                    mode: PhaseMode::Parallel,
                },
            ],
        );
        let orchestrator = PhaseOrchestrator::start(
            "run-3".to_owned(),
            strategy,
            registry,
            transport.clone(),
            completions,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        completions_tx
            .send(
                serde_json::to_value(PhaseCompletion {
                    agent_id: "a".to_owned(),
                    phase_id: "run-3-phase-0".to_owned(),
                    phase_index: 0,
                    completed_at: now_rfc3339(),
                })
                .unwrap(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Phase 1 started well before phase 0's 60s window expired.
        let sends = transport.sends();
        assert_eq!(sends.len(), 2);
        let phase = sends[1].1.current_phase.as_ref().unwrap();
        assert_eq!(phase.phase_index, 1);
        drop(orchestrator);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_phases() {
        let transport = RecordingTransport::new();
        let registry = registry_with(&["a"]);
        let (_tx, completions) = mpsc::unbounded_channel();

        let strategy = RampUpStrategy::custom(
            "10s",
            vec![
                RampPhase {
                    duration: "5s".to_owned(),
                    concurrency: 1,
                    mode: PhaseMode::Sequential,
                },
                RampPhase {
                    duration: "5s".to_owned(),
                    concurrency: 2,
                    mode: PhaseMode::Sequential,
                },
            ],
        );
        let orchestrator = PhaseOrchestrator::start(
            "run-4".to_owned(),
            strategy,
            registry,
            transport.clone(),
            completions,
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        orchestrator.stop();
        tokio::time::sleep(Duration::from_secs(20)).await;

        let sends = transport.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].1.current_phase.as_ref().unwrap().phase_index, 0);
    }
}
