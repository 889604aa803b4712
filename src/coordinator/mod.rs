//! Coordinator role: embedded bus broker, agent registry, telemetry
//! aggregation, run lifecycle management, and the control API.

mod api;
mod orchestrator;
mod registry;
mod runs;
mod telemetry;

pub use registry::{AgentInfo, AgentRegistry};
pub use runs::{BulkDeleteRequest, CreateTestRunRequest, RunManager, RunOpError};
pub use telemetry::TelemetryAggregator;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::bus::{BusClient, BusServer, ConnectOptions};
use crate::error::AppResult;
use crate::persist::Store;
use crate::plan::{RampUpCalculator, RampUpExecution};
use crate::protocol::{
    subjects, AgentHeartbeat, AgentMetrics, AgentRegistration, AgentStatusUpdate, ExecutionStatus,
    RegisterAction,
};

/// The broker must accept connections within this window or startup fails.
const BUS_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub host: String,
    pub bus_port: u16,
    pub http_port: u16,
    pub dsn: String,
    pub min_agents: u32,
}

/// A started coordinator: broker, subscriptions, janitor, and API server
/// all running. Dropping it tears the broker down.
pub struct Coordinator {
    pub runs: Arc<RunManager>,
    pub registry: Arc<AgentRegistry>,
    pub aggregator: Arc<TelemetryAggregator>,
    pub bus_addr: SocketAddr,
    pub api_addr: SocketAddr,
    bus: BusClient,
    bus_server: BusServer,
}

impl Coordinator {
    /// Boots every coordinator component.
    ///
    /// # Errors
    ///
    /// Returns an error on fatal startup failures: persistence init, bus
    /// bind/readiness, or the API listener.
    pub async fn start(options: CoordinatorOptions) -> AppResult<Self> {
        let started_at = Instant::now();

        let store = Arc::new(Store::open(&options.dsn).await?);

        let bus_addr = format!("{}:{}", options.host, options.bus_port);
        let bus_server = BusServer::start(&bus_addr).await?;
        bus_server.wait_ready(BUS_READY_TIMEOUT).await?;
        let bus_addr = bus_server.local_addr();
        info!("Bus server started on {}", bus_addr);

        let bus = BusClient::connect(&bus_addr.to_string(), ConnectOptions::default()).await?;

        let registry = Arc::new(AgentRegistry::new());
        let aggregator = Arc::new(TelemetryAggregator::new(store.clone()));
        let runs = RunManager::new(
            store.clone(),
            bus.clone(),
            registry.clone(),
            aggregator.clone(),
            options.min_agents,
        );
        runs.load_persisted().await;

        spawn_registration_handler(
            bus.subscribe(subjects::AGENT_REGISTER).await?,
            registry.clone(),
            runs.clone(),
        );
        spawn_heartbeat_handler(
            bus.subscribe(subjects::AGENT_HEARTBEAT).await?,
            registry.clone(),
        );
        spawn_status_handler(
            bus.subscribe(subjects::AGENT_STATUS).await?,
            registry.clone(),
        );
        spawn_telemetry_handler(
            bus.subscribe(subjects::TELEMETRY).await?,
            registry.clone(),
            runs.clone(),
            aggregator.clone(),
        );
        registry::spawn_janitor(registry.clone());
        info!("Agent registration system ready");

        let api_state = api::ApiState {
            runs: runs.clone(),
            registry: registry.clone(),
            aggregator: aggregator.clone(),
            store,
            started_at,
            host: options.host.clone(),
            bus_port: bus_addr.port(),
            http_port: options.http_port,
        };
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", options.host, options.http_port))
                .await?;
        let api_addr = listener.local_addr()?;
        let router = api::build_router(api_state);
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                error!("API server failed: {}", err);
            }
        });

        Ok(Self {
            runs,
            registry,
            aggregator,
            bus_addr,
            api_addr,
            bus,
            bus_server,
        })
    }

    /// Best-effort flush of the bus session, then broker teardown.
    pub async fn shutdown(&self) {
        if self.bus.drain().await.is_err() {
            // Session already gone; nothing left to flush.
        }
        self.bus_server.shutdown();
        info!("Coordinator shutdown complete");
    }
}

/// Runs the coordinator until interrupted.
///
/// # Errors
///
/// Returns an error on fatal startup failures.
pub async fn run_coordinator(options: CoordinatorOptions) -> AppResult<()> {
    let coordinator = Coordinator::start(options).await?;

    info!("Coordinator ready - waiting for test plans via HTTP API");
    info!("API server: http://{}", coordinator.api_addr);
    info!("Create test plans: POST /api/v1/test-runs");
    info!("Start tests: POST /api/v1/test-runs/{{id}}/start");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, shutting down coordinator...");
    coordinator.shutdown().await;
    Ok(())
}

fn spawn_registration_handler(
    mut messages: mpsc::UnboundedReceiver<serde_json::Value>,
    registry: Arc<AgentRegistry>,
    runs: Arc<RunManager>,
) {
    tokio::spawn(async move {
        while let Some(payload) = messages.recv().await {
            let registration: AgentRegistration = match serde_json::from_value(payload) {
                Ok(registration) => registration,
                Err(err) => {
                    error!("Failed to decode agent registration: {}", err);
                    continue;
                }
            };

            match registration.action {
                RegisterAction::Register => {
                    // Agents joining a strategy-bearing run mid-flight get
                    // a ramp-up execution sized to their capacity.
                    let ramp_up = match runs.current_run().await {
                        Some(run) => run.test_plan.ramp_up_strategy.and_then(|strategy| {
                            RampUpCalculator::new(strategy, registration.concurrency)
                                .ok()
                                .map(RampUpExecution::start)
                        }),
                        None => None,
                    };
                    let (is_new, _) = registry.register(&registration, ramp_up);
                    if is_new {
                        runs.on_agent_registered().await;
                    }
                }
                RegisterAction::Unregister => {
                    registry.unregister(&registration.agent_id);
                }
            }
        }
    });
}

fn spawn_heartbeat_handler(
    mut messages: mpsc::UnboundedReceiver<serde_json::Value>,
    registry: Arc<AgentRegistry>,
) {
    tokio::spawn(async move {
        while let Some(payload) = messages.recv().await {
            match serde_json::from_value::<AgentHeartbeat>(payload) {
                Ok(heartbeat) => registry.touch(&heartbeat.agent_id),
                Err(err) => error!("Failed to decode agent heartbeat: {}", err),
            }
        }
    });
}

fn spawn_status_handler(
    mut messages: mpsc::UnboundedReceiver<serde_json::Value>,
    registry: Arc<AgentRegistry>,
) {
    tokio::spawn(async move {
        while let Some(payload) = messages.recv().await {
            let update: AgentStatusUpdate = match serde_json::from_value(payload) {
                Ok(update) => update,
                Err(err) => {
                    error!("Failed to decode execution update: {}", err);
                    continue;
                }
            };
            info!("Agent {}: {}", update.agent_id, update.message);
            // A finished agent goes back to the idle pool.
            let state = if update.status == ExecutionStatus::Completed {
                ExecutionStatus::Idle
            } else {
                update.status
            };
            registry.set_execution_state(&update.agent_id, state);
        }
    });
}

fn spawn_telemetry_handler(
    mut messages: mpsc::UnboundedReceiver<serde_json::Value>,
    registry: Arc<AgentRegistry>,
    runs: Arc<RunManager>,
    aggregator: Arc<TelemetryAggregator>,
) {
    tokio::spawn(async move {
        while let Some(payload) = messages.recv().await {
            let metrics: AgentMetrics = match serde_json::from_value(payload) {
                Ok(metrics) => metrics,
                Err(err) => {
                    error!("Failed to decode telemetry: {}", err);
                    continue;
                }
            };

            registry.touch(&metrics.agent_id);

            // Snapshots are only meaningful against the current run.
            let Some(run_id) = runs.current_run_id().await else {
                continue;
            };
            let region = registry
                .snapshot()
                .into_iter()
                .find(|agent| agent.id == metrics.agent_id)
                .map(|agent| agent.region)
                .unwrap_or_default();

            aggregator.record(&run_id, &region, metrics);
        }
    });
}
