//! Agent role: connects to the coordinator's bus, registers, and turns
//! test commands into HTTP load.

mod control;
mod httpexec;
mod metrics;
mod rate;
mod worker;

pub use metrics::MetricsRecorder;
pub use rate::RateLimiter;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::bus::{BusClient, ConnectOptions};
use crate::error::{AgentError, AppError, AppResult};
use crate::protocol::{now_rfc3339, subjects, AgentHeartbeat, AgentRegistration, RegisterAction};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Telemetry cadence: a few quick reports first, then a slower steady state.
const EARLY_TELEMETRY_INTERVAL: Duration = Duration::from_secs(2);
const STEADY_TELEMETRY_INTERVAL: Duration = Duration::from_secs(5);
const EARLY_TELEMETRY_REPORTS: u32 = 3;

/// Dev-mode ceilings applied before anything starts.
const DEV_MAX_CONCURRENCY: u32 = 100;
const DEV_RATE_LIMIT: u32 = 1000;
const DEV_THINK_TIME: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub id: String,
    pub region: String,
    pub master_host: String,
    pub master_port: u16,
    pub concurrency: u32,
    pub keep_alive: bool,
    pub dev_mode: bool,
    pub rate_limit: u32,
    pub default_think_time: Duration,
}

impl AgentConfig {
    /// Caps resource usage for local development. Explicit settings win
    /// only when they are more restrictive than the ceiling.
    pub fn apply_dev_mode(&mut self) {
        if !self.dev_mode {
            return;
        }
        info!("Development mode enabled - applying resource limits");
        if self.concurrency == 0 || self.concurrency > DEV_MAX_CONCURRENCY {
            self.concurrency = DEV_MAX_CONCURRENCY;
            info!("Dev mode: Limited concurrency to {}", self.concurrency);
        }
        if self.rate_limit == 0 {
            self.rate_limit = DEV_RATE_LIMIT;
            info!("Dev mode: Set rate limit to {} requests/second", self.rate_limit);
        }
        if self.default_think_time.is_zero() {
            self.default_think_time = DEV_THINK_TIME;
            info!(
                "Dev mode: Set default think time to {}",
                humantime::format_duration(self.default_think_time)
            );
        }
    }

    pub fn generated_id() -> String {
        format!("agent-{}", Utc::now().timestamp())
    }
}

/// Runs the agent until interrupted.
///
/// # Errors
///
/// Returns an error when the coordinator is unreachable at startup or the
/// HTTP client cannot be built.
pub async fn run_agent(mut config: AgentConfig) -> AppResult<()> {
    config.apply_dev_mode();

    let client = httpexec::build_client(config.concurrency, config.keep_alive)?;
    let addr = format!("{}:{}", config.master_host, config.master_port);

    info!("Attempting to connect to coordinator at {}...", addr);
    let bus = match BusClient::connect(&addr, ConnectOptions::default()).await {
        Ok(bus) => bus,
        Err(err) => {
            error!("Failed to connect to coordinator: {}", err);
            info!("Make sure the coordinator is running:");
            info!("  armonite coordinator");
            return Err(AppError::agent(AgentError::CoordinatorUnreachable {
                addr,
            }));
        }
    };
    // Liveness check before announcing ourselves.
    bus.publish(subjects::PING, &serde_json::json!("ping"))?;
    info!("Successfully connected to coordinator");

    let broadcast_rx = bus.subscribe(subjects::TEST_COMMAND).await?;
    let direct_rx = bus.subscribe(&subjects::agent_command(&config.id)).await?;

    register(&bus, &config, RegisterAction::Register);

    let recorder = Arc::new(MetricsRecorder::new(config.id.clone()));
    let rate_limiter = RateLimiter::new(config.rate_limit);

    spawn_heartbeat(bus.clone(), config.id.clone());
    spawn_telemetry_reporter(bus.clone(), recorder.clone());

    let (control, internal_rx) = control::ControlLoop::new(
        config.clone(),
        bus.clone(),
        client,
        recorder,
        rate_limiter,
    );
    let control_handle = tokio::spawn(control.run(broadcast_rx, direct_rx, internal_rx));

    info!(
        "Agent {} started, connected to {}:{}",
        config.id, config.master_host, config.master_port
    );
    info!(
        "Concurrency: {}, Keep-Alive: {}, Region: {}",
        config.concurrency, config.keep_alive, config.region
    );
    if config.dev_mode {
        info!(
            "Development mode: Rate limit: {} req/s, Default think time: {}",
            config.rate_limit,
            humantime::format_duration(config.default_think_time)
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down agent...");
    register(&bus, &config, RegisterAction::Unregister);
    if bus.drain().await.is_err() {
        // Session already gone.
    }
    control_handle.abort();
    Ok(())
}

fn register(bus: &BusClient, config: &AgentConfig, action: RegisterAction) {
    let registration = AgentRegistration {
        agent_id: config.id.clone(),
        region: config.region.clone(),
        concurrency: config.concurrency,
        status: match action {
            RegisterAction::Register => "ready".to_owned(),
            RegisterAction::Unregister => "shutting_down".to_owned(),
        },
        timestamp: now_rfc3339(),
        action,
    };
    match bus.publish(subjects::AGENT_REGISTER, &registration) {
        Ok(()) => match action {
            RegisterAction::Register => info!("Registered with coordinator"),
            RegisterAction::Unregister => info!("Unregistered from coordinator"),
        },
        Err(err) => error!("Failed to send registration: {}", err),
    }
}

fn spawn_heartbeat(bus: BusClient, agent_id: String) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let heartbeat = AgentHeartbeat {
                agent_id: agent_id.clone(),
                timestamp: now_rfc3339(),
            };
            match bus.publish(subjects::AGENT_HEARTBEAT, &heartbeat) {
                Ok(()) => debug!("Sent heartbeat to coordinator"),
                Err(err) => {
                    debug!("Failed to send heartbeat: {}", err);
                    return;
                }
            }
        }
    });
}

/// Publishes snapshots every 2s for the first three reports, then every 5s.
/// Idle agents (zero requests) stay quiet.
fn spawn_telemetry_reporter(bus: BusClient, recorder: Arc<MetricsRecorder>) {
    tokio::spawn(async move {
        let mut reports: u32 = 0;
        let mut interval = tokio::time::interval(EARLY_TELEMETRY_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;

            let snapshot = recorder.snapshot();
            if snapshot.requests > 0 {
                if let Err(err) = bus.publish(subjects::TELEMETRY, &snapshot) {
                    error!("Failed to publish metrics: {}", err);
                    return;
                }
            }

            reports += 1;
            if reports == EARLY_TELEMETRY_REPORTS {
                interval = tokio::time::interval_at(
                    tokio::time::Instant::now() + STEADY_TELEMETRY_INTERVAL,
                    STEADY_TELEMETRY_INTERVAL,
                );
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
        }
    });
}
