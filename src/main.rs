use std::error::Error;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use armonite::agent::{self, AgentConfig};
use armonite::args::{AgentArgs, Cli, Command, CoordinatorArgs};
use armonite::config::{self, Config};
use armonite::coordinator::{self, CoordinatorOptions};
use armonite::logger;

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;
    logger::init_logging(&config.logging);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.command {
            Command::Coordinator(flags) => {
                coordinator::run_coordinator(coordinator_options(&config, &flags)).await
            }
            Command::Agent(flags) => agent::run_agent(agent_config(&config, flags)).await,
        }
    })?;

    Ok(())
}

fn coordinator_options(config: &Config, flags: &CoordinatorArgs) -> CoordinatorOptions {
    CoordinatorOptions {
        host: flags.host.clone().unwrap_or_else(|| config.server.host.clone()),
        bus_port: flags.port.unwrap_or(config.server.port),
        http_port: flags.http_port.unwrap_or(config.server.http_port),
        dsn: config.persistence.dsn.clone(),
        min_agents: flags.min_agents.unwrap_or(config.defaults.min_agents),
    }
}

fn agent_config(config: &Config, flags: AgentArgs) -> AgentConfig {
    let default_think_time = flags
        .default_think_time
        .as_deref()
        .map(|value| {
            humantime::parse_duration(value).unwrap_or_else(|err| {
                warn!("Invalid default-think-time '{}', ignoring: {}", value, err);
                Duration::ZERO
            })
        })
        .unwrap_or(Duration::ZERO);

    // A coordinator bound to the wildcard address is reached locally.
    let master_host = flags.master_host.unwrap_or_else(|| {
        if config.server.host == "0.0.0.0" {
            "127.0.0.1".to_owned()
        } else {
            config.server.host.clone()
        }
    });

    AgentConfig {
        id: flags.id.unwrap_or_else(AgentConfig::generated_id),
        region: flags.region.unwrap_or_default(),
        master_host,
        master_port: flags.master_port.unwrap_or(config.server.port),
        concurrency: flags.concurrency.unwrap_or(config.defaults.concurrency),
        keep_alive: flags.keep_alive.unwrap_or(config.defaults.keep_alive),
        dev_mode: flags.dev,
        rate_limit: flags.rate_limit.unwrap_or(0),
        default_think_time,
    }
}
