use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "armonite",
    version,
    about = "Distributed HTTP load generator",
    propagate_version = true
)]
pub struct Cli {
    /// Path to a TOML config file (defaults to ./armonite.toml when present).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control plane: bus broker, registry, and HTTP API.
    Coordinator(CoordinatorArgs),
    /// Run a load-generating agent attached to a coordinator.
    Agent(AgentArgs),
}

#[derive(Debug, Args)]
pub struct CoordinatorArgs {
    /// Address to bind the bus and API listeners on.
    #[arg(long)]
    pub host: Option<String>,

    /// Message bus port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Control API port.
    #[arg(long = "http-port")]
    pub http_port: Option<u16>,

    /// Agents required before a started run begins generating load.
    #[arg(long = "min-agents")]
    pub min_agents: Option<u32>,
}

#[derive(Debug, Args)]
pub struct AgentArgs {
    /// Coordinator host to join.
    #[arg(long = "master-host")]
    pub master_host: Option<String>,

    /// Coordinator bus port.
    #[arg(long = "master-port")]
    pub master_port: Option<u16>,

    /// Peak virtual users this agent can drive.
    #[arg(long)]
    pub concurrency: Option<u32>,

    /// Region label reported with results.
    #[arg(long)]
    pub region: Option<String>,

    /// Agent id; generated when omitted.
    #[arg(long)]
    pub id: Option<String>,

    /// Development mode: caps concurrency, rate, and think time.
    #[arg(long)]
    pub dev: bool,

    /// Requests per second ceiling (0 disables limiting).
    #[arg(long = "rate-limit")]
    pub rate_limit: Option<u32>,

    /// Pause between requests when an endpoint sets none (e.g. 200ms).
    #[arg(long = "default-think-time")]
    pub default_think_time: Option<String>,

    /// Reuse connections across requests.
    #[arg(long = "keep-alive")]
    pub keep_alive: Option<bool>,
}
