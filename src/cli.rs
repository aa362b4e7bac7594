use clap::Parser;
use std::path::PathBuf;

/// Switchboard - routes user requests to remote A2A agents and aggregates their answers
#[derive(Parser, Debug, Clone)]
#[command(name = "switchboard", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "SWITCHBOARD_CONFIG", default_value = "switchboard.toml")]
    pub config: PathBuf,

    /// Server host address
    #[arg(long, env = "SWITCHBOARD_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(long, env = "SWITCHBOARD_PORT")]
    pub port: Option<u16>,

    /// Remote agent base URL (repeatable); added to the configured agents
    #[arg(long = "agent", env = "SWITCHBOARD_AGENTS", value_delimiter = ',')]
    pub agents: Vec<String>,

    /// Per-dispatch timeout in seconds
    #[arg(long, env = "SWITCHBOARD_DISPATCH_TIMEOUT_SECS")]
    pub dispatch_timeout_secs: Option<u64>,
}
