use config::{Config, Environment, File};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub mod validator;

use crate::cli::Cli;
use crate::discovery::RetryPolicy;
use crate::router::DispatchPolicy;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    /// Remote agents to discover at startup
    #[serde(default)]
    pub agents: Vec<RemoteAgentConfig>,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub sessions: SessionSettings,
    #[serde(default)]
    pub matching: MatchingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// Configuration for one remote agent
#[derive(Clone, Deserialize, Serialize)]
pub struct RemoteAgentConfig {
    /// Base URL the agent serves its descriptor and JSON-RPC endpoint on
    pub url: String,
    /// Bearer credential for the authenticated extended descriptor
    #[serde(default, skip_serializing)]
    pub credential: Option<String>,
    /// Environment variable holding the credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_env: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl fmt::Debug for RemoteAgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAgentConfig")
            .field("url", &self.url)
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .field("credential_env", &self.credential_env)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl RemoteAgentConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credential: None,
            credential_env: None,
            enabled: true,
        }
    }

    /// Credential from the config, else from `credential_env`
    pub fn resolve_credential(&self) -> Option<SecretString> {
        self.credential
            .clone()
            .or_else(|| {
                self.credential_env
                    .as_ref()
                    .and_then(|var| std::env::var(var).ok())
            })
            .filter(|c| !c.is_empty())
            .map(SecretString::from)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Wait before re-resolving an agent whose last refresh failed
    pub refresh_cooldown_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_attempts: 3,
            base_delay_ms: 500,
            refresh_cooldown_secs: 30,
        }
    }
}

impl DiscoverySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.refresh_cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub prefer_streaming: bool,
    pub channel_buffer: usize,
    pub cancel_timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 2,
            retry_base_delay_ms: 500,
            prefer_streaming: true,
            channel_buffer: 64,
            cancel_timeout_ms: 2_000,
        }
    }
}

impl DispatchSettings {
    pub fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            timeout: Duration::from_millis(self.timeout_ms),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            prefer_streaming: self.prefer_streaming,
            channel_buffer: self.channel_buffer,
            cancel_timeout: Duration::from_millis(self.cancel_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSettings {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long an evicted id keeps answering `Expired` instead of `NotFound`
    pub expired_retention_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            sweep_interval_secs: 30,
            expired_retention_secs: 3_600,
        }
    }
}

/// Keyword matching tweaks
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MatchingSettings {
    /// Extra request words per skill tag, e.g. `forecast = ["rain", "sunny"]`
    #[serde(default)]
    pub aliases: HashMap<String, Vec<String>>,
}

impl Settings {
    pub fn new() -> Result<Self, anyhow::Error> {
        Self::from_path(Path::new("switchboard.toml"))
    }

    /// Create settings from CLI arguments (includes config file and CLI overrides)
    pub fn new_with_cli(cli: &Cli) -> Result<Self, anyhow::Error> {
        let mut settings = Self::load(&cli.config)?;

        // Apply CLI overrides (CLI > env vars > config file)
        settings.apply_cli_overrides(cli);

        settings.validate()?;
        Ok(settings)
    }

    pub fn from_path(path: &Path) -> Result<Self, anyhow::Error> {
        let settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let s = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(
                Environment::with_prefix("SWITCHBOARD")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Apply CLI argument overrides to settings
    fn apply_cli_overrides(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(secs) = cli.dispatch_timeout_secs {
            self.dispatch.timeout_ms = secs.saturating_mul(1_000);
        }
        for url in &cli.agents {
            let known = self
                .agents
                .iter()
                .any(|a| a.url.trim_end_matches('/') == url.trim_end_matches('/'));
            if !known {
                self.agents.push(RemoteAgentConfig::new(url.clone()));
            }
        }
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        validator::ConfigValidator::validate(self).map_err(|errors| {
            let error_messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            anyhow::anyhow!(
                "Configuration validation failed:\n{}",
                error_messages.join("\n")
            )
        })
    }

    /// Enabled agents only
    pub fn enabled_agents(&self) -> impl Iterator<Item = &RemoteAgentConfig> {
        self.agents.iter().filter(|a| a.enabled)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.sessions.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.sweep_interval_secs)
    }

    pub fn expired_retention(&self) -> Duration {
        Duration::from_secs(self.sessions.expired_retention_secs)
    }
}
