use std::collections::HashSet;
use thiserror::Error;

use crate::config::{DiscoverySettings, DispatchSettings, RemoteAgentConfig, SessionSettings, Settings};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Duplicate entry: {0}")]
    Duplicate(String),
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates every section and reports all problems at once
    pub fn validate(settings: &Settings) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if settings.server.host.is_empty() {
            errors.push(ValidationError::MissingField("server.host".to_string()));
        }
        if settings.server.port == 0 {
            errors.push(invalid("server.port", "Port must be greater than 0"));
        }

        errors.extend(Self::validate_agents(&settings.agents));
        errors.extend(Self::validate_discovery(&settings.discovery));
        errors.extend(Self::validate_dispatch(&settings.dispatch));
        errors.extend(Self::validate_sessions(&settings.sessions));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_agents(agents: &[RemoteAgentConfig]) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for (i, agent) in agents.iter().enumerate() {
            let field = format!("agents[{}].url", i);
            let url = agent.url.trim().trim_end_matches('/');
            if url.is_empty() {
                errors.push(ValidationError::MissingField(field));
                continue;
            }
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(invalid(field, "URL must start with http:// or https://"));
            }
            if !seen.insert(url.to_string()) {
                errors.push(ValidationError::Duplicate(format!("agent {}", url)));
            }
        }

        errors
    }

    fn validate_discovery(discovery: &DiscoverySettings) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if discovery.timeout_ms == 0 {
            errors.push(invalid("discovery.timeout_ms", "Timeout must be greater than 0"));
        }
        if discovery.max_attempts == 0 {
            errors.push(invalid("discovery.max_attempts", "At least one attempt is required"));
        }
        errors
    }

    fn validate_dispatch(dispatch: &DispatchSettings) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if dispatch.timeout_ms == 0 {
            errors.push(invalid("dispatch.timeout_ms", "Timeout must be greater than 0"));
        }
        if dispatch.cancel_timeout_ms == 0 {
            errors.push(invalid("dispatch.cancel_timeout_ms", "Timeout must be greater than 0"));
        }
        if dispatch.channel_buffer == 0 {
            errors.push(invalid("dispatch.channel_buffer", "Buffer must hold at least one chunk"));
        }
        errors
    }

    fn validate_sessions(sessions: &SessionSettings) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if sessions.idle_timeout_secs == 0 {
            errors.push(invalid("sessions.idle_timeout_secs", "Idle timeout must be greater than 0"));
        }
        if sessions.sweep_interval_secs == 0 {
            errors.push(invalid("sessions.sweep_interval_secs", "Sweep interval must be greater than 0"));
        }
        errors
    }
}
