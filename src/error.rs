//! Error types for the routing layer

use thiserror::Error;

use crate::domain::{AgentId, SessionId};
use crate::domain::response::TaskFailure;

/// Errors raised while fetching or validating agent descriptors
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    /// Remote did not answer within the discovery timeout
    #[error("Agent at {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    /// Returned metadata failed validation
    #[error("Malformed descriptor from {address}: {reason}")]
    Malformed { address: String, reason: String },

    /// Extended descriptor refused the credential
    #[error("Credential rejected by {address}: {reason}")]
    Unauthorized { address: String, reason: String },
}

impl DiscoveryError {
    /// Only transport-level failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, DiscoveryError::Unreachable { .. })
    }
}

/// Errors raised while dispatching one task to a remote agent
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Underlying connection failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote agent explicitly refused the task
    #[error("Remote task rejected: {0}")]
    Rejected(String),

    /// Remote did not finish within the dispatch timeout
    #[error("Dispatch timed out after {0}ms")]
    Timeout(u64),

    /// Remote accepted the task but reported failure
    #[error("Remote task failed: {0}")]
    RemoteFailed(String),

    /// Remote answered with something outside the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No descriptor is registered for the target
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Task was cancelled")]
    Cancelled,

    /// Fault inside the host while running the task
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Errors that a fresh attempt could plausibly fix
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Transport(_) | DispatchError::Timeout(_))
    }

    /// Errors that leave the connection unusable
    pub fn poisons_connection(&self) -> bool {
        matches!(self, DispatchError::Transport(_))
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::Timeout(0)
        } else if err.is_connect() {
            DispatchError::Transport(format!("Connection error: {}", err))
        } else if err.is_decode() {
            DispatchError::Protocol(err.to_string())
        } else {
            DispatchError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Protocol(err.to_string())
    }
}

/// Terminal failures of an aggregation request
#[derive(Debug, Clone, Error)]
pub enum AggregationError {
    /// Some tasks failed, others succeeded
    #[error("{} of the dispatched tasks failed", failures.len())]
    PartialFailure { failures: Vec<TaskFailure> },

    /// Every dispatched task failed
    #[error("All {} dispatched tasks failed", failures.len())]
    TotalFailure { failures: Vec<TaskFailure> },

    /// Unexpected fault inside the host
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AggregationError {
    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            AggregationError::PartialFailure { failures }
            | AggregationError::TotalFailure { failures } => failures,
            AggregationError::Internal(_) => &[],
        }
    }
}

/// Errors from the session tracker
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// Session was evicted after its idle period
    #[error("Session expired: {0}")]
    Expired(SessionId),
}

/// Errors surfaced by the router before any task is dispatched
#[derive(Debug, Clone, Error)]
pub enum RouterError {
    /// No registered agent declares a matching capability
    #[error("No agent can handle this request")]
    NoCandidateAgent,
}

/// Errors returned from the inbound entry point
#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Result type alias for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;
