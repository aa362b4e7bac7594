//! Caller-visible response types

use serde::{Serialize, Serializer};
use std::fmt::Display;

use super::{AgentId, SessionId, TaskId, TaskStatus};
use crate::error::{AggregationError, DispatchError};

fn serialize_display<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// One incremental unit of a dispatched task's response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseChunk {
    pub task_id: TaskId,
    pub agent: AgentId,
    /// Monotonic per task, starting at zero
    pub sequence: u64,
    pub content: String,
}

/// Full response of one successful task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskPayload {
    pub task_id: TaskId,
    pub agent: AgentId,
    pub content: String,
}

/// Failure of one task within an aggregation
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub agent: AgentId,
    #[serde(serialize_with = "serialize_display")]
    pub error: DispatchError,
}

/// Final result of an aggregation request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AggregateOutcome {
    /// Every task completed
    Success { payloads: Vec<TaskPayload> },
    /// At least one task completed; the warning lists the failed ones
    PartialSuccess {
        payloads: Vec<TaskPayload>,
        #[serde(serialize_with = "serialize_display")]
        warning: AggregationError,
        failures: Vec<TaskFailure>,
    },
    /// Nothing usable came back
    Failure {
        #[serde(serialize_with = "serialize_display")]
        error: AggregationError,
        failures: Vec<TaskFailure>,
    },
}

impl AggregateOutcome {
    /// Builds the outcome from per-task results
    pub fn from_results(payloads: Vec<TaskPayload>, failures: Vec<TaskFailure>) -> Self {
        if failures.is_empty() {
            AggregateOutcome::Success { payloads }
        } else if payloads.is_empty() {
            AggregateOutcome::Failure {
                error: AggregationError::TotalFailure {
                    failures: failures.clone(),
                },
                failures,
            }
        } else {
            AggregateOutcome::PartialSuccess {
                payloads,
                warning: AggregationError::PartialFailure {
                    failures: failures.clone(),
                },
                failures,
            }
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AggregateOutcome::Failure {
            error: AggregationError::Internal(message.into()),
            failures: Vec::new(),
        }
    }

    pub fn payloads(&self) -> &[TaskPayload] {
        match self {
            AggregateOutcome::Success { payloads }
            | AggregateOutcome::PartialSuccess { payloads, .. } => payloads,
            AggregateOutcome::Failure { .. } => &[],
        }
    }

    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            AggregateOutcome::Success { .. } => &[],
            AggregateOutcome::PartialSuccess { failures, .. }
            | AggregateOutcome::Failure { failures, .. } => failures,
        }
    }

    /// The aggregation error carried by a degraded or failed outcome
    pub fn error(&self) -> Option<&AggregationError> {
        match self {
            AggregateOutcome::Success { .. } => None,
            AggregateOutcome::PartialSuccess { warning, .. } => Some(warning),
            AggregateOutcome::Failure { error, .. } => Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AggregateOutcome::Success { .. })
    }

    /// All payload contents joined in task order
    pub fn combined_text(&self) -> String {
        self.payloads()
            .iter()
            .map(|p| p.content.as_str())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Event relayed to the caller while an aggregation runs
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregateEvent {
    /// First event of every response: which tasks were dispatched
    Dispatched {
        session_id: SessionId,
        tasks: Vec<(TaskId, AgentId)>,
    },
    Chunk(ResponseChunk),
    /// Terminal marker for one task
    TaskFinished {
        task_id: TaskId,
        agent: AgentId,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Overall terminal marker; nothing follows it
    Finished(AggregateOutcome),
}

impl AggregateEvent {
    pub fn is_finished(&self) -> bool {
        matches!(self, AggregateEvent::Finished(_))
    }
}
