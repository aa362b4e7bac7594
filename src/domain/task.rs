//! Dispatch task types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{AgentId, TaskId};
use crate::error::DispatchError;

/// Local status of one outbound call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Streaming => write!(f, "streaming"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Remote task and context identifiers that let a later turn continue a
/// conversation on the remote side
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTaskRef {
    /// Remote task to continue; `None` once the remote task has finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

impl RemoteTaskRef {
    pub fn is_empty(&self) -> bool {
        self.task_id.is_none() && self.context_id.is_none()
    }
}

/// Request payload in the shape the remote protocol expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub message_id: String,
    pub text: String,
    /// Continuation of an existing remote task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Ask for an incremental stream instead of a single payload
    pub streaming: bool,
}

impl RemoteRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().simple().to_string(),
            text: text.into(),
            task_id: None,
            context_id: None,
            streaming: false,
        }
    }

    pub fn continuing(mut self, remote: Option<&RemoteTaskRef>) -> Self {
        if let Some(remote) = remote {
            self.task_id = remote.task_id.clone();
            self.context_id = remote.context_id.clone();
        }
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

/// Error raised when a terminal task is asked to change state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task_id} is already {from}, cannot move to {to}")]
pub struct InvalidTransition {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// One outbound call to one remote agent
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub id: TaskId,
    pub target: AgentId,
    pub request: RemoteRequest,
    status: TaskStatus,
    error: Option<DispatchError>,
    /// Remote identifiers learned while the task ran
    pub remote: RemoteTaskRef,
    /// Remote asked for more input before it can finish
    pub awaiting_input: bool,
    pub attempts: u32,
}

impl DispatchTask {
    pub fn new(target: AgentId, request: RemoteRequest) -> Self {
        Self {
            id: TaskId::new(),
            target,
            request,
            status: TaskStatus::Pending,
            error: None,
            remote: RemoteTaskRef::default(),
            awaiting_input: false,
            attempts: 0,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn error(&self) -> Option<&DispatchError> {
        self.error.as_ref()
    }

    /// Moves the task to `next`; terminal states are final
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        if self.status.is_terminal() {
            return Err(InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Marks the task failed with `error`
    pub fn fail(&mut self, error: DispatchError) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.id.clone(),
            target: self.target.clone(),
            status: self.status,
            error: self.error.as_ref().map(ToString::to_string),
        }
    }
}

/// Serializable record of a task's final state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub target: AgentId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
