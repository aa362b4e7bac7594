//! Conversation state types

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{AgentId, RemoteTaskRef, SessionId, TaskId, TaskSummary};

/// Cooperative cancellation flag shared by every task of one turn
#[derive(Debug, Clone)]
pub struct CancelFlag {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Whether both handles belong to the same flag
    pub fn same_as(&self, other: &CancelFlag) -> bool {
        Arc::ptr_eq(&self.sender, &other.sender)
    }

    /// Resolves once the flag is set
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this only errs if it was dropped.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// How one turn ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum TurnOutcome {
    Response(String),
    /// Some tasks failed; the text is what the rest returned
    Degraded(String),
    Error(String),
}

/// One request/response exchange within a conversation
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub request: String,
    pub targets: Vec<AgentId>,
    pub tasks: Vec<TaskSummary>,
    pub outcome: TurnOutcome,
    pub completed_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(request: impl Into<String>, outcome: TurnOutcome) -> Self {
        Self {
            request: request.into(),
            targets: Vec::new(),
            tasks: Vec::new(),
            outcome,
            completed_at: Utc::now(),
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskSummary>) -> Self {
        self.targets = tasks.iter().map(|t| t.target.clone()).collect();
        self.tasks = tasks;
        self
    }
}

/// Per-conversation state, owned by the session tracker
#[derive(Debug, Clone, Serialize)]
pub struct ConversationState {
    pub id: SessionId,
    pub turns: Vec<Turn>,
    pub in_flight: HashSet<TaskId>,
    /// Set when the caller aborted the current turn
    pub cancelled: bool,
    /// Remote continuation per agent
    pub remote_tasks: HashMap<AgentId, RemoteTaskRef>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub last_activity: Instant,
}

impl ConversationState {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            turns: Vec::new(),
            in_flight: HashSet::new(),
            cancelled: false,
            remote_tasks: HashMap::new(),
            created_at: Utc::now(),
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle_for(&self, period: std::time::Duration) -> bool {
        self.last_activity.elapsed() >= period
    }
}
