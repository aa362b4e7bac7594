//! Session tracker
//!
//! Owns every [`ConversationState`]: turn history, in-flight task ids, the
//! cancellation flags of running turns and the remote continuation per
//! agent. Conversations are independent; the map lock is only held to find an
//! entry, and each entry has its own lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::metrics_handler::MetricsCollector;
use crate::domain::{AgentId, CancelFlag, ConversationState, RemoteTaskRef, SessionId, TaskId, Turn};
use crate::error::{SessionError, SessionResult};

struct SessionEntry {
    state: Mutex<ConversationState>,
    /// One flag per turn that has not been recorded yet
    running: Mutex<Vec<CancelFlag>>,
    /// Number of in-flight tasks
    in_flight: watch::Sender<usize>,
}

impl SessionEntry {
    fn new(id: SessionId) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            state: Mutex::new(ConversationState::new(id)),
            running: Mutex::new(Vec::new()),
            in_flight,
        }
    }

    fn state(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running(&self) -> MutexGuard<'_, Vec<CancelFlag>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_running(&self) -> usize {
        let running = self.running();
        running.iter().for_each(CancelFlag::cancel);
        running.len()
    }

    fn publish_in_flight(&self, state: &ConversationState) {
        self.in_flight.send_replace(state.in_flight.len());
    }

    /// Cancels every running turn and forgets their tasks
    fn shut(&self) {
        self.cancel_running();
        let mut state = self.state();
        state.cancelled = true;
        state.in_flight.clear();
        self.publish_in_flight(&state);
    }
}

pub struct SessionTracker {
    sessions: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
    /// Evicted ids with their eviction time
    expired: RwLock<HashMap<SessionId, Instant>>,
    idle_timeout: Duration,
    expired_retention: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl SessionTracker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            expired: RwLock::new(HashMap::new()),
            idle_timeout,
            expired_retention: idle_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// How long evicted ids are remembered as expired
    pub fn with_expired_retention(mut self, retention: Duration) -> Self {
        self.expired_retention = retention;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Starts a new conversation
    pub async fn open(&self) -> SessionId {
        let id = SessionId::new();
        let mut sessions = self.sessions.write().await;
        sessions.insert(id.clone(), Arc::new(SessionEntry::new(id.clone())));
        self.record_active(sessions.len());
        info!(session_id = %id, "Session opened");
        id
    }

    async fn entry(&self, id: &SessionId) -> SessionResult<Arc<SessionEntry>> {
        if let Some(entry) = self.sessions.read().await.get(id) {
            return Ok(entry.clone());
        }
        if self.expired.read().await.contains_key(id) {
            Err(SessionError::Expired(id.clone()))
        } else {
            Err(SessionError::NotFound(id.clone()))
        }
    }

    /// Marks activity on a session, postponing its eviction
    pub async fn touch(&self, id: &SessionId) -> SessionResult<()> {
        self.entry(id).await?.state().touch();
        Ok(())
    }

    /// Copy of the session's current state
    pub async fn snapshot(&self, id: &SessionId) -> SessionResult<ConversationState> {
        Ok(self.entry(id).await?.state().clone())
    }

    /// Starts a turn and returns the flag its tasks observe.
    ///
    /// Each turn gets a fresh flag so a cancelled turn never poisons the next.
    /// The flag stays reachable by `cancel` until the turn is recorded.
    pub async fn begin_turn(&self, id: &SessionId) -> SessionResult<CancelFlag> {
        let entry = self.entry(id).await?;
        let flag = CancelFlag::new();
        entry.running().push(flag.clone());

        let mut state = entry.state();
        state.cancelled = false;
        state.touch();
        debug!(session_id = %id, turn = state.turns.len() + 1, "Turn started");
        Ok(flag)
    }

    /// Registers the tasks dispatched for the running turn
    pub async fn track_tasks(&self, id: &SessionId, tasks: &[TaskId]) -> SessionResult<()> {
        let entry = self.entry(id).await?;
        let mut state = entry.state();
        state.in_flight.extend(tasks.iter().cloned());
        entry.publish_in_flight(&state);
        Ok(())
    }

    /// Remote continuation per agent for the next turn
    pub async fn continuations(&self, id: &SessionId) -> SessionResult<HashMap<AgentId, RemoteTaskRef>> {
        Ok(self.entry(id).await?.state().remote_tasks.clone())
    }

    /// Stores what the last exchange with `agent` left on the remote side
    pub async fn record_continuation(
        &self,
        id: &SessionId,
        agent: AgentId,
        remote: RemoteTaskRef,
    ) -> SessionResult<()> {
        let entry = self.entry(id).await?;
        let mut state = entry.state();
        if remote.is_empty() {
            state.remote_tasks.remove(&agent);
        } else {
            state.remote_tasks.insert(agent, remote);
        }
        Ok(())
    }

    /// Appends a finished turn and retires its tasks and its flag
    pub async fn record_turn(
        &self,
        id: &SessionId,
        cancel: &CancelFlag,
        turn: Turn,
    ) -> SessionResult<()> {
        let entry = self.entry(id).await?;
        entry.running().retain(|flag| !flag.same_as(cancel));
        let mut state = entry.state();
        for task in &turn.tasks {
            state.in_flight.remove(&task.task_id);
        }
        state.turns.push(turn);
        state.touch();
        entry.publish_in_flight(&state);
        debug!(session_id = %id, turns = state.turns.len(), "Turn recorded");
        Ok(())
    }

    /// Cancels every running turn; their tasks stop at their next suspension point
    pub async fn cancel(&self, id: &SessionId) -> SessionResult<()> {
        let entry = self.entry(id).await?;
        let turns = entry.cancel_running();
        let mut state = entry.state();
        state.cancelled = true;
        state.touch();
        info!(session_id = %id, turns, in_flight = state.in_flight.len(), "Session cancelled");
        Ok(())
    }

    /// Resolves once the session has no in-flight task
    pub async fn wait_idle(&self, id: &SessionId) -> SessionResult<()> {
        let entry = self.entry(id).await?;
        let mut receiver = entry.in_flight.subscribe();
        // The entry keeps the sender alive for the duration of the wait.
        let _ = receiver.wait_for(|count| *count == 0).await;
        Ok(())
    }

    /// Cancels anything still running and destroys the session
    pub async fn close(&self, id: &SessionId) -> SessionResult<ConversationState> {
        let entry = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions.remove(id);
            self.record_active(sessions.len());
            entry
        };
        let Some(entry) = entry else {
            return Err(self.entry(id).await.err().unwrap_or(SessionError::NotFound(id.clone())));
        };

        entry.shut();
        info!(session_id = %id, "Session closed");
        let state = entry.state().clone();
        Ok(state)
    }

    /// Evicts sessions idle for longer than the idle timeout.
    ///
    /// In-flight tasks of an evicted session are cancelled before it is removed.
    /// Ids evicted longer ago than the retention window are forgotten.
    pub async fn evict_idle(&self) -> Vec<SessionId> {
        self.expired
            .write()
            .await
            .retain(|_, evicted| evicted.elapsed() < self.expired_retention);

        let idle: Vec<(SessionId, Arc<SessionEntry>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, entry)| entry.state().is_idle_for(self.idle_timeout))
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        if idle.is_empty() {
            return Vec::new();
        }

        for (id, entry) in &idle {
            let in_flight = entry.state().in_flight.len();
            if in_flight > 0 {
                warn!(session_id = %id, in_flight, "Evicting idle session with in-flight tasks");
            }
            entry.shut();
        }

        let ids: Vec<SessionId> = idle.into_iter().map(|(id, _)| id).collect();
        {
            let mut sessions = self.sessions.write().await;
            for id in &ids {
                sessions.remove(id);
            }
            self.record_active(sessions.len());
        }
        let now = Instant::now();
        self.expired
            .write()
            .await
            .extend(ids.iter().map(|id| (id.clone(), now)));

        info!(evicted = ids.len(), "Evicted idle sessions");
        ids
    }

    /// Runs [`SessionTracker::evict_idle`] every `interval`
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.evict_idle().await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn record_active(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.active_sessions.set(count as f64);
        }
    }
}
