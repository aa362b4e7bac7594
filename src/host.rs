//! Inbound entry point
//!
//! [`Host`] wires the registry, resolver, connection pool, router, aggregator
//! and session tracker together and exposes `handle_user_message`.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::metrics_handler::MetricsCollector;
use crate::aggregator::{AggregatedStream, Aggregator};
use crate::config::Settings;
use crate::connection::ConnectionManager;
use crate::discovery::{DiscoveryEvent, DiscoveryResolver};
use crate::domain::{
    AgentDescriptor, AgentSummary, AggregateEvent, AggregateOutcome, CancelFlag,
    ConversationState, DispatchTask, RemoteAgentTransport, SessionId, TaskStatus, Turn,
    TurnOutcome,
};
use crate::error::{HostError, SessionResult};
use crate::matching::CapabilityMatcher;
use crate::registry::DescriptorStore;
use crate::router::Router;
use crate::session::SessionTracker;

const INTERNAL_ERROR: &str = "the request could not be completed";

pub struct Host {
    store: Arc<DescriptorStore>,
    resolver: Arc<DiscoveryResolver>,
    connections: Arc<ConnectionManager>,
    router: Arc<Router>,
    aggregator: Aggregator,
    sessions: Arc<SessionTracker>,
    addresses: Vec<String>,
    buffer: usize,
    dispatch_timeout: Duration,
    sweep_interval: Duration,
}

impl Host {
    pub fn new(
        settings: &Settings,
        transport: Arc<dyn RemoteAgentTransport>,
        matcher: Arc<dyn CapabilityMatcher>,
    ) -> Self {
        Self::build(settings, transport, matcher, None)
    }

    pub fn with_metrics(
        settings: &Settings,
        transport: Arc<dyn RemoteAgentTransport>,
        matcher: Arc<dyn CapabilityMatcher>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self::build(settings, transport, matcher, Some(metrics))
    }

    fn build(
        settings: &Settings,
        transport: Arc<dyn RemoteAgentTransport>,
        matcher: Arc<dyn CapabilityMatcher>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let store = Arc::new(DescriptorStore::new());
        let addresses: Vec<String> = settings.enabled_agents().map(|a| a.url.clone()).collect();

        let mut resolver = DiscoveryResolver::new(
            transport.clone(),
            store.clone(),
            settings.discovery.retry_policy(),
        );
        for agent in settings.enabled_agents() {
            if let Some(credential) = agent.resolve_credential() {
                resolver = resolver.with_credential(&agent.url, credential);
            }
        }

        let mut sessions = SessionTracker::new(settings.idle_timeout())
            .with_expired_retention(settings.expired_retention());
        if let Some(metrics) = &metrics {
            resolver = resolver.with_metrics(metrics.clone());
            sessions = sessions.with_metrics(metrics.clone());
        }
        let resolver = Arc::new(resolver);

        let connections = Arc::new(ConnectionManager::new(store.clone(), transport));
        let policy = settings.dispatch.policy();
        let buffer = policy.channel_buffer;
        let dispatch_timeout = policy.timeout;

        let mut router = Router::new(resolver.clone(), connections.clone(), matcher, policy)
            .with_addresses(addresses.clone())
            .with_refresh_cooldown(settings.discovery.refresh_cooldown());
        if let Some(metrics) = metrics {
            router = router.with_metrics(metrics);
        }

        Self {
            store,
            resolver,
            connections,
            router: Arc::new(router),
            aggregator: Aggregator::new(buffer),
            sessions: Arc::new(sessions),
            addresses,
            buffer,
            dispatch_timeout,
            sweep_interval: settings.sweep_interval(),
        }
    }

    /// Resolves every configured agent; unreachable ones are logged and skipped
    pub async fn discover(&self) -> Vec<Arc<AgentDescriptor>> {
        let resolved = self.resolver.resolve_all(&self.addresses).await;
        info!(
            configured = self.addresses.len(),
            resolved = resolved.len(),
            "Startup discovery finished"
        );
        resolved
    }

    /// Name and description of every known agent
    pub fn roster(&self) -> Vec<AgentSummary> {
        self.store.roster()
    }

    pub fn subscribe_discovery(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.resolver.subscribe()
    }

    pub fn store(&self) -> &Arc<DescriptorStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<DiscoveryResolver> {
        &self.resolver
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub async fn open_session(&self) -> SessionId {
        self.sessions.open().await
    }

    /// Routes `text` within a session and streams the aggregated answer.
    ///
    /// Without a session id a new session is opened. The stream starts with
    /// `Dispatched` and always ends with exactly one `Finished`.
    pub async fn handle_user_message(
        &self,
        session_id: Option<SessionId>,
        text: &str,
    ) -> Result<AggregatedStream, HostError> {
        let session_id = match session_id {
            Some(id) => {
                self.sessions.touch(&id).await?;
                id
            }
            None => self.sessions.open().await,
        };

        let cancel = self.sessions.begin_turn(&session_id).await?;
        let continuations = self.sessions.continuations(&session_id).await?;

        let dispatch = match self.router.route(text, &continuations, &cancel).await {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Request not routed");
                let turn = Turn::new(text, TurnOutcome::Error(e.to_string()));
                if let Err(err) = self.sessions.record_turn(&session_id, &cancel, turn).await {
                    debug!(session_id = %session_id, error = %err, "Could not record failed turn");
                }
                return Err(e.into());
            }
        };

        let task_ids: Vec<_> = dispatch.tasks.iter().map(|(id, _)| id.clone()).collect();
        if let Err(e) = self.sessions.track_tasks(&session_id, &task_ids).await {
            cancel.cancel();
            return Err(e.into());
        }

        let (output, stream) = AggregatedStream::channel(self.buffer);
        output
            .send(AggregateEvent::Dispatched {
                session_id: session_id.clone(),
                tasks: dispatch.tasks.clone(),
            })
            .await
            .map_err(|_| HostError::Internal("response stream closed".to_string()))?;

        let merged = self.aggregator.aggregate(dispatch.streams);
        tokio::spawn(relay(Relay {
            sessions: self.sessions.clone(),
            session_id,
            request: text.to_string(),
            cancel,
            workers: dispatch.workers,
            merged,
            output,
        }));

        Ok(stream)
    }

    /// Cancels every running turn of the session and waits for its tasks to settle
    pub async fn cancel(&self, session_id: &SessionId) -> SessionResult<()> {
        self.sessions.cancel(session_id).await?;
        if tokio::time::timeout(self.dispatch_timeout, self.sessions.wait_idle(session_id))
            .await
            .is_err()
        {
            warn!(session_id = %session_id, "Cancelled tasks did not settle in time");
        }
        Ok(())
    }

    pub async fn close_session(&self, session_id: &SessionId) -> SessionResult<ConversationState> {
        self.sessions.close(session_id).await
    }

    /// Starts the background idle-session sweeper
    pub fn spawn_eviction(&self) -> JoinHandle<()> {
        self.sessions.clone().spawn_sweeper(self.sweep_interval)
    }

    pub fn shutdown(&self) {
        self.connections.shutdown();
        info!("Host shut down");
    }
}

struct Relay {
    sessions: Arc<SessionTracker>,
    session_id: SessionId,
    request: String,
    cancel: CancelFlag,
    workers: Vec<JoinHandle<DispatchTask>>,
    merged: AggregatedStream,
    output: mpsc::Sender<AggregateEvent>,
}

/// Forwards aggregate events to the caller, then records the turn before
/// releasing the final marker
async fn relay(mut relay: Relay) {
    let mut outcome = None;
    while let Some(event) = relay.merged.next().await {
        if let AggregateEvent::Finished(finished) = event {
            outcome = Some(finished);
            break;
        }
        // The caller may have gone away; the turn still runs to completion.
        let _ = relay.output.send(event).await;
    }

    let mut tasks = Vec::with_capacity(relay.workers.len());
    let mut fault = None;
    for worker in relay.workers {
        match worker.await {
            Ok(task) => tasks.push(task),
            Err(e) => fault = Some(e.to_string()),
        }
    }

    let outcome = match (outcome, fault) {
        (Some(outcome), None) => outcome,
        (_, fault) => {
            relay.cancel.cancel();
            error!(
                session_id = %relay.session_id,
                fault = fault.as_deref().unwrap_or("aggregation ended without a result"),
                "Internal fault while handling request"
            );
            AggregateOutcome::internal(INTERNAL_ERROR)
        }
    };

    for task in tasks.iter().filter(|t| t.status() == TaskStatus::Completed) {
        let recorded = relay
            .sessions
            .record_continuation(&relay.session_id, task.target.clone(), task.remote.clone())
            .await;
        if recorded.is_err() {
            break;
        }
    }

    let turn = Turn::new(relay.request, turn_outcome(&outcome))
        .with_tasks(tasks.iter().map(DispatchTask::summary).collect());
    let recorded = relay
        .sessions
        .record_turn(&relay.session_id, &relay.cancel, turn)
        .await;
    if let Err(e) = recorded {
        debug!(session_id = %relay.session_id, error = %e, "Session gone before turn was recorded");
    }

    let _ = relay.output.send(AggregateEvent::Finished(outcome)).await;
}

fn turn_outcome(outcome: &AggregateOutcome) -> TurnOutcome {
    match outcome {
        AggregateOutcome::Success { .. } => TurnOutcome::Response(outcome.combined_text()),
        AggregateOutcome::PartialSuccess { .. } => TurnOutcome::Degraded(outcome.combined_text()),
        AggregateOutcome::Failure { error, .. } => TurnOutcome::Error(error.to_string()),
    }
}
