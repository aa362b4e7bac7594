//! Router / dispatcher
//!
//! Turns one user request into dispatch tasks: refreshes stale descriptors,
//! asks the capability matcher for candidates, selects targets, and runs one
//! worker per target concurrently. An address whose refresh failed is left
//! alone for a cooldown so a down agent does not delay every request.

mod dispatch;
mod selection;

pub use dispatch::DispatchPolicy;
pub use selection::select_targets;

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::metrics_handler::MetricsCollector;
use crate::aggregator::{task_channel, TaskStream};
use crate::connection::ConnectionManager;
use crate::discovery::DiscoveryResolver;
use crate::domain::{
    AgentDescriptor, AgentId, CancelFlag, DispatchTask, RemoteRequest, RemoteTaskRef, TaskId,
};
use crate::error::RouterError;
use crate::matching::CapabilityMatcher;
use crate::registry::DescriptorStore;
use dispatch::Worker;

/// Tasks of one routed request, already running
pub struct Dispatch {
    /// Dispatched task ids with their targets, in dispatch order
    pub tasks: Vec<(TaskId, AgentId)>,
    pub streams: Vec<TaskStream>,
    /// Each worker returns its task in a terminal status
    pub workers: Vec<JoinHandle<DispatchTask>>,
}

pub struct Router {
    store: Arc<DescriptorStore>,
    resolver: Arc<DiscoveryResolver>,
    matcher: Arc<dyn CapabilityMatcher>,
    worker: Arc<Worker>,
    addresses: Vec<String>,
    refresh_cooldown: Duration,
    /// Last failed refresh per address
    unavailable: Mutex<HashMap<String, Instant>>,
}

impl Router {
    pub fn new(
        resolver: Arc<DiscoveryResolver>,
        connections: Arc<ConnectionManager>,
        matcher: Arc<dyn CapabilityMatcher>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            store: resolver.store().clone(),
            resolver,
            matcher,
            worker: Arc::new(Worker {
                connections,
                policy,
                metrics: None,
            }),
            addresses: Vec::new(),
            refresh_cooldown: Duration::from_secs(30),
            unavailable: Mutex::new(HashMap::new()),
        }
    }

    /// Addresses whose descriptors are re-resolved when missing from the store
    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }

    /// Wait before retrying an address whose last refresh failed
    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        if let Some(worker) = Arc::get_mut(&mut self.worker) {
            worker.metrics = Some(metrics);
        }
        self
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.worker.policy
    }

    /// Re-resolves configured agents whose descriptor was invalidated,
    /// skipping addresses still in their failure cooldown
    pub async fn refresh_stale(&self) {
        let stale: Vec<&String> = {
            let unavailable = self.unavailable.lock().unwrap_or_else(PoisonError::into_inner);
            self.addresses
                .iter()
                .filter(|address| self.store.get_by_address(address).is_none())
                .filter(|address| {
                    unavailable
                        .get(address.as_str())
                        .map_or(true, |failed| failed.elapsed() >= self.refresh_cooldown)
                })
                .collect()
        };
        if stale.is_empty() {
            return;
        }

        debug!(count = stale.len(), "Refreshing stale agent descriptors");
        let results = join_all(stale.iter().map(|address| self.resolver.resolve(address))).await;

        let mut unavailable = self.unavailable.lock().unwrap_or_else(PoisonError::into_inner);
        for (address, result) in stale.into_iter().zip(results) {
            match result {
                Ok(_) => {
                    unavailable.remove(address);
                }
                Err(e) => {
                    warn!(
                        address = %address,
                        error = %e,
                        retry_in_secs = self.refresh_cooldown.as_secs(),
                        "Agent still unavailable"
                    );
                    unavailable.insert(address.clone(), Instant::now());
                }
            }
        }
    }

    /// Chooses the agents that should handle `text`
    pub async fn select(&self, text: &str) -> Result<Vec<Arc<AgentDescriptor>>, RouterError> {
        let agents = self.store.all();
        let candidates = self.matcher.candidates(text, &agents).await;
        debug!(agents = agents.len(), candidates = candidates.len(), "Matched request");
        select_targets(candidates)
    }

    /// Builds one task per target, continuing remote tasks where the
    /// conversation left one open
    pub fn plan(
        &self,
        text: &str,
        targets: &[Arc<AgentDescriptor>],
        continuations: &HashMap<AgentId, RemoteTaskRef>,
    ) -> Vec<DispatchTask> {
        targets
            .iter()
            .map(|target| {
                let id = target.id();
                let streaming = self.worker.policy.prefer_streaming && target.supports_streaming();
                let request = RemoteRequest::new(text)
                    .continuing(continuations.get(&id))
                    .streaming(streaming);
                DispatchTask::new(id, request)
            })
            .collect()
    }

    /// Starts one worker per task
    pub fn dispatch(&self, tasks: Vec<DispatchTask>, cancel: &CancelFlag) -> Dispatch {
        let mut dispatch = Dispatch {
            tasks: Vec::with_capacity(tasks.len()),
            streams: Vec::with_capacity(tasks.len()),
            workers: Vec::with_capacity(tasks.len()),
        };

        for task in tasks {
            let (sender, stream) = task_channel(
                task.id.clone(),
                task.target.clone(),
                self.worker.policy.channel_buffer,
            );
            dispatch.tasks.push((task.id.clone(), task.target.clone()));
            dispatch.streams.push(stream);
            dispatch
                .workers
                .push(tokio::spawn(self.worker.clone().run(task, sender, cancel.clone())));
        }
        dispatch
    }

    /// Selects targets for `text` and dispatches to all of them
    pub async fn route(
        &self,
        text: &str,
        continuations: &HashMap<AgentId, RemoteTaskRef>,
        cancel: &CancelFlag,
    ) -> Result<Dispatch, RouterError> {
        self.refresh_stale().await;
        let targets = self.select(text).await?;
        let tasks = self.plan(text, &targets, continuations);
        info!(
            targets = ?targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Dispatching request"
        );
        Ok(self.dispatch(tasks, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::in_memory_transport::{InMemoryAgent, InMemoryTransport, Step};
    use crate::aggregator::Aggregator;
    use crate::discovery::RetryPolicy;
    use crate::domain::{
        AggregateEvent, CapabilityDescriptor, RemoteAgentTransport, RemoteTaskState, RemoteUpdate,
        TaskStatus,
    };
    use crate::error::{AggregationError, DispatchError};
    use crate::matching::TagMatcher;
    use std::time::Duration;

    const WEATHER: &str = "http://weather.test";
    const LODGING: &str = "http://lodging.test";

    fn weather() -> AgentDescriptor {
        AgentDescriptor::new("weather", WEATHER)
            .with_streaming(true)
            .with_skill(CapabilityDescriptor::new("forecast").with_tags(["weather"]))
    }

    fn lodging() -> AgentDescriptor {
        AgentDescriptor::new("lodging", LODGING)
            .with_skill(CapabilityDescriptor::new("search").with_tags(["hotel", "lodging"]))
    }

    fn fast_policy() -> DispatchPolicy {
        DispatchPolicy {
            timeout: Duration::from_millis(200),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(5),
            prefer_streaming: true,
            channel_buffer: 16,
            cancel_timeout: Duration::from_millis(50),
        }
    }

    async fn router(transport: Arc<InMemoryTransport>, policy: DispatchPolicy) -> Router {
        let store = Arc::new(DescriptorStore::new());
        let transport: Arc<dyn RemoteAgentTransport> = transport;
        let resolver = Arc::new(DiscoveryResolver::new(
            transport.clone(),
            store.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
                timeout: Duration::from_millis(200),
            },
        ));
        resolver.resolve(WEATHER).await.unwrap();
        resolver.resolve(LODGING).await.unwrap();
        Router::new(
            resolver,
            Arc::new(ConnectionManager::new(store, transport)),
            Arc::new(TagMatcher::new()),
            policy,
        )
        .with_addresses(vec![WEATHER.to_string(), LODGING.to_string()])
    }

    async fn finish(dispatch: Dispatch) -> (Vec<DispatchTask>, Vec<AggregateEvent>) {
        let events = Aggregator::default().aggregate(dispatch.streams).collect().await;
        let mut tasks = Vec::new();
        for worker in dispatch.workers {
            tasks.push(worker.await.unwrap());
        }
        (tasks, events)
    }

    #[tokio::test]
    async fn test_routes_to_both_matching_agents() {
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_agent(
                    WEATHER,
                    InMemoryAgent::new(&weather()).with_script(vec![
                        Step::Update(RemoteUpdate::status(RemoteTaskState::Working).with_text("Checking...")),
                        Step::text("Sunny, 24C"),
                        Step::Update(RemoteUpdate::status(RemoteTaskState::Completed).with_task("w-1", "ctx-w")),
                    ]),
                )
                .with_agent(
                    LODGING,
                    InMemoryAgent::new(&lodging()).with_script(vec![Step::Update(
                        RemoteUpdate::text("Hotel Lutetia").with_task("l-1", "ctx-l").finished(),
                    )]),
                ),
        );
        let router = router(transport.clone(), fast_policy()).await;

        let dispatch = router
            .route("Weather in Paris and a hotel nearby?", &HashMap::new(), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(dispatch.tasks.len(), 2);

        let (tasks, events) = finish(dispatch).await;
        assert!(tasks.iter().all(|t| t.status() == TaskStatus::Completed));

        let weather_task = tasks.iter().find(|t| t.target.as_str() == "weather").unwrap();
        assert!(weather_task.request.streaming);
        assert_eq!(weather_task.remote.task_id, None);
        assert_eq!(weather_task.remote.context_id.as_deref(), Some("ctx-w"));

        let lodging_task = tasks.iter().find(|t| t.target.as_str() == "lodging").unwrap();
        assert!(!lodging_task.request.streaming);

        match events.last().unwrap() {
            AggregateEvent::Finished(outcome) => {
                assert!(outcome.is_success());
                let weather_payload = outcome
                    .payloads()
                    .iter()
                    .find(|p| p.agent.as_str() == "weather")
                    .unwrap();
                assert_eq!(weather_payload.content, "Sunny, 24C");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_candidate() {
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_agent(WEATHER, InMemoryAgent::new(&weather()))
                .with_agent(LODGING, InMemoryAgent::new(&lodging())),
        );
        let router = router(transport, fast_policy()).await;
        let err = router
            .route("Tell me a joke", &HashMap::new(), &CancelFlag::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RouterError::NoCandidateAgent));
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_agent(
                    WEATHER,
                    InMemoryAgent::new(&weather())
                        .failing_with(DispatchError::Transport("reset".into()))
                        .failing_with(DispatchError::Transport("reset".into()))
                        .with_script(vec![Step::Update(RemoteUpdate::text("Sunny").finished())]),
                )
                .with_agent(LODGING, InMemoryAgent::new(&lodging())),
        );
        let router = router(transport.clone(), fast_policy()).await;

        let dispatch = router
            .route("weather?", &HashMap::new(), &CancelFlag::new())
            .await
            .unwrap();
        let (tasks, _) = finish(dispatch).await;
        assert_eq!(tasks[0].status(), TaskStatus::Completed);
        assert_eq!(tasks[0].attempts, 3);
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_agent(
                    WEATHER,
                    InMemoryAgent::new(&weather()).failing_with(DispatchError::Transport("reset".into())),
                )
                .with_agent(LODGING, InMemoryAgent::new(&lodging())),
        );
        let router = router(transport.clone(), fast_policy()).await;

        let dispatch = router
            .route("weather?", &HashMap::new(), &CancelFlag::new())
            .await
            .unwrap();
        let (tasks, events) = finish(dispatch).await;
        assert_eq!(tasks[0].status(), TaskStatus::Failed);
        assert_eq!(tasks[0].attempts, 3);
        assert!(matches!(tasks[0].error(), Some(DispatchError::Transport(_))));
        assert!(matches!(
            events.last(),
            Some(AggregateEvent::Finished(outcome))
                if matches!(outcome.error(), Some(AggregationError::TotalFailure { .. }))
        ));
    }

    #[tokio::test]
    async fn test_stream_closed_early_is_a_failure() {
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_agent(
                    WEATHER,
                    InMemoryAgent::new(&weather()).with_script(vec![
                        Step::Update(RemoteUpdate::status(RemoteTaskState::Working).with_task("w-1", "ctx-w")),
                        Step::text("one "),
                        Step::text("two"),
                    ]),
                )
                .with_agent(LODGING, InMemoryAgent::new(&lodging())),
        );
        let router = router(transport.clone(), fast_policy()).await;

        let dispatch = router
            .route("weather?", &HashMap::new(), &CancelFlag::new())
            .await
            .unwrap();
        let (tasks, events) = finish(dispatch).await;

        assert_eq!(tasks[0].status(), TaskStatus::Failed);
        assert!(matches!(tasks[0].error(), Some(DispatchError::Transport(_))));
        match events.last().unwrap() {
            AggregateEvent::Finished(outcome) => {
                assert!(!outcome.is_success());
                assert!(matches!(outcome.error(), Some(AggregationError::TotalFailure { .. })));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Chunks already reached the caller, so no retry
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_cancel_is_bounded() {
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_cancel_delay(Duration::from_secs(10))
                .with_agent(
                    WEATHER,
                    InMemoryAgent::new(&weather()).with_script(vec![
                        Step::Update(RemoteUpdate::status(RemoteTaskState::Working).with_task("w-1", "ctx-w")),
                        Step::Hang,
                    ]),
                )
                .with_agent(LODGING, InMemoryAgent::new(&lodging())),
        );
        let policy = DispatchPolicy {
            timeout: Duration::from_secs(5),
            ..fast_policy()
        };
        let router = router(transport.clone(), policy).await;
        let cancel = CancelFlag::new();

        let mut dispatch = router.route("weather?", &HashMap::new(), &cancel).await.unwrap();
        let worker = dispatch.workers.remove(0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let task = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(transport.cancelled(), vec![(WEATHER.to_string(), "w-1".to_string())]);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_agent(
                    WEATHER,
                    InMemoryAgent::new(&weather()).with_script(vec![Step::Update(
                        RemoteUpdate::status(RemoteTaskState::Rejected).with_text("unsupported city"),
                    )]),
                )
                .with_agent(LODGING, InMemoryAgent::new(&lodging())),
        );
        let router = router(transport.clone(), fast_policy()).await;

        let dispatch = router
            .route("weather?", &HashMap::new(), &CancelFlag::new())
            .await
            .unwrap();
        let (tasks, _) = finish(dispatch).await;
        match tasks[0].error() {
            Some(DispatchError::Rejected(reason)) => assert_eq!(reason, "unsupported city"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_input_required_keeps_remote_task_for_next_turn() {
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_agent(WEATHER, InMemoryAgent::new(&weather()))
                .with_agent(
                    LODGING,
                    InMemoryAgent::new(&lodging()).with_script(vec![Step::Update(
                        RemoteUpdate::status(RemoteTaskState::InputRequired)
                            .with_task("l-7", "ctx-7")
                            .with_text("Which dates?"),
                    )]),
                ),
        );
        let router = router(transport.clone(), fast_policy()).await;

        let dispatch = router
            .route("Find a hotel", &HashMap::new(), &CancelFlag::new())
            .await
            .unwrap();
        let (tasks, _) = finish(dispatch).await;
        let task = &tasks[0];
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(task.awaiting_input);
        assert_eq!(task.remote.task_id.as_deref(), Some("l-7"));

        let continuations = HashMap::from([(task.target.clone(), task.remote.clone())]);
        let dispatch = router
            .route("June 3 to 5, hotel please", &continuations, &CancelFlag::new())
            .await
            .unwrap();
        finish(dispatch).await;

        let (_, second) = transport.sent().pop().unwrap();
        assert_eq!(second.task_id.as_deref(), Some("l-7"));
        assert_eq!(second.context_id.as_deref(), Some("ctx-7"));
    }

    #[tokio::test]
    async fn test_cancelled_before_acquire() {
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_agent(WEATHER, InMemoryAgent::new(&weather()))
                .with_agent(LODGING, InMemoryAgent::new(&lodging())),
        );
        let router = router(transport.clone(), fast_policy()).await;
        let cancel = CancelFlag::new();
        cancel.cancel();

        let dispatch = router.route("weather?", &HashMap::new(), &cancel).await.unwrap();
        let (tasks, _) = finish(dispatch).await;
        assert_eq!(tasks[0].status(), TaskStatus::Cancelled);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stale_descriptor_is_refreshed() {
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_agent(WEATHER, InMemoryAgent::new(&weather()))
                .with_agent(LODGING, InMemoryAgent::new(&lodging())),
        );
        let router = router(transport.clone(), fast_policy()).await;
        assert_eq!(transport.card_fetches(), 2);

        router.store.invalidate(&AgentId::from("weather"));
        router.refresh_stale().await;
        assert_eq!(transport.card_fetches(), 3);
        assert!(router.store.get(&AgentId::from("weather")).is_some());

        router.refresh_stale().await;
        assert_eq!(transport.card_fetches(), 3);
    }

    #[tokio::test]
    async fn test_down_agent_is_not_refreshed_during_cooldown() {
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_agent(WEATHER, InMemoryAgent::new(&weather()))
                .with_agent(LODGING, InMemoryAgent::new(&lodging())),
        );
        let router = router(transport.clone(), fast_policy())
            .await
            .with_addresses(vec![WEATHER.to_string(), "http://down.test".to_string()])
            .with_refresh_cooldown(Duration::from_secs(60));
        assert_eq!(transport.card_fetches(), 2);

        router.refresh_stale().await;
        assert_eq!(transport.card_fetches(), 5);

        let started = std::time::Instant::now();
        let dispatch = router
            .route("weather?", &HashMap::new(), &CancelFlag::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(transport.card_fetches(), 5);
        finish(dispatch).await;
    }

    #[tokio::test]
    async fn test_down_agent_is_retried_after_cooldown() {
        const CONCIERGE: &str = "http://concierge.test";
        let transport = Arc::new(
            InMemoryTransport::new()
                .with_agent(WEATHER, InMemoryAgent::new(&weather()))
                .with_agent(LODGING, InMemoryAgent::new(&lodging())),
        );
        let router = router(transport.clone(), fast_policy())
            .await
            .with_addresses(vec![WEATHER.to_string(), CONCIERGE.to_string()])
            .with_refresh_cooldown(Duration::from_millis(100));

        router.refresh_stale().await;
        assert_eq!(transport.card_fetches(), 5);

        transport.register(CONCIERGE, InMemoryAgent::new(&AgentDescriptor::new("concierge", CONCIERGE)));
        router.refresh_stale().await;
        assert_eq!(transport.card_fetches(), 5);

        tokio::time::sleep(Duration::from_millis(120)).await;
        router.refresh_stale().await;
        assert_eq!(transport.card_fetches(), 6);
        assert!(router.store.get(&AgentId::from("concierge")).is_some());
    }
}
