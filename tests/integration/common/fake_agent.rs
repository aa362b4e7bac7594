use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard::domain::{AgentDescriptor, CapabilityDescriptor};

/// Scriptable A2A agent served by axum on a random local port
#[derive(Clone)]
pub struct FakeAgent {
    name: String,
    description: String,
    skills: Vec<CapabilityDescriptor>,
    streaming: bool,
    chunks: Vec<String>,
    chunk_delay: Duration,
    hang_after: Option<usize>,
    failure: Option<StatusCode>,
    extended: Option<(String, CapabilityDescriptor)>,
}

/// What a running fake agent has seen
#[derive(Default)]
pub struct Recorded {
    pub card_fetches: AtomicUsize,
    pub extended_fetches: AtomicUsize,
    pub requests: Mutex<Vec<Value>>,
    pub cancels: Mutex<Vec<String>>,
}

impl Recorded {
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }
}

pub struct RunningAgent {
    pub base_url: String,
    pub recorded: Arc<Recorded>,
}

#[derive(Clone)]
struct AgentState {
    agent: Arc<FakeAgent>,
    base_url: String,
    recorded: Arc<Recorded>,
}

impl FakeAgent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: format!("{} agent", name),
            skills: Vec::new(),
            streaming: true,
            chunks: vec![format!("answer from {}", name)],
            chunk_delay: Duration::ZERO,
            hang_after: None,
            failure: None,
            extended: None,
        }
    }

    pub fn with_skill(mut self, id: &str, tags: &[&str]) -> Self {
        self.skills
            .push(CapabilityDescriptor::new(id).with_tags(tags.iter().copied()));
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_chunks(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Stops producing after `n` chunks without ending the stream
    pub fn hang_after(mut self, n: usize) -> Self {
        self.hang_after = Some(n);
        self
    }

    /// Answers every JSON-RPC call with `status`
    pub fn failing_with(mut self, status: StatusCode) -> Self {
        self.failure = Some(status);
        self
    }

    /// Serves an extended card with one more skill to callers presenting `token`
    pub fn with_extended_card(mut self, token: &str, skill: &str, tags: &[&str]) -> Self {
        self.extended = Some((
            token.to_string(),
            CapabilityDescriptor::new(skill).with_tags(tags.iter().copied()),
        ));
        self
    }

    fn card(&self, base_url: &str, extended: bool) -> Value {
        let mut descriptor = AgentDescriptor::new(self.name.clone(), base_url)
            .with_description(self.description.clone())
            .with_streaming(self.streaming)
            .with_extended_card(self.extended.is_some());
        descriptor.skills = self.skills.clone();
        if extended {
            if let Some((_, skill)) = &self.extended {
                descriptor.skills.push(skill.clone());
            }
        }
        serde_json::to_value(descriptor).unwrap()
    }

    pub async fn spawn(self) -> RunningAgent {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let recorded = Arc::new(Recorded::default());

        let state = AgentState {
            agent: Arc::new(self),
            base_url: base_url.clone(),
            recorded: recorded.clone(),
        };
        let app = Router::new()
            .route("/.well-known/agent.json", get(public_card))
            .route("/agent/authenticatedExtendedCard", get(extended_card))
            .route("/", post(json_rpc))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        RunningAgent { base_url, recorded }
    }
}

async fn public_card(State(state): State<AgentState>) -> Json<Value> {
    state.recorded.card_fetches.fetch_add(1, Ordering::SeqCst);
    Json(state.agent.card(&state.base_url, false))
}

async fn extended_card(State(state): State<AgentState>, headers: HeaderMap) -> Response {
    state.recorded.extended_fetches.fetch_add(1, Ordering::SeqCst);
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match (&state.agent.extended, presented) {
        (Some((token, _)), Some(given)) if token == given => {
            Json(state.agent.card(&state.base_url, true)).into_response()
        }
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn json_rpc(State(state): State<AgentState>, Json(request): Json<Value>) -> Response {
    state.recorded.requests.lock().unwrap().push(request.clone());
    if let Some(status) = state.agent.failure {
        return (status, "agent unavailable").into_response();
    }

    let id = request["id"].clone();
    let message = &request["params"]["message"];
    let task_id = message["taskId"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-task", state.agent.name));
    let context_id = message["contextId"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-ctx", state.agent.name));

    match request["method"].as_str() {
        Some("message/send") => {
            let text = state.agent.chunks.join("");
            Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "kind": "task",
                    "id": task_id,
                    "contextId": context_id,
                    "status": { "state": "completed" },
                    "artifacts": [{ "parts": [{ "kind": "text", "text": text }] }]
                }
            }))
            .into_response()
        }
        Some("message/stream") => stream_task(&state.agent, id, task_id, context_id).into_response(),
        Some("tasks/cancel") => {
            let cancelled = request["params"]["id"].as_str().unwrap_or_default().to_string();
            state.recorded.cancels.lock().unwrap().push(cancelled.clone());
            Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "kind": "task", "id": cancelled, "status": { "state": "canceled" } }
            }))
            .into_response()
        }
        _ => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": "Method not found" }
        }))
        .into_response(),
    }
}

fn stream_task(
    agent: &FakeAgent,
    id: Value,
    task_id: String,
    context_id: String,
) -> Sse<BoxStream<'static, Result<Event, Infallible>>> {
    let envelope = move |result: Value| json!({ "jsonrpc": "2.0", "id": id.clone(), "result": result });

    let mut results = vec![json!({
        "kind": "status-update",
        "taskId": task_id,
        "contextId": context_id,
        "status": { "state": "working" },
        "final": false
    })];
    let produced = agent.hang_after.unwrap_or(agent.chunks.len());
    for chunk in agent.chunks.iter().take(produced) {
        results.push(json!({
            "kind": "artifact-update",
            "taskId": task_id,
            "contextId": context_id,
            "artifact": { "parts": [{ "kind": "text", "text": chunk }] }
        }));
    }
    if agent.hang_after.is_none() {
        results.push(json!({
            "kind": "status-update",
            "taskId": task_id,
            "contextId": context_id,
            "status": { "state": "completed" },
            "final": true
        }));
    }

    let delay = agent.chunk_delay;
    let events = stream::iter(results.into_iter().map(envelope)).then(move |payload| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, Infallible>(Event::default().data(payload.to_string()))
    });

    let events = if agent.hang_after.is_some() {
        events.chain(stream::pending()).boxed()
    } else {
        events.boxed()
    };
    Sse::new(events)
}
