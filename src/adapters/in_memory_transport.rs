//! In-process remote agent transport
//!
//! Serves scripted agents without any network I/O. Each agent has a descriptor
//! and a queue of scripts; every `send` consumes the next script, and the last
//! one is reused once the queue runs dry.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::domain::{AgentDescriptor, RemoteAgentTransport, RemoteRequest, RemoteStream, RemoteUpdate};
use crate::error::{DiscoveryError, DiscoveryResult, DispatchError, DispatchResult};
use crate::registry::normalize_address;

/// One step of a scripted reply
#[derive(Debug, Clone)]
pub enum Step {
    Update(RemoteUpdate),
    Error(DispatchError),
    Delay(Duration),
    /// Never produce anything else
    Hang,
}

impl Step {
    pub fn text(text: impl Into<String>) -> Self {
        Step::Update(RemoteUpdate::text(text))
    }
}

/// Outcome of one `send`: either a reply stream or a submission failure
pub type Script = Result<Vec<Step>, DispatchError>;

pub struct InMemoryAgent {
    card: Value,
    extended: Option<(String, Value)>,
    scripts: VecDeque<Script>,
}

impl InMemoryAgent {
    pub fn new(descriptor: &AgentDescriptor) -> Self {
        Self::from_card(serde_json::to_value(descriptor).unwrap_or(Value::Null))
    }

    /// Agent serving a raw card, which may be invalid
    pub fn from_card(card: Value) -> Self {
        Self {
            card,
            extended: None,
            scripts: VecDeque::new(),
        }
    }

    pub fn with_extended_card(mut self, credential: impl Into<String>, descriptor: &AgentDescriptor) -> Self {
        let card = serde_json::to_value(descriptor).unwrap_or(Value::Null);
        self.extended = Some((credential.into(), card));
        self
    }

    pub fn with_script(mut self, steps: Vec<Step>) -> Self {
        self.scripts.push_back(Ok(steps));
        self
    }

    pub fn failing_with(mut self, error: DispatchError) -> Self {
        self.scripts.push_back(Err(error));
        self
    }

    fn next_script(&mut self) -> Script {
        if self.scripts.len() > 1 {
            self.scripts.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        } else {
            self.scripts.front().cloned().unwrap_or_else(|| Ok(Vec::new()))
        }
    }
}

/// Transport backed by in-process scripted agents
#[derive(Default)]
pub struct InMemoryTransport {
    agents: RwLock<HashMap<String, Mutex<InMemoryAgent>>>,
    sent: Mutex<Vec<(String, RemoteRequest)>>,
    cancelled: Mutex<Vec<(String, String)>>,
    card_fetches: AtomicU32,
    cancel_delay: Option<Duration>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: &str, agent: InMemoryAgent) {
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize_address(address), Mutex::new(agent));
    }

    pub fn with_agent(self, address: &str, agent: InMemoryAgent) -> Self {
        self.register(address, agent);
        self
    }

    /// Makes every remote cancel take `delay` to answer
    pub fn with_cancel_delay(mut self, delay: Duration) -> Self {
        self.cancel_delay = Some(delay);
        self
    }

    /// Requests submitted so far, with their target address
    pub fn sent(&self) -> Vec<(String, RemoteRequest)> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Remote task ids cancelled so far, with their address
    pub fn cancelled(&self) -> Vec<(String, String)> {
        self.cancelled.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn card_fetches(&self) -> u32 {
        self.card_fetches.load(Ordering::SeqCst)
    }
}

fn play(steps: Vec<Step>) -> RemoteStream {
    let stream = futures::stream::unfold(steps.into_iter(), |mut steps| async move {
        loop {
            match steps.next()? {
                Step::Delay(period) => tokio::time::sleep(period).await,
                Step::Hang => std::future::pending::<()>().await,
                Step::Update(update) => return Some((Ok(update), steps)),
                Step::Error(error) => return Some((Err(error), steps)),
            }
        }
    });
    Box::pin(stream)
}

#[async_trait]
impl RemoteAgentTransport for InMemoryTransport {
    async fn fetch_card(&self, address: &str) -> DiscoveryResult<Value> {
        self.card_fetches.fetch_add(1, Ordering::SeqCst);
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        let agent = agents
            .get(&normalize_address(address))
            .ok_or_else(|| DiscoveryError::Unreachable {
                address: address.to_string(),
                reason: "no agent at this address".to_string(),
            })?;
        let card = agent.lock().unwrap_or_else(PoisonError::into_inner).card.clone();
        Ok(card)
    }

    async fn fetch_extended_card(
        &self,
        address: &str,
        credential: &SecretString,
    ) -> DiscoveryResult<Value> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        let extended = agents
            .get(&normalize_address(address))
            .and_then(|agent| agent.lock().unwrap_or_else(PoisonError::into_inner).extended.clone());

        match extended {
            Some((expected, card)) if expected == credential.expose_secret() => Ok(card),
            _ => Err(DiscoveryError::Unauthorized {
                address: address.to_string(),
                reason: "credential refused".to_string(),
            }),
        }
    }

    async fn send(&self, address: &str, request: &RemoteRequest) -> DispatchResult<RemoteStream> {
        let address = normalize_address(address);
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((address.clone(), request.clone()));

        let script = {
            let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
            let agent = agents
                .get(&address)
                .ok_or_else(|| DispatchError::Transport(format!("connection refused: {}", address)))?;
            let script = agent.lock().unwrap_or_else(PoisonError::into_inner).next_script();
            script
        };
        Ok(play(script?))
    }

    async fn cancel(&self, address: &str, remote_task_id: &str) -> DispatchResult<()> {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((normalize_address(address), remote_task_id.to_string()));
        if let Some(delay) = self.cancel_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
