//! Discovery resolver
//!
//! Fetches agent descriptors from remote addresses, validates them and stores
//! them in the [`DescriptorStore`]. Public descriptor fetches are retried with
//! exponential backoff; the authenticated extended descriptor is attempted once
//! and falls back to the public one when the credential is missing or refused.

use backoff::ExponentialBackoffBuilder;
use futures::future::join_all;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adapters::metrics_handler::MetricsCollector;
use crate::domain::{AgentDescriptor, AgentId, RemoteAgentTransport, TrustTier};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::registry::{normalize_address, DescriptorStore};

/// Retry and timeout settings for descriptor fetches
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards
    pub base_delay: Duration,
    /// Bound on each individual fetch
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Observable discovery outcomes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    Resolved {
        agent: AgentId,
        address: String,
        trust: TrustTier,
    },
    /// Extended descriptor unavailable; the public one was used instead
    ExtendedCardFallback { address: String, reason: String },
    Failed { address: String, error: String },
}

pub struct DiscoveryResolver {
    transport: Arc<dyn RemoteAgentTransport>,
    store: Arc<DescriptorStore>,
    policy: RetryPolicy,
    credentials: HashMap<String, SecretString>,
    events: broadcast::Sender<DiscoveryEvent>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl DiscoveryResolver {
    pub fn new(
        transport: Arc<dyn RemoteAgentTransport>,
        store: Arc<DescriptorStore>,
        policy: RetryPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            transport,
            store,
            policy,
            credentials: HashMap::new(),
            events,
            metrics: None,
        }
    }

    /// Registers the bearer credential used for the extended descriptor at `address`
    pub fn with_credential(mut self, address: &str, credential: SecretString) -> Self {
        self.credentials.insert(normalize_address(address), credential);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Receiver for discovery events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<DescriptorStore> {
        &self.store
    }

    /// Resolve `address`, using its configured credential if any
    pub async fn resolve(&self, address: &str) -> DiscoveryResult<Arc<AgentDescriptor>> {
        let credential = self.credentials.get(&normalize_address(address));
        self.resolve_authenticated(address, credential).await
    }

    /// Resolve `address`, trying the extended descriptor with `credential`.
    ///
    /// A stored descriptor is returned without any network call.
    pub async fn resolve_authenticated(
        &self,
        address: &str,
        credential: Option<&SecretString>,
    ) -> DiscoveryResult<Arc<AgentDescriptor>> {
        if let Some(cached) = self.store.get_by_address(address) {
            debug!(address = %address, agent = %cached.name, "Descriptor served from store");
            if let Some(metrics) = &self.metrics {
                metrics.discovery_cache_hits.inc();
            }
            return Ok(cached);
        }

        let result = self.fetch_and_validate(address, credential).await;
        match result {
            Ok(descriptor) => {
                let trust = descriptor.trust;
                let descriptor = self.store.upsert(address, descriptor);
                info!(
                    address = %address,
                    agent = %descriptor.name,
                    skills = descriptor.skills.len(),
                    "Agent discovered"
                );
                self.record_fetch("ok");
                self.emit(DiscoveryEvent::Resolved {
                    agent: descriptor.id(),
                    address: normalize_address(address),
                    trust,
                });
                Ok(descriptor)
            }
            Err(err) => {
                self.record_fetch(match &err {
                    DiscoveryError::Unreachable { .. } => "unreachable",
                    DiscoveryError::Malformed { .. } => "malformed",
                    DiscoveryError::Unauthorized { .. } => "unauthorized",
                });
                self.emit(DiscoveryEvent::Failed {
                    address: normalize_address(address),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Drops any stored descriptor for `address` and fetches it again
    pub async fn refresh(&self, address: &str) -> DiscoveryResult<Arc<AgentDescriptor>> {
        self.store.invalidate_address(address);
        self.resolve(address).await
    }

    /// Resolves every address concurrently; failures are logged and skipped
    pub async fn resolve_all(&self, addresses: &[String]) -> Vec<Arc<AgentDescriptor>> {
        let results = join_all(addresses.iter().map(|address| self.resolve(address))).await;

        addresses
            .iter()
            .zip(results)
            .filter_map(|(address, result)| match result {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    warn!(address = %address, error = %e, "Skipping agent that failed discovery");
                    None
                }
            })
            .collect()
    }

    async fn fetch_and_validate(
        &self,
        address: &str,
        credential: Option<&SecretString>,
    ) -> DiscoveryResult<AgentDescriptor> {
        let card = self.fetch_public_card(address).await?;
        let mut descriptor = AgentDescriptor::from_card(address, card)?;
        fill_url(&mut descriptor, address);

        if !descriptor.supports_authenticated_extended_card {
            return Ok(descriptor);
        }

        let Some(credential) = credential else {
            self.fall_back(address, "no credential configured");
            return Ok(descriptor);
        };

        match self.fetch_extended_card(address, credential).await {
            Ok(mut extended) => {
                fill_url(&mut extended, address);
                extended.trust = TrustTier::AuthenticatedExtended;
                Ok(extended)
            }
            Err(e) => {
                self.fall_back(address, &e.to_string());
                Ok(descriptor)
            }
        }
    }

    async fn fetch_public_card(&self, address: &str) -> DiscoveryResult<Value> {
        let attempts = AtomicU32::new(0);
        let schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.policy.base_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        let attempts = &attempts;
        backoff::future::retry(schedule, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(address = %address, attempt, "Fetching public descriptor");

            let result = match timeout(self.policy.timeout, self.transport.fetch_card(address)).await {
                Ok(result) => result,
                Err(_) => Err(DiscoveryError::Unreachable {
                    address: address.to_string(),
                    reason: format!("no answer within {}ms", self.policy.timeout.as_millis()),
                }),
            };

            result.map_err(|err| {
                if err.is_retryable() && attempt < self.policy.max_attempts {
                    debug!(address = %address, attempt, error = %err, "Descriptor fetch failed, retrying");
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        })
        .await
    }

    async fn fetch_extended_card(
        &self,
        address: &str,
        credential: &SecretString,
    ) -> DiscoveryResult<AgentDescriptor> {
        let card = timeout(
            self.policy.timeout,
            self.transport.fetch_extended_card(address, credential),
        )
        .await
        .map_err(|_| DiscoveryError::Unreachable {
            address: address.to_string(),
            reason: "extended descriptor fetch timed out".to_string(),
        })??;
        AgentDescriptor::from_card(address, card)
    }

    fn fall_back(&self, address: &str, reason: &str) {
        warn!(
            address = %address,
            reason = %reason,
            "Extended descriptor unavailable, using public descriptor"
        );
        if let Some(metrics) = &self.metrics {
            metrics.discovery_fallbacks.inc();
        }
        self.emit(DiscoveryEvent::ExtendedCardFallback {
            address: normalize_address(address),
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn record_fetch(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.discovery_fetches.with_label_values(&[result]).inc();
        }
    }
}

fn fill_url(descriptor: &mut AgentDescriptor, address: &str) {
    if descriptor.url.trim().is_empty() {
        descriptor.url = normalize_address(address);
    }
}
