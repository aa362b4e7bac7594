use super::common::{self, FakeAgent};

use secrecy::SecretString;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use switchboard::adapters::a2a_client::HttpA2aTransport;
use switchboard::discovery::{DiscoveryEvent, DiscoveryResolver, RetryPolicy};
use switchboard::domain::TrustTier;
use switchboard::error::DiscoveryError;
use switchboard::registry::DescriptorStore;

fn resolver() -> DiscoveryResolver {
    DiscoveryResolver::new(
        Arc::new(HttpA2aTransport::new(Duration::from_secs(1))),
        Arc::new(DescriptorStore::new()),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            timeout: Duration::from_millis(500),
        },
    )
}

#[tokio::test]
async fn test_resolve_twice_fetches_once() {
    let agent = FakeAgent::new("weather")
        .with_skill("forecast", &["weather"])
        .spawn()
        .await;
    let resolver = resolver();

    let first = resolver.resolve(&agent.base_url).await.unwrap();
    let second = resolver.resolve(&agent.base_url).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.url, agent.base_url);
    assert_eq!(agent.recorded.card_fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_refresh_fetches_again() {
    let agent = FakeAgent::new("weather")
        .with_skill("forecast", &["weather"])
        .spawn()
        .await;
    let resolver = resolver();

    resolver.resolve(&agent.base_url).await.unwrap();
    resolver.refresh(&agent.base_url).await.unwrap();

    assert_eq!(agent.recorded.card_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unreachable_agent() {
    // Nothing listens on port 9 of the loopback interface
    let err = resolver().resolve("http://127.0.0.1:9").await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Unreachable { .. }));
}

#[tokio::test]
async fn test_extended_card_with_valid_credential() {
    let agent = FakeAgent::new("lodging")
        .with_skill("search", &["hotel"])
        .with_extended_card("s3cret", "book", &["booking"])
        .spawn()
        .await;
    let resolver = resolver().with_credential(&agent.base_url, SecretString::from("s3cret"));

    let descriptor = resolver.resolve(&agent.base_url).await.unwrap();

    assert_eq!(descriptor.trust, TrustTier::AuthenticatedExtended);
    assert!(descriptor.tags().contains("booking"));
    assert_eq!(agent.recorded.extended_fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_credential_falls_back_to_public_card() {
    let agent = FakeAgent::new("lodging")
        .with_skill("search", &["hotel"])
        .with_extended_card("s3cret", "book", &["booking"])
        .spawn()
        .await;
    let resolver = resolver().with_credential(&agent.base_url, SecretString::from("wrong"));
    let mut events = resolver.subscribe();

    let descriptor = resolver.resolve(&agent.base_url).await.unwrap();

    assert_eq!(descriptor.trust, TrustTier::Public);
    assert!(!descriptor.tags().contains("booking"));
    assert!(matches!(
        events.recv().await.unwrap(),
        DiscoveryEvent::ExtendedCardFallback { .. }
    ));
    assert!(matches!(events.recv().await.unwrap(), DiscoveryEvent::Resolved { .. }));
}

#[tokio::test]
async fn test_startup_discovery_skips_unreachable_agents() {
    let weather = FakeAgent::new("weather")
        .with_skill("forecast", &["weather"])
        .spawn()
        .await;
    let mut settings = common::settings(&[&weather]);
    settings
        .agents
        .push(switchboard::config::RemoteAgentConfig::new("http://127.0.0.1:9"));

    let host = common::start_host(&settings).await;

    let roster = host.roster();
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].name, "weather");
}
