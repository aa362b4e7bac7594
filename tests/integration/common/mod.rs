pub mod fake_agent;

use std::sync::Arc;
use std::time::Duration;
use switchboard::adapters::a2a_client::HttpA2aTransport;
use switchboard::config::{RemoteAgentConfig, Settings};
use switchboard::host::Host;
use switchboard::matching::TagMatcher;

pub use fake_agent::{FakeAgent, RunningAgent};

/// Settings pointing at `agents`, with short timeouts for tests
pub fn settings(agents: &[&RunningAgent]) -> Settings {
    let mut settings = Settings::default();
    settings.agents = agents
        .iter()
        .map(|a| RemoteAgentConfig::new(a.base_url.clone()))
        .collect();
    settings.discovery.timeout_ms = 1_000;
    settings.discovery.base_delay_ms = 10;
    settings.dispatch.timeout_ms = 2_000;
    settings.dispatch.max_retries = 1;
    settings.dispatch.retry_base_delay_ms = 10;
    settings
}

/// Host over the real HTTP transport, with startup discovery done
pub async fn start_host(settings: &Settings) -> Arc<Host> {
    let transport = Arc::new(HttpA2aTransport::new(Duration::from_secs(1)));
    let matcher = Arc::new(TagMatcher::new().with_aliases(&settings.matching.aliases));
    let host = Arc::new(Host::new(settings, transport, matcher));
    host.discover().await;
    host
}
