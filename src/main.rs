use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchboard::adapters::a2a_client::HttpA2aTransport;
use switchboard::adapters::health_handler::HealthHandler;
use switchboard::adapters::metrics_handler::{MetricsCollector, MetricsHandler};
use switchboard::cli::Cli;
use switchboard::config::Settings;
use switchboard::host::Host;
use switchboard::matching::TagMatcher;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("switchboard=info")),
        )
        .init();

    // Load configuration (CLI > env vars > config file)
    let cli = Cli::parse();
    let settings = Settings::new_with_cli(&cli)?;
    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;

    let metrics = Arc::new(MetricsCollector::new()?);
    let transport = Arc::new(HttpA2aTransport::new(Duration::from_millis(
        settings.discovery.timeout_ms,
    )));
    let matcher = Arc::new(TagMatcher::new().with_aliases(&settings.matching.aliases));
    let host = Arc::new(Host::with_metrics(&settings, transport, matcher, metrics.clone()));

    // Unreachable agents are skipped; they are retried on the next request
    let configured = settings.enabled_agents().count();
    let resolved = host.discover().await;
    if resolved.len() < configured {
        warn!(
            configured,
            resolved = resolved.len(),
            "Some remote agents could not be discovered"
        );
    }
    for agent in host.roster() {
        info!(agent = %agent.name, "{}", agent.description);
    }

    let sweeper = host.spawn_eviction();

    let health_handler = Arc::new(HealthHandler::new(host.store().clone(), configured));
    let metrics_handler = Arc::new(MetricsHandler::new(metrics));
    let app = switchboard::create_app(host.clone(), health_handler, metrics_handler);

    info!("Starting Switchboard on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    sweeper.abort();
    host.shutdown();
    Ok(())
}
