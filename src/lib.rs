//! # Switchboard - A2A Host Coordinator
//!
//! Switchboard accepts a user request, works out which remote agents can
//! handle it, forwards it to all of them concurrently and streams back one
//! aggregated answer.
//!
//! ## Features
//!
//! - **Discovery**: agent cards fetched over A2A, cached, optionally upgraded to
//!   the authenticated extended card
//! - **Routing**: pluggable capability matching, tie-aware target selection,
//!   bounded retries with backoff
//! - **Aggregation**: per-task ordered chunks, one terminal marker per task and
//!   one for the whole request, partial and total failure reporting
//! - **Sessions**: turn history, remote task continuation, cancellation, idle
//!   eviction
//! - **Metrics**: Prometheus metrics for monitoring
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use switchboard::adapters::a2a_client::HttpA2aTransport;
//! use switchboard::config::Settings;
//! use switchboard::host::Host;
//! use switchboard::matching::TagMatcher;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::new()?;
//!     let transport = Arc::new(HttpA2aTransport::new(Duration::from_secs(5)));
//!     let host = Host::new(&settings, transport, Arc::new(TagMatcher::new()));
//!     host.discover().await;
//!
//!     let outcome = host
//!         .handle_user_message(None, "What's the weather in Paris?")
//!         .await?
//!         .outcome()
//!         .await;
//!     println!("{}", outcome.combined_text());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Domain**: descriptors, tasks, responses, sessions and the transport port
//! - **Components**: registry, discovery, connection, router, aggregator, session
//! - **Host**: the inbound entry point wiring the components together
//! - **Adapters**: HTTP transport, inbound API, health and metrics

pub mod adapters;
pub mod aggregator;
pub mod cli;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod host;
pub mod matching;
pub mod registry;
pub mod router;
pub mod session;

use crate::adapters::health_handler::HealthHandler;
use crate::adapters::http_api::{self, ApiState};
use crate::adapters::metrics_handler::MetricsHandler;
use crate::host::Host;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Creates the Axum application router with all endpoints configured.
pub fn create_app(
    host: Arc<Host>,
    health_handler: Arc<HealthHandler>,
    metrics_handler: Arc<MetricsHandler>,
) -> Router {
    let health_router = Router::new()
        .route("/health", get({
            let handler = health_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.health().await }
            }
        }))
        .route("/health/ready", get({
            let handler = health_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.ready().await }
            }
        }))
        .route("/health/live", get({
            let handler = health_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.live().await }
            }
        }))
        .route("/metrics", get({
            let handler = metrics_handler.clone();
            move || {
                let h = handler.clone();
                async move { h.metrics().await }
            }
        }));

    let api_router = Router::new()
        .route("/messages", post(http_api::post_message))
        .route("/sessions", post(http_api::open_session))
        .route(
            "/sessions/:id",
            get(http_api::get_session).delete(http_api::close_session),
        )
        .route("/sessions/:id/cancel", post(http_api::cancel_session))
        .route("/agents", get(http_api::list_agents))
        .with_state(ApiState { host });

    health_router.nest("/api", api_router).layer(
        tower_http::cors::CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    )
}
