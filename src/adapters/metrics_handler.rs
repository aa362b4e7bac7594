use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub struct MetricsCollector {
    registry: Registry,

    // Dispatch metrics
    pub dispatches_total: CounterVec,
    pub dispatch_duration: HistogramVec,
    pub dispatch_retries: CounterVec,

    // Discovery metrics
    pub discovery_fetches: CounterVec,
    pub discovery_cache_hits: IntCounter,
    pub discovery_fallbacks: IntCounter,

    // Session metrics
    pub active_sessions: Gauge,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let dispatches_total = CounterVec::new(
            Opts::new("switchboard_dispatches_total", "Total dispatched tasks by final status"),
            &["agent", "status"],
        )?;
        registry.register(Box::new(dispatches_total.clone()))?;

        let dispatch_duration = HistogramVec::new(
            HistogramOpts::new(
                "switchboard_dispatch_duration_seconds",
                "Time from dispatch to terminal status",
            ),
            &["agent"],
        )?;
        registry.register(Box::new(dispatch_duration.clone()))?;

        let dispatch_retries = CounterVec::new(
            Opts::new("switchboard_dispatch_retries_total", "Dispatch attempts beyond the first"),
            &["agent"],
        )?;
        registry.register(Box::new(dispatch_retries.clone()))?;

        let discovery_fetches = CounterVec::new(
            Opts::new("switchboard_discovery_fetches_total", "Descriptor fetches by result"),
            &["result"],
        )?;
        registry.register(Box::new(discovery_fetches.clone()))?;

        let discovery_cache_hits = IntCounter::new(
            "switchboard_discovery_cache_hits_total",
            "Resolves answered from the descriptor store",
        )?;
        registry.register(Box::new(discovery_cache_hits.clone()))?;

        let discovery_fallbacks = IntCounter::new(
            "switchboard_discovery_fallbacks_total",
            "Extended descriptor requests that fell back to the public descriptor",
        )?;
        registry.register(Box::new(discovery_fallbacks.clone()))?;

        let active_sessions = Gauge::new(
            "switchboard_active_sessions",
            "Number of conversations currently tracked",
        )?;
        registry.register(Box::new(active_sessions.clone()))?;

        Ok(Self {
            registry,
            dispatches_total,
            dispatch_duration,
            dispatch_retries,
            discovery_fetches,
            discovery_cache_hits,
            discovery_fallbacks,
            active_sessions,
        })
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

pub struct MetricsHandler {
    collector: Arc<MetricsCollector>,
}

impl MetricsHandler {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }

    pub async fn metrics(&self) -> String {
        self.collector.encode().unwrap_or_else(|e| {
            tracing::error!("Failed to encode metrics: {}", e);
            String::from("# Error encoding metrics\n")
        })
    }
}
