//! Prometheus metrics for graph resolution and template execution

use crate::cache::CacheStats;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Instant;

/// Metric handles registered on a private registry
///
/// Attach to a [`crate::context::ContextEnv`] with `with_metrics`; nodes
/// record into it when present and skip recording otherwise.
pub struct ContextMetrics {
    registry: Registry,

    // Counters
    pub remote_fetches: IntCounter,
    pub submissions_success: IntCounter,
    pub submissions_failed: IntCounter,
    pub simulations: IntCounter,
    pub chain_steps: IntCounter,
    pub errors: IntCounterVec,

    // Gauges mirrored from the dedup cache
    pub cache_hits: IntGauge,
    pub cache_misses: IntGauge,
    pub cache_coalesced: IntGauge,
    pub cache_entries: IntGauge,

    // Histograms
    pub assemble_latency: Histogram,
    pub execute_latency: Histogram,
}

impl std::fmt::Debug for ContextMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextMetrics")
            .field("remote_fetches", &self.remote_fetches.get())
            .field("submissions_success", &self.submissions_success.get())
            .field("submissions_failed", &self.submissions_failed.get())
            .finish_non_exhaustive()
    }
}

impl ContextMetrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let remote_fetches = IntCounter::with_opts(Opts::new(
            "ledger_ctx_remote_fetches_total",
            "Account reads that reached the remote reader",
        ))?;

        let submissions_success = IntCounter::with_opts(Opts::new(
            "ledger_ctx_submissions_success_total",
            "Submissions confirmed successfully",
        ))?;

        let submissions_failed = IntCounter::with_opts(Opts::new(
            "ledger_ctx_submissions_failed_total",
            "Submissions rejected by the ledger",
        ))?;

        let simulations = IntCounter::with_opts(Opts::new(
            "ledger_ctx_simulations_total",
            "Simulations requested",
        ))?;

        let chain_steps = IntCounter::with_opts(Opts::new(
            "ledger_ctx_chain_steps_total",
            "Submissions performed by chained executions",
        ))?;

        let errors = IntCounterVec::new(
            Opts::new("ledger_ctx_errors_total", "Errors by category"),
            &["category"],
        )?;

        let cache_hits = IntGauge::with_opts(Opts::new(
            "ledger_ctx_cache_hits",
            "Calls answered from a settled cache entry",
        ))?;

        let cache_misses = IntGauge::with_opts(Opts::new(
            "ledger_ctx_cache_misses",
            "Calls that started a producer",
        ))?;

        let cache_coalesced = IntGauge::with_opts(Opts::new(
            "ledger_ctx_cache_coalesced",
            "Calls that joined an in-flight producer",
        ))?;

        let cache_entries =
            IntGauge::with_opts(Opts::new("ledger_ctx_cache_entries", "Cache entries stored"))?;

        let assemble_latency = Histogram::with_opts(
            HistogramOpts::new("ledger_ctx_assemble_latency_seconds", "Bundle assembly latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        let execute_latency = Histogram::with_opts(
            HistogramOpts::new("ledger_ctx_execute_latency_seconds", "Execute call latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        )?;

        registry.register(Box::new(remote_fetches.clone()))?;
        registry.register(Box::new(submissions_success.clone()))?;
        registry.register(Box::new(submissions_failed.clone()))?;
        registry.register(Box::new(simulations.clone()))?;
        registry.register(Box::new(chain_steps.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_coalesced.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(assemble_latency.clone()))?;
        registry.register(Box::new(execute_latency.clone()))?;

        Ok(Self {
            registry,
            remote_fetches,
            submissions_success,
            submissions_failed,
            simulations,
            chain_steps,
            errors,
            cache_hits,
            cache_misses,
            cache_coalesced,
            cache_entries,
            assemble_latency,
            execute_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_error(&self, category: &str) {
        self.errors.with_label_values(&[category]).inc();
    }

    /// Mirror a cache snapshot into the gauges
    pub fn observe_cache(&self, stats: &CacheStats) {
        self.cache_hits.set(stats.hits as i64);
        self.cache_misses.set(stats.misses as i64);
        self.cache_coalesced.set(stats.coalesced as i64);
        self.cache_entries.set(stats.entries as i64);
    }

    /// Render the registry in the text exposition format
    pub fn gather_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
