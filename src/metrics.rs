use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

use crate::events::{AdmissionEvent, EventSink};

/// Metrics collector for the admission engine
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    decisions: CounterVec,
    events: CounterVec,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: HistogramVec,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new(
                "admission_decisions_total",
                "Admission decisions by outcome",
            ),
            &["outcome"],
        )?;

        let events = CounterVec::new(
            Opts::new(
                "admission_events_total",
                "Reject and degraded events emitted to the observability sink",
            ),
            &["kind"],
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "admission_store_operations_total",
                "Bucket store operations by backend and result",
            ),
            &["backend", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "admission_store_operation_duration_seconds",
                "Duration of bucket store operations in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1]),
            &["backend"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;

        Ok(Self {
            registry,
            decisions,
            events,
            store_operations,
            store_operation_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a decision outcome (`bypass`, `allow`, `reject`, `degraded`)
    pub fn record_decision(&self, outcome: &str) {
        self.decisions.with_label_values(&[outcome]).inc();
    }

    /// Record a store operation and how long it took
    pub fn record_store_operation(&self, backend: &str, result: &str, duration_seconds: f64) {
        self.store_operations
            .with_label_values(&[backend, result])
            .inc();
        self.store_operation_duration
            .with_label_values(&[backend])
            .observe(duration_seconds);
    }

    pub fn decision_count(&self, outcome: &str) -> f64 {
        self.decisions.with_label_values(&[outcome]).get()
    }
}

impl EventSink for Metrics {
    fn emit(&self, event: &AdmissionEvent) {
        self.events.with_label_values(&[event.kind.as_str()]).inc();
    }
}
