//! Per-request admission decisions.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::{
    bypass::{BypassPolicy, NoBypass},
    config::QuotaConfig,
    error::StoreUnavailable,
    events::{AdmissionEvent, EventKind, EventSink, TracingSink},
    key::{BucketKey, Identity, RateKeyScheme},
    metrics::Metrics,
    store::{BucketConsumption, BucketStore},
    utils::{ceil_secs, SystemTimeSource, TimeSource},
};

/// Default bound on the single store round trip
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// Outcome of one `evaluate` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Identity is exempt; the store was not touched.
    Bypass,
    Allow {
        remaining: u32,
        reset_after_secs: u64,
    },
    /// The bucket was already empty before this call.
    Reject { retry_after_secs: u64 },
    /// The store failed or timed out and the request was admitted anyway.
    AllowDegraded { reason: String },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Decision::Reject { .. })
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            Decision::Bypass => "bypass",
            Decision::Allow { .. } => "allow",
            Decision::Reject { .. } => "reject",
            Decision::AllowDegraded { .. } => "degraded",
        }
    }
}

/// Stateless admission engine.
///
/// Every call is an independent transaction of at most one store round trip.
/// Store failures are never retried and never returned: the request fails open.
pub struct AdmissionEngine {
    store: Arc<dyn BucketStore>,
    bypass: Arc<dyn BypassPolicy>,
    sink: Arc<dyn EventSink>,
    keys: RateKeyScheme,
    time_source: Arc<dyn TimeSource>,
    store_timeout: Duration,
    grace: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl AdmissionEngine {
    /// Engine with no exemptions, tracing-only events and the system clock
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self {
            store,
            bypass: Arc::new(NoBypass),
            sink: Arc::new(TracingSink),
            keys: RateKeyScheme::default(),
            time_source: Arc::new(SystemTimeSource),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            grace: Duration::ZERO,
            metrics: None,
        }
    }

    pub fn with_bypass(mut self, bypass: Arc<dyn BypassPolicy>) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_key_scheme(mut self, keys: RateKeyScheme) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Extra lifetime given to bucket records beyond the window length
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn time_source(&self) -> &dyn TimeSource {
        self.time_source.as_ref()
    }

    /// Decide whether `identity` may proceed under `quota`
    pub async fn evaluate(&self, identity: &Identity, quota: &QuotaConfig) -> Decision {
        let decision = self.decide(identity, quota).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_decision(decision.outcome());
        }
        debug!(identity = %identity, outcome = decision.outcome(), ?decision, "admission decision");

        decision
    }

    async fn decide(&self, identity: &Identity, quota: &QuotaConfig) -> Decision {
        if self.bypass.is_exempt(identity) {
            return Decision::Bypass;
        }

        let key = self
            .keys
            .key(identity, self.time_source.unix_now(), quota.window_seconds);
        let ttl = quota.window() + self.grace;

        match self.consume(&key, quota.limit, ttl).await {
            Ok(consumption) if consumption.token_taken() => Decision::Allow {
                remaining: consumption.remaining,
                reset_after_secs: ceil_secs(consumption.ttl),
            },
            Ok(consumption) => {
                let retry_after_secs = ceil_secs(consumption.ttl);
                self.emit(
                    identity,
                    EventKind::Rejected,
                    format!("quota of {} exhausted for window {}", quota.limit, key.window_index()),
                );
                Decision::Reject { retry_after_secs }
            }
            Err(err) => {
                warn!(
                    identity = %identity,
                    key = %key,
                    backend = self.store.name(),
                    error = %err,
                    "bucket store unavailable, failing open"
                );
                let reason = err.to_string();
                self.emit(identity, EventKind::Degraded, reason.clone());
                Decision::AllowDegraded { reason }
            }
        }
    }

    async fn consume(
        &self,
        key: &BucketKey,
        limit: u32,
        ttl: Duration,
    ) -> Result<BucketConsumption, StoreUnavailable> {
        let started = Instant::now();
        let result =
            match tokio::time::timeout(self.store_timeout, self.store.consume(key, limit, ttl))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreUnavailable::Timeout(self.store_timeout)),
            };

        if let Some(metrics) = &self.metrics {
            let label = match &result {
                Ok(_) => "ok",
                Err(err) => err.kind(),
            };
            metrics.record_store_operation(
                self.store.name(),
                label,
                started.elapsed().as_secs_f64(),
            );
        }

        result
    }

    fn emit(&self, identity: &Identity, kind: EventKind, reason: String) {
        let event = AdmissionEvent::new(identity, self.time_source.utc_now(), kind, reason);
        self.sink.emit(&event);
    }

    /// Health of the underlying store; never consulted on the request path
    pub async fn health_check(&self) -> Result<(), StoreUnavailable> {
        match tokio::time::timeout(self.store_timeout * 10, self.store.health_check()).await {
            Ok(result) => result,
            Err(_) => Err(StoreUnavailable::Timeout(self.store_timeout * 10)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bypass::StaticBypassList, store::MemoryBucketStore, utils::ManualTimeSource};

    fn engine(clock: &ManualTimeSource) -> AdmissionEngine {
        AdmissionEngine::new(Arc::new(MemoryBucketStore::default()))
            .with_time_source(Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_allow_then_reject() {
        let clock = ManualTimeSource::new(1_700_000_040);
        let engine = engine(&clock);
        let quota = QuotaConfig::new(2, 60).unwrap();
        let id = Identity::new("k1").unwrap();

        assert!(matches!(
            engine.evaluate(&id, &quota).await,
            Decision::Allow { remaining: 1, .. }
        ));
        assert!(matches!(
            engine.evaluate(&id, &quota).await,
            Decision::Allow { remaining: 0, .. }
        ));
        match engine.evaluate(&id, &quota).await {
            Decision::Reject { retry_after_secs } => assert!(retry_after_secs <= 60),
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_grace_extends_reset() {
        let clock = ManualTimeSource::new(0);
        let engine = engine(&clock).with_grace(Duration::from_secs(30));
        let quota = QuotaConfig::new(5, 60).unwrap();

        match engine.evaluate(&Identity::new("k1").unwrap(), &quota).await {
            Decision::Allow {
                reset_after_secs, ..
            } => assert!(reset_after_secs > 60 && reset_after_secs <= 90),
            other => panic!("expected allow, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bypass_short_circuits() {
        let clock = ManualTimeSource::new(0);
        let engine =
            engine(&clock).with_bypass(Arc::new(StaticBypassList::new(["svc-internal"])));
        let quota = QuotaConfig::new(1, 60).unwrap();
        let id = Identity::new("svc-internal").unwrap();

        for _ in 0..10 {
            assert_eq!(engine.evaluate(&id, &quota).await, Decision::Bypass);
        }
    }

    #[tokio::test]
    async fn test_metrics_count_outcomes() {
        let clock = ManualTimeSource::new(0);
        let metrics = Arc::new(Metrics::new().unwrap());
        let engine = engine(&clock).with_metrics(metrics.clone());
        let quota = QuotaConfig::new(1, 60).unwrap();
        let id = Identity::new("k1").unwrap();

        engine.evaluate(&id, &quota).await;
        engine.evaluate(&id, &quota).await;

        assert_eq!(metrics.decision_count("allow"), 1.0);
        assert_eq!(metrics.decision_count("reject"), 1.0);
    }

    #[test]
    fn test_decision_outcome_labels() {
        assert!(Decision::Bypass.is_admitted());
        assert!(!Decision::Reject {
            retry_after_secs: 3
        }
        .is_admitted());
        assert_eq!(
            Decision::AllowDegraded {
                reason: "timeout".into()
            }
            .outcome(),
            "degraded"
        );
    }
}
