//! The shared bucket substrate.
//!
//! A [`BucketStore`] performs the whole read-decide-write step for one bucket as a
//! single indivisible operation. Callers never issue a separate read followed by a
//! write; that would let two instances both see "1 remaining" and both admit.

use async_trait::async_trait;
use moka::{
    future::Cache,
    ops::compute::{CompResult, Op},
    Expiry,
};
use std::time::{Duration, Instant};

use crate::{
    error::StoreUnavailable,
    key::BucketKey,
    redis::{ConsumeReply, RedisClient},
};

/// Record state observed inside the atomic operation, before it mutated anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    Absent,
    Present(u32),
}

/// Outcome of one `consume` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConsumption {
    pub prior: BucketState,
    /// Tokens left after this call, always in `[0, limit - 1]`
    pub remaining: u32,
    /// Time until the store expires the record
    pub ttl: Duration,
}

impl BucketConsumption {
    /// Whether this call actually removed a token.
    pub fn token_taken(&self) -> bool {
        match self.prior {
            BucketState::Absent => true,
            BucketState::Present(tokens) => tokens > 0,
        }
    }
}

impl From<ConsumeReply> for BucketConsumption {
    fn from(reply: ConsumeReply) -> Self {
        let prior = if reply.prior_present {
            BucketState::Present(clamp_u32(reply.prior_value))
        } else {
            BucketState::Absent
        };

        Self {
            prior,
            remaining: clamp_u32(reply.remaining),
            ttl: Duration::from_millis(reply.ttl_millis.max(0) as u64),
        }
    }
}

fn clamp_u32(value: i64) -> u32 {
    value.clamp(0, u32::MAX as i64) as u32
}

/// Atomic key/counter substrate with per-key expiry
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Take one token from `key`, creating the record with `limit - 1` tokens and
    /// `ttl` expiry if it does not exist. A record at zero is left at zero.
    async fn consume(
        &self,
        key: &BucketKey,
        limit: u32,
        ttl: Duration,
    ) -> Result<BucketConsumption, StoreUnavailable>;

    /// Health check for the store
    async fn health_check(&self) -> Result<(), StoreUnavailable> {
        Ok(())
    }

    /// Backend name for logs and metrics
    fn name(&self) -> &'static str;
}

/// Bucket store backed by Redis; each consume is one Lua script evaluation
#[derive(Clone)]
pub struct RedisBucketStore {
    client: RedisClient,
}

impl RedisBucketStore {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn consume(
        &self,
        key: &BucketKey,
        limit: u32,
        ttl: Duration,
    ) -> Result<BucketConsumption, StoreUnavailable> {
        // Redis EX rejects 0; sub-second ttls round up.
        let ttl_seconds = crate::utils::ceil_secs(ttl).max(1);
        let reply = self.client.consume(key.as_str(), limit, ttl_seconds).await?;
        Ok(reply.into())
    }

    async fn health_check(&self) -> Result<(), StoreUnavailable> {
        self.client.health_check().await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[derive(Debug, Clone, Copy)]
struct BucketRecord {
    remaining: u32,
    expires_at: Instant,
    // State the last mutation saw
    observed: BucketState,
}

struct RecordExpiry;

impl Expiry<String, BucketRecord> for RecordExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &BucketRecord,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &BucketRecord,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

/// In-process bucket store.
///
/// moka serialises `and_compute_with` per key, so concurrent consumers of one
/// bucket (any number of tasks or simulated instances sharing this store) see
/// the same guarantee the Redis script gives.
///
/// Records only ever leave through expiry. The cache has no size bound because an
/// evicted record would come back as `Absent` and hand out a second full quota;
/// `capacity` instead refuses new buckets once reached, which fails open.
#[derive(Clone)]
pub struct MemoryBucketStore {
    buckets: Cache<String, BucketRecord>,
    capacity: u64,
}

impl MemoryBucketStore {
    pub fn new(capacity: u64) -> Self {
        let buckets = Cache::builder().expire_after(RecordExpiry).build();

        Self { buckets, capacity }
    }

    /// Number of live bucket records (approximate, pending moka housekeeping)
    pub fn len(&self) -> u64 {
        self.buckets.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn consume(
        &self,
        key: &BucketKey,
        limit: u32,
        ttl: Duration,
    ) -> Result<BucketConsumption, StoreUnavailable> {
        // Soft bound: entry_count lags behind pending inserts.
        if !self.buckets.contains_key(key.as_str())
            && self.buckets.entry_count() >= self.capacity
        {
            return Err(StoreUnavailable::CapacityExhausted(self.capacity));
        }

        let now = Instant::now();
        let fresh = BucketRecord {
            remaining: limit.saturating_sub(1),
            expires_at: now + ttl,
            observed: BucketState::Absent,
        };

        let result = self
            .buckets
            .entry(key.as_str().to_string())
            .and_compute_with(|entry| {
                let op = match entry.map(|e| e.into_value()) {
                    Some(record) if record.expires_at > now => {
                        if record.remaining > 0 {
                            Op::Put(BucketRecord {
                                remaining: record.remaining - 1,
                                observed: BucketState::Present(record.remaining),
                                ..record
                            })
                        } else {
                            Op::Nop
                        }
                    }
                    _ => Op::Put(fresh),
                };
                std::future::ready(op)
            })
            .await;

        let record = match result {
            CompResult::Inserted(entry) | CompResult::ReplacedWith(entry) => entry.into_value(),
            CompResult::Unchanged(entry) => BucketRecord {
                observed: BucketState::Present(0),
                ..entry.into_value()
            },
            CompResult::Removed(_) | CompResult::StillNone(_) => {
                return Err(StoreUnavailable::Protocol(format!(
                    "bucket {} vanished during consume",
                    key
                )))
            }
        };

        Ok(BucketConsumption {
            prior: record.observed,
            remaining: record.remaining,
            ttl: record.expires_at.saturating_duration_since(Instant::now()),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Identity, RateKeyScheme};
    use std::sync::Arc;

    fn key(identity: &str, now: i64) -> BucketKey {
        RateKeyScheme::default().key(&Identity::new(identity).unwrap(), now, 60)
    }

    #[tokio::test]
    async fn test_first_consume_creates_record() {
        let store = MemoryBucketStore::default();
        let result = store
            .consume(&key("k1", 0), 100, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(result.prior, BucketState::Absent);
        assert_eq!(result.remaining, 99);
        assert!(result.token_taken());
        assert!(result.ttl <= Duration::from_secs(60));
        assert!(result.ttl > Duration::from_secs(58));
    }

    #[tokio::test]
    async fn test_consume_floors_at_zero() {
        let store = MemoryBucketStore::default();
        let key = key("k1", 0);
        let ttl = Duration::from_secs(60);

        for expected in (0..3).rev() {
            let result = store.consume(&key, 3, ttl).await.unwrap();
            assert_eq!(result.remaining, expected);
            assert!(result.token_taken());
        }

        for _ in 0..5 {
            let result = store.consume(&key, 3, ttl).await.unwrap();
            assert_eq!(result.prior, BucketState::Present(0));
            assert_eq!(result.remaining, 0);
            assert!(!result.token_taken());
        }
    }

    #[tokio::test]
    async fn test_expired_record_is_recreated() {
        let store = MemoryBucketStore::default();
        let key = key("k1", 0);

        store.consume(&key, 1, Duration::from_millis(20)).await.unwrap();
        let exhausted = store.consume(&key, 1, Duration::from_millis(20)).await.unwrap();
        assert!(!exhausted.token_taken());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = store.consume(&key, 1, Duration::from_millis(20)).await.unwrap();
        assert_eq!(fresh.prior, BucketState::Absent);
        assert!(fresh.token_taken());
    }

    #[tokio::test]
    async fn test_concurrent_consumers_never_overdraw() {
        let store = Arc::new(MemoryBucketStore::default());
        let key = key("hot", 0);

        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .consume(&key, 50, Duration::from_secs(60))
                    .await
                    .unwrap()
                    .token_taken()
            }));
        }

        let mut taken = 0;
        for handle in handles {
            if handle.await.unwrap() {
                taken += 1;
            }
        }
        assert_eq!(taken, 50);
    }

    #[test]
    fn test_consumption_from_script_reply() {
        let created: BucketConsumption = ConsumeReply {
            prior_present: false,
            prior_value: 0,
            remaining: 99,
            ttl_millis: 60_000,
        }
        .into();
        assert_eq!(created.prior, BucketState::Absent);
        assert!(created.token_taken());
        assert_eq!(created.ttl, Duration::from_secs(60));

        let rejected: BucketConsumption = ConsumeReply {
            prior_present: true,
            prior_value: 0,
            remaining: 0,
            ttl_millis: -2,
        }
        .into();
        assert!(!rejected.token_taken());
        assert_eq!(rejected.ttl, Duration::ZERO);
    }

    #[test]
    fn test_sub_second_script_ttl_rounds_up() {
        let closing: BucketConsumption = ConsumeReply {
            prior_present: true,
            prior_value: 0,
            remaining: 0,
            ttl_millis: 300,
        }
        .into();
        assert_eq!(closing.ttl, Duration::from_millis(300));
        assert_eq!(crate::utils::ceil_secs(closing.ttl), 1);
    }

    #[tokio::test]
    async fn test_full_store_keeps_live_buckets() {
        let store = MemoryBucketStore::new(10);
        let ttl = Duration::from_secs(60);
        let victim = key("victim", 0);

        let mut taken = 0;
        for round in 0..200 {
            let hot = key(&format!("hot-{}", round % 10), 0);
            // Hot buckets may be refused once the store is full; that is fine.
            let _ = store.consume(&hot, 1_000, ttl).await;

            match store.consume(&victim, 1, ttl).await {
                Ok(consumption) if consumption.token_taken() => taken += 1,
                Ok(_) => {}
                Err(err) => assert!(matches!(err, StoreUnavailable::CapacityExhausted(10))),
            }
        }
        assert_eq!(taken, 1);
    }

    #[tokio::test]
    async fn test_capacity_refuses_new_buckets() {
        let store = MemoryBucketStore::new(2);
        let ttl = Duration::from_secs(60);

        store.consume(&key("a", 0), 5, ttl).await.unwrap();
        store.consume(&key("b", 0), 5, ttl).await.unwrap();
        store.buckets.run_pending_tasks().await;

        let err = store.consume(&key("c", 0), 5, ttl).await.unwrap_err();
        assert!(matches!(err, StoreUnavailable::CapacityExhausted(2)));

        // Existing buckets keep working
        let again = store.consume(&key("a", 0), 5, ttl).await.unwrap();
        assert_eq!(again.remaining, 3);
    }
}
