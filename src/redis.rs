use redis::{aio::ConnectionManager, Script};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AdmissionError, Result, StoreUnavailable};

/// Consume one token from a bucket inside Redis.
///
/// KEYS[1] = bucket key, ARGV[1] = limit, ARGV[2] = ttl seconds.
/// Reply: `{prior_present, prior_value, remaining, ttl_millis}`. The ttl comes from
/// PTTL so callers round it up themselves; TTL would round a closing window to 0.
const CONSUME_SCRIPT: &str = r#"
local limit = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SET', KEYS[1], limit - 1, 'EX', ttl)
  return {0, 0, limit - 1, ttl * 1000}
end
local value = tonumber(current)
local remaining_ttl = redis.call('PTTL', KEYS[1])
if remaining_ttl < 0 then
  redis.call('EXPIRE', KEYS[1], ttl)
  remaining_ttl = ttl * 1000
end
if value > 0 then
  return {1, value, redis.call('DECR', KEYS[1]), remaining_ttl}
end
return {1, 0, 0, remaining_ttl}
"#;

/// Redis client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout_ms: u64,
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout_ms: 5_000,
        }
    }
}

/// Raw result of one run of the consume script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeReply {
    pub prior_present: bool,
    pub prior_value: i64,
    pub remaining: i64,
    pub ttl_millis: i64,
}

impl ConsumeReply {
    pub fn from_values(values: &[i64]) -> std::result::Result<Self, StoreUnavailable> {
        match values {
            [present, prior, remaining, ttl] => Ok(Self {
                prior_present: *present != 0,
                prior_value: *prior,
                remaining: *remaining,
                ttl_millis: *ttl,
            }),
            other => Err(StoreUnavailable::Protocol(format!(
                "expected 4 integers from consume script, got {}",
                other.len()
            ))),
        }
    }
}

/// Redis client wrapper for bucket operations
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    consume_script: Script,
}

impl RedisClient {
    /// Connect and verify the server answers PING
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        info!(url = %config.url, "Creating Redis client");

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            AdmissionError::Redis(e)
        })?;

        let connection =
            match tokio::time::timeout(config.connection_timeout(), client.get_connection_manager())
                .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!("Failed to create connection manager: {}", e);
                    return Err(AdmissionError::Redis(e));
                }
                Err(_) => {
                    warn!(
                        "Timeout while creating connection manager ({}ms)",
                        config.connection_timeout_ms
                    );
                    return Err(StoreUnavailable::Timeout(config.connection_timeout()).into());
                }
            };

        let redis = Self {
            connection,
            consume_script: Script::new(CONSUME_SCRIPT),
        };

        match tokio::time::timeout(config.connection_timeout(), redis.ping()).await {
            Ok(Ok(())) => info!("Redis PING successful"),
            Ok(Err(e)) => {
                warn!("Redis PING failed: {}", e);
                return Err(e.into());
            }
            Err(_) => {
                warn!("Redis PING timeout ({}ms)", config.connection_timeout_ms);
                return Err(StoreUnavailable::Timeout(config.connection_timeout()).into());
            }
        }

        info!("Redis client initialized successfully");
        Ok(redis)
    }

    /// Run the consume script for `key` as one server-side atomic step
    pub async fn consume(
        &self,
        key: &str,
        limit: u32,
        ttl_seconds: u64,
    ) -> std::result::Result<ConsumeReply, StoreUnavailable> {
        let mut conn = self.connection.clone();
        let values: Vec<i64> = self
            .consume_script
            .key(key)
            .arg(limit)
            .arg(ttl_seconds)
            .invoke_async(&mut conn)
            .await?;

        let reply = ConsumeReply::from_values(&values)?;
        debug!(key, ?reply, "consume script completed");
        Ok(reply)
    }

    async fn ping(&self) -> std::result::Result<(), StoreUnavailable> {
        let mut conn = self.connection.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Check if the connection is healthy
    pub async fn health_check(&self) -> std::result::Result<(), StoreUnavailable> {
        self.ping().await
    }
}
