use chrono::{DateTime, TimeZone, Utc};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock source used to derive window indices and absolute reset times
pub trait TimeSource: Send + Sync {
    /// Current Unix timestamp in seconds
    fn unix_now(&self) -> i64;

    /// Current time as a `DateTime<Utc>`
    fn utc_now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.unix_now(), 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Time source backed by the system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn unix_now(&self) -> i64 {
        // A clock set before the epoch is treated as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock.
///
/// Clones share the same underlying instant, so several simulated service
/// instances can be advanced together (or skewed apart with separate clocks).
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: Arc<AtomicI64>,
}

impl ManualTimeSource {
    pub fn new(unix_now: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(unix_now)),
        }
    }

    pub fn set(&self, unix_now: i64) {
        self.now.store(unix_now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn unix_now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Round a remaining time-to-live up to whole seconds.
///
/// A record with 200ms left still blocks for "1 second", never "0 seconds".
pub fn ceil_secs(ttl: Duration) -> u64 {
    if ttl.subsec_nanos() > 0 {
        ttl.as_secs() + 1
    } else {
        ttl.as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_source_advance() {
        let clock = ManualTimeSource::new(1_000);
        let shared = clock.clone();

        clock.advance(Duration::from_secs(60));
        assert_eq!(shared.unix_now(), 1_060);

        shared.set(5);
        assert_eq!(clock.unix_now(), 5);
        assert_eq!(clock.utc_now().timestamp(), 5);
    }

    #[test]
    fn test_system_time_source_is_after_epoch() {
        let clock = SystemTimeSource;
        assert!(clock.unix_now() > 1_600_000_000);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_secs(0)), 0);
        assert_eq!(ceil_secs(Duration::from_millis(200)), 1);
        assert_eq!(ceil_secs(Duration::from_secs(60)), 60);
        assert_eq!(ceil_secs(Duration::from_millis(59_001)), 60);
    }
}
