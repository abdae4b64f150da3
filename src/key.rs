//! Bucket addressing: identity + fixed window → store key.

use std::fmt;

/// Opaque caller token that quotas are enforced per.
///
/// Never parsed; any non-empty string is a valid, independent identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Returns `None` for an empty token.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if token.is_empty() {
            None
        } else {
            Some(Self(token))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store key for one identity in one window
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    key: String,
    window_index: i64,
}

impl BucketKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn window_index(&self) -> i64 {
        self.window_index
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// `floor(now / window)`.
///
/// Uses Euclidean division so pre-epoch timestamps still floor downwards.
pub fn window_index(now_seconds: i64, window_seconds: u64) -> i64 {
    let window = window_seconds.max(1) as i64;
    now_seconds.div_euclid(window)
}

/// Maps (identity, time, window) to a deterministic bucket key.
///
/// Keys look like `{prefix}:{identity}:{window_index}`. The window index is always
/// the last segment and the prefix the first, so identities containing `:` can't
/// collide with each other.
#[derive(Debug, Clone)]
pub struct RateKeyScheme {
    prefix: String,
}

impl RateKeyScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, identity: &Identity, now_seconds: i64, window_seconds: u64) -> BucketKey {
        let window_index = window_index(now_seconds, window_seconds);
        let key = if self.prefix.is_empty() {
            format!("{}:{}", identity.as_str(), window_index)
        } else {
            format!("{}:{}:{}", self.prefix, identity.as_str(), window_index)
        };

        BucketKey { key, window_index }
    }
}

impl Default for RateKeyScheme {
    fn default() -> Self {
        Self::new("quota")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_empty_identity_rejected() {
        assert!(Identity::new("").is_none());
        assert_eq!(id(" ").as_str(), " ");
    }

    #[test]
    fn test_key_is_deterministic() {
        let scheme = RateKeyScheme::new("quota");
        let a = scheme.key(&id("k1"), 1_700_000_000, 60);
        let b = scheme.key(&id("k1"), 1_700_000_000, 60);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), format!("quota:k1:{}", 1_700_000_000 / 60));
    }

    #[test]
    fn test_same_window_same_key() {
        let scheme = RateKeyScheme::default();
        let start = 1_700_000_040; // divisible by 60
        let first = scheme.key(&id("k1"), start, 60);
        let last = scheme.key(&id("k1"), start + 59, 60);
        assert_eq!(first, last);
    }

    #[test]
    fn test_window_rollover_changes_key() {
        let scheme = RateKeyScheme::default();
        let start = 1_700_000_040;
        let current = scheme.key(&id("k1"), start + 59, 60);
        let next = scheme.key(&id("k1"), start + 60, 60);
        assert_ne!(current, next);
        assert_eq!(next.window_index(), current.window_index() + 1);
    }

    #[test]
    fn test_identities_do_not_share_keys() {
        let scheme = RateKeyScheme::default();
        let a = scheme.key(&id("a:1"), 120, 60);
        let b = scheme.key(&id("a"), 120, 60);
        assert_ne!(a, b);
    }

    #[test]
    fn test_window_index_floors_negative_time() {
        assert_eq!(window_index(59, 60), 0);
        assert_eq!(window_index(60, 60), 1);
        assert_eq!(window_index(-1, 60), -1);
    }

    #[test]
    fn test_empty_prefix() {
        let scheme = RateKeyScheme::new("");
        assert_eq!(scheme.key(&id("k1"), 120, 60).as_str(), "k1:2");
    }
}
