use std::time::Duration;
use thiserror::Error;

/// Result type for admission-control operations
pub type Result<T> = std::result::Result<T, AdmissionError>;

/// Errors that can occur while configuring or hosting the admission service.
///
/// None of these ever leave [`AdmissionEngine::evaluate`](crate::engine::AdmissionEngine::evaluate);
/// the request path only ever sees [`StoreUnavailable`], and absorbs it.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    StoreUnavailable(#[from] StoreUnavailable),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The bucket store could not complete an operation.
///
/// Raised instead of a default value so the caller owns the fail-open policy.
#[derive(Error, Debug)]
pub enum StoreUnavailable {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("unexpected store reply: {0}")]
    Protocol(String),

    #[error("store full: {0} live buckets")]
    CapacityExhausted(u64),
}

impl StoreUnavailable {
    /// Short, stable label used for metrics and degraded-decision reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreUnavailable::Timeout(_) => "timeout",
            StoreUnavailable::Backend(_) => "backend",
            StoreUnavailable::Protocol(_) => "protocol",
            StoreUnavailable::CapacityExhausted(_) => "capacity",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_kind() {
        assert_eq!(StoreUnavailable::Timeout(Duration::from_millis(5)).kind(), "timeout");
        assert_eq!(StoreUnavailable::Protocol("bad".into()).kind(), "protocol");
        assert_eq!(StoreUnavailable::CapacityExhausted(10).kind(), "capacity");
    }

    #[test]
    fn test_store_unavailable_converts_into_admission_error() {
        let err: AdmissionError = StoreUnavailable::CapacityExhausted(100_000).into();
        assert!(matches!(err, AdmissionError::StoreUnavailable(_)));
        assert_eq!(err.to_string(), "store full: 100000 live buckets");
    }
}
