//! Edge Quota
//!
//! Distributed per-identity admission control. Many stateless service instances
//! share one atomic bucket store (Redis in production) and agree on "has this
//! identity used up N requests in this window?" with a single round trip per
//! request and no coordinator.
//!
//! Enforcement is a fixed-window token bucket: up to `2 × limit` requests can get
//! through across a window boundary, and instances whose clocks disagree may
//! briefly disagree on which window is current. When the store is unreachable the
//! engine fails open.

pub mod bypass;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod key;
pub mod metrics;
pub mod pipeline;
pub mod redis;
pub mod store;
pub mod utils;

// Re-export main types
pub use config::{AppConfig, QuotaConfig};
pub use engine::{AdmissionEngine, Decision};
pub use error::{AdmissionError, Result, StoreUnavailable};
pub use key::{Identity, RateKeyScheme};
pub use pipeline::{admission_middleware, AdmissionStage};
pub use store::{BucketStore, MemoryBucketStore, RedisBucketStore};
