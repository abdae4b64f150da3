//! Request-pipeline adapter: identity extraction, admission, and response headers.

use axum::{
    extract::{Request, State},
    http::{
        header::{HeaderName, RETRY_AFTER},
        HeaderMap, HeaderValue, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::{
    config::QuotaConfig,
    engine::{AdmissionEngine, Decision},
    error::{AdmissionError, Result},
    key::Identity,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Resolves the caller identity for one request
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<Identity>;
}

/// Reads the identity from a single request header (e.g. `x-api-key`)
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    header: HeaderName,
}

impl HeaderIdentity {
    pub fn new(header: &str) -> Result<Self> {
        let header = HeaderName::from_bytes(header.trim().to_ascii_lowercase().as_bytes())
            .map_err(|e| {
                AdmissionError::ConfigurationInvalid(format!(
                    "invalid identity header {:?}: {}",
                    header, e
                ))
            })?;
        Ok(Self { header })
    }
}

impl IdentityResolver for HeaderIdentity {
    fn resolve(&self, headers: &HeaderMap) -> Option<Identity> {
        let value = headers.get(&self.header)?.to_str().ok()?;
        Identity::new(value)
    }
}

/// What the pipeline should do after admission
#[derive(Debug)]
pub enum StageOutcome {
    /// Run downstream stages, then add these headers to their response
    Continue(HeaderMap),
    /// Stop here and send this response
    Respond(Response),
}

/// The admission step of a request pipeline
pub struct AdmissionStage {
    engine: Arc<AdmissionEngine>,
    quota: QuotaConfig,
    resolver: Arc<dyn IdentityResolver>,
    enabled: bool,
}

impl AdmissionStage {
    pub fn new(
        engine: Arc<AdmissionEngine>,
        quota: QuotaConfig,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            engine,
            quota,
            resolver,
            enabled: true,
        }
    }

    /// A disabled stage passes every request through untouched
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn quota(&self) -> &QuotaConfig {
        &self.quota
    }

    pub async fn admit(&self, headers: &HeaderMap) -> StageOutcome {
        if !self.enabled {
            return StageOutcome::Continue(HeaderMap::new());
        }

        let Some(identity) = self.resolver.resolve(headers) else {
            return StageOutcome::Respond(unauthorized());
        };

        let decision = self.engine.evaluate(&identity, &self.quota).await;
        self.render(&decision, self.engine.time_source().unix_now())
    }

    /// Translate a decision into pipeline effects; `now` anchors the absolute reset time
    pub fn render(&self, decision: &Decision, now: i64) -> StageOutcome {
        let mut headers = HeaderMap::new();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.quota.limit));

        match decision {
            Decision::Bypass | Decision::AllowDegraded { .. } => StageOutcome::Continue(headers),
            Decision::Allow {
                remaining,
                reset_after_secs,
            } => {
                headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(*remaining));
                headers.insert(X_RATELIMIT_RESET, reset_at(now, *reset_after_secs));
                StageOutcome::Continue(headers)
            }
            Decision::Reject { retry_after_secs } => {
                headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u32));
                headers.insert(X_RATELIMIT_RESET, reset_at(now, *retry_after_secs));
                headers.insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));

                let body = Json(json!({
                    "error": "too_many_requests",
                    "message": "Rate limit exceeded",
                    "retry_after_seconds": retry_after_secs,
                }));
                StageOutcome::Respond((StatusCode::TOO_MANY_REQUESTS, headers, body).into_response())
            }
        }
    }
}

fn reset_at(now: i64, after_secs: u64) -> HeaderValue {
    HeaderValue::from(now.saturating_add(after_secs as i64))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "unauthorized",
            "message": "No caller identity could be determined",
        })),
    )
        .into_response()
}

/// Axum middleware running [`AdmissionStage::admit`] before the wrapped routes.
///
/// Install with `axum::middleware::from_fn_with_state(stage, admission_middleware)`.
pub async fn admission_middleware(
    State(stage): State<Arc<AdmissionStage>>,
    request: Request,
    next: Next,
) -> Response {
    match stage.admit(request.headers()).await {
        StageOutcome::Continue(headers) => {
            let mut response = next.run(request).await;
            response.headers_mut().extend(headers);
            response
        }
        StageOutcome::Respond(response) => response,
    }
}
