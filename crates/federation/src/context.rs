//! Per-request state threaded through every hook.

use std::time::Duration;

use axum::http::Extensions;
use url::Url;

/// Request-scoped values produced by authentication and body hooks.
///
/// Hooks take the context by value and hand back an updated one. Dropping
/// the request future cancels any work still running against it.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Actor whose key signed the request.
    pub requesting_actor: Option<Url>,
    /// Key id the signature was checked against.
    pub requesting_key: Option<Url>,
    /// Owner of the inbox or outbox being posted to.
    pub box_owner: Option<Url>,
    /// IRIs mentioned by the activity, used for block checks.
    pub involved_iris: Vec<Url>,
    /// Outbound calls must not retry.
    pub fast_fail: bool,
    /// Upper bound for each outbound call.
    pub timeout: Option<Duration>,
    /// Application data.
    pub extensions: Extensions,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark outbound calls made under this context as not retryable.
    #[must_use]
    pub fn with_fast_fail(mut self) -> Self {
        self.fast_fail = true;
        self
    }
}
