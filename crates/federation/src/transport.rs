//! Outbound HTTP seam and its reqwest implementation.
//!
//! A [`Transport`] is created per actor and request through
//! [`crate::protocol::CommonBehavior::new_transport`], so credentials are
//! never held longer than the work that needs them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use outpost_common::{AppError, AppResult};
use reqwest::{Client, StatusCode, header};
use tracing::{debug, info, warn};
use url::Url;

use crate::clock::{Clock, http_date};
use crate::context::RequestContext;
use crate::media_type::{ACCEPT_ACTIVITY, CONTENT_TYPE_LD_JSON};
use crate::object::ApObject;
use crate::signature::HttpSigner;

/// Concurrent deliveries used by the default `batch_deliver`.
const DEFAULT_BATCH_CONCURRENCY: usize = 8;

/// Signed fetch and delivery on behalf of one actor.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch and parse the ActivityStreams document at `iri`.
    async fn dereference(&self, ctx: &RequestContext, iri: &Url) -> AppResult<ApObject>;

    /// POST `payload` to one inbox.
    async fn deliver(&self, ctx: &RequestContext, payload: Bytes, to: &Url) -> AppResult<()>;

    /// POST `payload` to every recipient, one request each.
    ///
    /// All recipients are attempted; any failure fails the batch.
    async fn batch_deliver(
        &self,
        ctx: &RequestContext,
        payload: Bytes,
        recipients: &[Url],
    ) -> AppResult<()> {
        let failures: Vec<String> = stream::iter(recipients.iter().cloned())
            .map(|to| {
                let payload = payload.clone();
                async move {
                    self.deliver(ctx, payload, &to)
                        .await
                        .map_err(|e| format!("{to}: {e}"))
                }
            })
            .buffer_unordered(DEFAULT_BATCH_CONCURRENCY)
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;
        batch_result(recipients.len(), failures)
    }
}

fn batch_result(total: usize, failures: Vec<String>) -> AppResult<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(AppError::Transport(format!(
            "{} of {total} deliveries failed: {}",
            failures.len(),
            failures.join("; ")
        )))
    }
}

/// Exponential backoff for failed deliveries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs).min(self.max_delay)
    }
}

#[derive(Debug, thiserror::Error)]
enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error("Delivery failed: {status} - {body}")]
    Rejected { status: u16, body: String },
}

impl DeliveryError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Signing(_) => false,
            Self::Rejected { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
            }
        }
    }
}

/// Shared state behind every [`HttpTransport`].
#[derive(Clone)]
pub struct HttpTransportFactory {
    client: Client,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl HttpTransportFactory {
    /// Build the shared HTTP client.
    pub fn new(
        clock: Arc<dyn Clock>,
        user_agent: &str,
        request_timeout: Duration,
        retry: RetryPolicy,
        concurrency: usize,
    ) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            clock,
            retry,
            concurrency: concurrency.max(1),
        })
    }

    /// A transport signing as `signer`.
    #[must_use]
    pub fn transport(&self, signer: Arc<HttpSigner>) -> HttpTransport {
        HttpTransport {
            factory: self.clone(),
            signer,
        }
    }
}

/// Signed reqwest transport.
pub struct HttpTransport {
    factory: HttpTransportFactory,
    signer: Arc<HttpSigner>,
}

impl HttpTransport {
    fn signed_headers(
        &self,
        method: &str,
        url: &Url,
        body: Option<&[u8]>,
    ) -> AppResult<header::HeaderMap> {
        let date = http_date(self.factory.clock.now());
        Ok(self.signer.sign_request(method, url, body, &date)?)
    }

    async fn post_once(
        &self,
        ctx: &RequestContext,
        payload: &Bytes,
        to: &Url,
    ) -> Result<(), DeliveryError> {
        let headers = self
            .signed_headers("POST", to, Some(payload.as_ref()))
            .map_err(|e| DeliveryError::Signing(e.to_string()))?;

        let mut request = self
            .factory
            .client
            .post(to.as_str())
            .headers(headers)
            .header(header::CONTENT_TYPE, CONTENT_TYPE_LD_JSON)
            .header(header::ACCEPT, ACCEPT_ACTIVITY)
            .body(payload.clone());
        if let Some(timeout) = ctx.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            info!(inbox = %to, status = %status, "Activity delivered successfully");
            Ok(())
        } else if status == StatusCode::GONE {
            // 410 Gone - actor has been deleted, should stop delivering
            warn!(inbox = %to, "Remote actor is gone (410)");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dereference(&self, ctx: &RequestContext, iri: &Url) -> AppResult<ApObject> {
        debug!(iri = %iri, "Dereferencing remote object");

        let headers = self.signed_headers("GET", iri, None)?;
        let mut request = self
            .factory
            .client
            .get(iri.as_str())
            .headers(headers)
            .header(header::ACCEPT, ACCEPT_ACTIVITY);
        if let Some(timeout) = ctx.timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("GET {iri}: {e}")))?;

        let status = response.status();
        if status == StatusCode::GONE {
            return Err(AppError::Gone(iri.to_string()));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(iri.to_string()));
        }
        if !status.is_success() {
            return Err(AppError::Transport(format!("GET {iri}: status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::Transport(format!("GET {iri}: {e}")))?;
        ApObject::from_slice(&body)
            .map_err(|e| AppError::Transport(format!("GET {iri}: unreadable body: {e}")))
    }

    async fn deliver(&self, ctx: &RequestContext, payload: Bytes, to: &Url) -> AppResult<()> {
        let retry = &self.factory.retry;
        let mut attempt = 0;
        loop {
            match self.post_once(ctx, &payload, to).await {
                Ok(()) => return Ok(()),
                Err(e) if !ctx.fast_fail && e.is_retryable() && attempt < retry.max_retries => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(inbox = %to, error = %e, attempt, ?delay, "Delivery failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(inbox = %to, error = %e, "Activity delivery failed");
                    return Err(AppError::Transport(e.to_string()));
                }
            }
        }
    }

    async fn batch_deliver(
        &self,
        ctx: &RequestContext,
        payload: Bytes,
        recipients: &[Url],
    ) -> AppResult<()> {
        debug!(recipients = recipients.len(), "Batch delivering activity");

        let failures: Vec<String> = stream::iter(recipients.iter().cloned())
            .map(|to| {
                let payload = payload.clone();
                async move {
                    self.deliver(ctx, payload, &to)
                        .await
                        .map_err(|e| format!("{to}: {e}"))
                }
            })
            .buffer_unordered(self.factory.concurrency)
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;
        batch_result(recipients.len(), failures)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        let rejected = DeliveryError::Rejected {
            status: 403,
            body: String::new(),
        };
        let overloaded = DeliveryError::Rejected {
            status: 503,
            body: String::new(),
        };
        assert!(!rejected.is_retryable());
        assert!(overloaded.is_retryable());
    }

    #[test]
    fn test_batch_result_aggregates() {
        assert!(batch_result(2, Vec::new()).is_ok());
        let err = batch_result(3, vec!["a: refused".into()]).unwrap_err();
        assert!(err.to_string().contains("1 of 3"));
    }
}
