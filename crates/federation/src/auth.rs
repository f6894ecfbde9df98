//! HTTP signature authentication for inbox POSTs.

use std::sync::Arc;

use axum::http::{StatusCode, header, request::Parts};
use chrono::{DateTime, Duration, Utc};
use outpost_common::{AppError, AppResult};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::clock::Clock;
use crate::context::RequestContext;
use crate::object::{ApObject, same_origin};
use crate::protocol::Authentication;
use crate::signature::{HttpVerifier, SignatureComponents, verify_digest};
use crate::transport::Transport;

/// Accepted distance between the `Date` header and our clock.
const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::hours(12);

/// Checks the `Signature`, `Date` and `Digest` of an inbound request.
///
/// Outcomes:
/// - missing or unreadable signature, unsigned required header, stale
///   date, bad digest: 401
/// - signing key answered 410 Gone: 410
/// - key found but the signature does not verify: 403
#[derive(Clone)]
pub struct SignatureAuthenticator {
    clock: Arc<dyn Clock>,
    max_clock_skew: Duration,
}

/// A public key and the actor it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOwner {
    pub key_id: Url,
    pub owner: Url,
    pub public_key_pem: String,
}

impl SignatureAuthenticator {
    /// Create a new authenticator with a 12 hour date window.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
        }
    }

    #[must_use]
    pub const fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    /// Authenticate a request, fetching the signing key through `keys`.
    ///
    /// On success the context names the key and its owner.
    pub async fn authenticate(
        &self,
        mut ctx: RequestContext,
        request: &Parts,
        body: &[u8],
        keys: &dyn Transport,
    ) -> AppResult<Authentication> {
        let components = match signature_components(request) {
            Ok(components) => components,
            Err(reason) => {
                debug!(reason, "Rejecting unsigned request");
                return Ok(Authentication::deny(StatusCode::UNAUTHORIZED));
            }
        };

        if let Some(header) = components.missing_required_header(request.method.as_str()) {
            debug!(header, key_id = %components.key_id, "Signature leaves out a required header");
            return Ok(Authentication::deny(StatusCode::UNAUTHORIZED));
        }

        if let Err(reason) = self.check_date(request) {
            debug!(reason, key_id = %components.key_id, "Rejecting request date");
            return Ok(Authentication::deny(StatusCode::UNAUTHORIZED));
        }

        let digest = request
            .headers
            .get("digest")
            .and_then(|v| v.to_str().ok());
        match digest {
            Some(digest) if verify_digest(body, digest) => {}
            None if body.is_empty() => {}
            _ => {
                debug!(key_id = %components.key_id, "Digest missing or mismatched");
                return Ok(Authentication::deny(StatusCode::UNAUTHORIZED));
            }
        }

        let Ok(key_id) = Url::parse(&components.key_id) else {
            return Ok(Authentication::deny(StatusCode::UNAUTHORIZED));
        };
        let key = match fetch_key(&ctx, keys, &key_id).await {
            Ok(key) => key,
            Err(AppError::Gone(_)) => {
                debug!(key_id = %key_id, "Signing key is gone");
                return Ok(Authentication::deny(StatusCode::GONE));
            }
            Err(e) => {
                warn!(key_id = %key_id, error = %e, "Could not fetch signing key");
                return Ok(Authentication::deny(StatusCode::UNAUTHORIZED));
            }
        };

        let path_and_query = request
            .uri
            .path_and_query()
            .map_or_else(|| request.uri.path(), |pq| pq.as_str());
        if let Err(e) = HttpVerifier::verify(
            &key.public_key_pem,
            &components,
            request.method.as_str(),
            path_and_query,
            &request.headers,
        ) {
            debug!(key_id = %key_id, error = %e, "Signature verification failed");
            return Ok(Authentication::deny(StatusCode::FORBIDDEN));
        }

        ctx.requesting_key = Some(key.key_id);
        ctx.requesting_actor = Some(key.owner);
        Ok(Authentication::Granted(ctx))
    }

    fn check_date(&self, request: &Parts) -> Result<(), &'static str> {
        let date = request
            .headers
            .get(header::DATE)
            .and_then(|v| v.to_str().ok())
            .ok_or("missing Date header")?;
        let date = DateTime::parse_from_rfc2822(date)
            .map_err(|_| "unreadable Date header")?
            .with_timezone(&Utc);
        let skew = (self.clock.now() - date).abs();
        if skew > self.max_clock_skew {
            return Err("Date header outside the accepted window");
        }
        Ok(())
    }
}

fn signature_components(request: &Parts) -> Result<SignatureComponents, &'static str> {
    let header = request
        .headers
        .get("signature")
        .and_then(|v| v.to_str().ok())
        .ok_or("missing Signature header")?;
    HttpVerifier::parse_signature_header(header).map_err(|_| "unreadable Signature header")
}

/// Dereference `key_id` and find the PEM it names.
///
/// The document may be the key itself or an actor embedding it under
/// `publicKey`.
pub async fn fetch_key(
    ctx: &RequestContext,
    keys: &dyn Transport,
    key_id: &Url,
) -> AppResult<KeyOwner> {
    let mut without_fragment = key_id.clone();
    without_fragment.set_fragment(None);
    let document = keys.dereference(ctx, &without_fragment).await?;
    key_from_document(&document, key_id)
        .ok_or_else(|| AppError::BadRequest(format!("{key_id} does not name a public key")))
}

fn key_from_document(document: &ApObject, key_id: &Url) -> Option<KeyOwner> {
    let key = if document.contains("publicKeyPem") {
        Value::Object(document.as_map().clone())
    } else {
        match document.get("publicKey")? {
            Value::Array(keys) => keys
                .iter()
                .find(|key| key.get("id").and_then(Value::as_str) == Some(key_id.as_str()))
                .or_else(|| keys.first())?
                .clone(),
            key => key.clone(),
        }
    };

    let public_key_pem = key.get("publicKeyPem")?.as_str()?.to_string();
    let owner = key
        .get("owner")
        .and_then(Value::as_str)
        .and_then(|s| Url::parse(s).ok())
        .or_else(|| document.id())?;
    // A key only speaks for actors on its own host.
    if !same_origin(&owner, key_id) {
        return None;
    }
    Some(KeyOwner {
        key_id: key_id.clone(),
        owner,
        public_key_pem,
    })
}
