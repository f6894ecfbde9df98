//! HTTP-facing dispatch for inbox and outbox requests.
//!
//! Every method returns `Ok(None)` when the request is not ActivityPub,
//! so the caller can serve it some other way.

use axum::body::{Body, to_bytes};
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Response};
use outpost_common::{AppError, AppResult};
use tracing::{debug, info, warn};
use url::Url;

use crate::clock::http_date;
use crate::context::RequestContext;
use crate::media_type::{CONTENT_TYPE_LD_JSON, is_activity_pub_get, is_activity_pub_post};
use crate::object::ApObject;
use crate::protocol::{Authentication, BlockStatus};
use crate::side_effect::SideEffectActor;
use crate::signature::calculate_digest;

/// Largest request body accepted on an inbox or outbox.
pub const MAX_ACTIVITY_BYTES: usize = 1024 * 1024;

/// An ActivityPub actor serving inbox and outbox endpoints.
///
/// Which endpoints accept POSTs depends on the protocols enabled on the
/// [`SideEffectActor`]: federating for the inbox, social for the outbox.
#[derive(Clone)]
pub struct Actor {
    side_effect: SideEffectActor,
    base_url: Url,
    deliver_in_background: bool,
}

impl Actor {
    /// Create a new actor. Box IRIs are `base_url` joined with the request path.
    #[must_use]
    pub const fn new(side_effect: SideEffectActor, base_url: Url) -> Self {
        Self {
            side_effect,
            base_url,
            deliver_in_background: true,
        }
    }

    /// Deliver outbox activities on a spawned task instead of inside the request.
    #[must_use]
    pub const fn deliver_in_background(mut self, background: bool) -> Self {
        self.deliver_in_background = background;
        self
    }

    #[must_use]
    pub const fn side_effect(&self) -> &SideEffectActor {
        &self.side_effect
    }

    /// Handle a POST to an inbox.
    pub async fn post_inbox(&self, request: Request) -> AppResult<Option<Response>> {
        if !is_activity_pub_post(request.headers()) {
            return Ok(None);
        }
        if !self.side_effect.is_federating() {
            return Ok(Some(StatusCode::METHOD_NOT_ALLOWED.into_response()));
        }

        let (parts, body) = request.into_parts();
        let body = read_body(body).await?;
        let inbox = self.box_iri(&parts)?;

        let ctx = RequestContext::new().with_fast_fail();
        let ctx = match self
            .side_effect
            .authenticate_post_inbox(ctx, &parts, &body)
            .await?
        {
            Authentication::Granted(ctx) => ctx,
            Authentication::Denied(response) => return Ok(Some(response)),
        };

        let activity = ApObject::from_slice(&body)?;
        if !activity.is_activity() {
            return Err(AppError::NotActivity(
                activity.type_name().unwrap_or("untyped").to_string(),
            ));
        }
        let id = activity.require_id("inbox activity")?;

        let ctx = self
            .side_effect
            .post_inbox_request_body_hook(ctx, &parts, &activity)
            .await?;

        match self.side_effect.authorize_post_inbox(&ctx, &activity).await? {
            BlockStatus::None => {}
            BlockStatus::Actor => {
                info!(activity = %id, "Activity from a blocked actor refused");
                return Ok(Some(StatusCode::FORBIDDEN.into_response()));
            }
            BlockStatus::OtherIri => {
                debug!(activity = %id, "Activity involves a blocked party, dropping");
                return Ok(Some(StatusCode::ACCEPTED.into_response()));
            }
        }

        self.side_effect.post_inbox(&ctx, &inbox, &activity).await?;
        self.side_effect
            .inbox_forwarding(&ctx, &inbox, &activity)
            .await?;
        Ok(Some(StatusCode::OK.into_response()))
    }

    /// Handle a GET of an inbox.
    pub async fn get_inbox(&self, request: Request) -> AppResult<Option<Response>> {
        if !is_activity_pub_get(request.headers()) {
            return Ok(None);
        }
        let (parts, _) = request.into_parts();
        let inbox = self.box_iri(&parts)?;

        let ctx = match self
            .side_effect
            .authenticate_get_inbox(RequestContext::new(), &parts)
            .await?
        {
            Authentication::Granted(ctx) => ctx,
            Authentication::Denied(response) => return Ok(Some(response)),
        };

        let mut page = self.side_effect.get_inbox(&ctx, &inbox).await?;
        page.dedupe_items();
        self.activity_response(StatusCode::OK, &page).map(Some)
    }

    /// Handle a POST to an outbox.
    pub async fn post_outbox(&self, request: Request) -> AppResult<Option<Response>> {
        if !is_activity_pub_post(request.headers()) {
            return Ok(None);
        }
        if !self.side_effect.is_social() {
            return Ok(Some(StatusCode::METHOD_NOT_ALLOWED.into_response()));
        }

        let (parts, body) = request.into_parts();
        let body = read_body(body).await?;
        let outbox = self.box_iri(&parts)?;

        let ctx = match self
            .side_effect
            .authenticate_post_outbox(RequestContext::new(), &parts)
            .await?
        {
            Authentication::Granted(ctx) => ctx,
            Authentication::Denied(response) => return Ok(Some(response)),
        };

        let data = ApObject::from_slice(&body)?;
        let ctx = self
            .side_effect
            .post_outbox_request_body_hook(ctx, &parts, &data)
            .await?;

        let mut activity = if data.is_activity() {
            data
        } else {
            self.side_effect.wrap_in_create(data, &outbox).await?
        };
        self.side_effect.add_new_ids(&mut activity).await?;
        let id = activity.require_id("outbox activity")?;

        let deliverable = self
            .side_effect
            .post_outbox(&ctx, &mut activity, &outbox)
            .await?;
        if deliverable && self.side_effect.is_federating() {
            self.deliver(ctx, outbox, activity).await?;
        }

        let location = HeaderValue::from_str(id.as_str())
            .map_err(|e| AppError::Internal(format!("Invalid Location header: {e}")))?;
        Ok(Some(
            (StatusCode::CREATED, [(header::LOCATION, location)]).into_response(),
        ))
    }

    /// Handle a GET of an outbox.
    pub async fn get_outbox(&self, request: Request) -> AppResult<Option<Response>> {
        if !is_activity_pub_get(request.headers()) {
            return Ok(None);
        }
        let (parts, _) = request.into_parts();
        let outbox = self.box_iri(&parts)?;

        let ctx = match self
            .side_effect
            .authenticate_get_outbox(RequestContext::new(), &parts)
            .await?
        {
            Authentication::Granted(ctx) => ctx,
            Authentication::Denied(response) => return Ok(Some(response)),
        };

        let mut page = self.side_effect.get_outbox(&ctx, &outbox).await?;
        page.dedupe_items();
        self.activity_response(StatusCode::OK, &page).map(Some)
    }

    async fn deliver(
        &self,
        ctx: RequestContext,
        outbox: Url,
        activity: ApObject,
    ) -> AppResult<()> {
        if !self.deliver_in_background {
            return self.side_effect.deliver(&ctx, &outbox, &activity).await;
        }

        let side_effect = self.side_effect.clone();
        tokio::spawn(async move {
            if let Err(e) = side_effect.deliver(&ctx, &outbox, &activity).await {
                warn!(
                    activity = ?activity.id().map(String::from),
                    error = %e,
                    "Background delivery failed"
                );
            }
        });
        Ok(())
    }

    fn box_iri(&self, parts: &Parts) -> AppResult<Url> {
        Ok(self.base_url.join(parts.uri.path())?)
    }

    /// Serialize `object` with the ActivityPub content type, `Date` and `Digest`.
    fn activity_response(&self, status: StatusCode, object: &ApObject) -> AppResult<Response> {
        let body = object.to_bytes()?;
        let date = http_date(self.side_effect.clock().now());
        let digest = calculate_digest(&body);

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(CONTENT_TYPE_LD_JSON),
        );
        headers.insert(header::DATE, header_value(&date)?);
        headers.insert("digest", header_value(&digest)?);
        Ok(response)
    }
}

async fn read_body(body: Body) -> AppResult<Vec<u8>> {
    to_bytes(body, MAX_ACTIVITY_BYTES)
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|e| AppError::status(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()))
}

fn header_value(value: &str) -> AppResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| AppError::Internal(format!("Invalid header: {e}")))
}
