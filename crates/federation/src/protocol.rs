//! Application hooks the engine calls into.
//!
//! [`CommonBehavior`] covers what both protocols need. [`FederatingProtocol`]
//! covers the server-to-server inbox. [`SocialProtocol`] covers the
//! client-to-server outbox. An application implements whichever protocols it
//! serves and hands them to [`crate::actor::Actor`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{StatusCode, request::Parts};
use axum::response::{IntoResponse, Response};
use outpost_common::AppResult;
use tracing::debug;
use url::Url;

use crate::callbacks::{CallbackOverrides, FederatingWrappedCallbacks, SocialWrappedCallbacks};
use crate::context::RequestContext;
use crate::object::{ApObject, is_public};
use crate::transport::Transport;

/// Outcome of an authentication hook.
pub enum Authentication {
    /// Continue with the enriched context.
    Granted(RequestContext),
    /// Stop and send this response as-is.
    Denied(Response),
}

impl Authentication {
    /// Deny with an empty body.
    #[must_use]
    pub fn deny(status: StatusCode) -> Self {
        Self::Denied(status.into_response())
    }
}

impl std::fmt::Debug for Authentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Granted(ctx) => f.debug_tuple("Granted").field(ctx).finish(),
            Self::Denied(response) => f.debug_tuple("Denied").field(&response.status()).finish(),
        }
    }
}

/// Result of the block check on an inbound activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Nobody involved is blocked.
    None,
    /// An actor directly responsible for the activity is blocked.
    Actor,
    /// Only a mentioned, replied-to or boosted party is blocked.
    OtherIri,
}

/// Hooks shared by the inbox and outbox paths.
#[async_trait]
pub trait CommonBehavior: Send + Sync {
    /// Decide whether the requester may read the inbox.
    async fn authenticate_get_inbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
    ) -> AppResult<Authentication>;

    /// Decide whether the requester may read the outbox.
    async fn authenticate_get_outbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
    ) -> AppResult<Authentication>;

    /// The outbox page served on GET.
    async fn get_outbox(&self, ctx: &RequestContext, outbox: &Url) -> AppResult<ApObject>;

    /// A transport acting for the owner of `box_iri`.
    async fn new_transport(
        &self,
        ctx: &RequestContext,
        box_iri: &Url,
    ) -> AppResult<Arc<dyn Transport>>;
}

/// Client-to-server hooks.
#[async_trait]
pub trait SocialProtocol: Send + Sync {
    /// Runs on the parsed outbox body before anything else sees it.
    async fn post_outbox_request_body_hook(
        &self,
        ctx: RequestContext,
        _request: &Parts,
        _data: &ApObject,
    ) -> AppResult<RequestContext> {
        Ok(ctx)
    }

    /// Decide whether the requester may post to the outbox.
    async fn authenticate_post_outbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
    ) -> AppResult<Authentication>;

    /// Wrapped defaults plus overrides for outbox activities.
    async fn social_callbacks(
        &self,
        _ctx: &RequestContext,
    ) -> AppResult<(SocialWrappedCallbacks, CallbackOverrides)> {
        Ok((SocialWrappedCallbacks::default(), CallbackOverrides::default()))
    }

    /// Handles activity types nothing else claimed.
    async fn default_callback(&self, _ctx: &RequestContext, activity: &ApObject) -> AppResult<()> {
        debug!(activity_type = ?activity.type_name(), "Unhandled outbox activity");
        Ok(())
    }
}

/// Server-to-server hooks.
#[async_trait]
pub trait FederatingProtocol: Send + Sync {
    /// Runs on the parsed inbox activity before authorization.
    ///
    /// The default records every IRI involved in the activity for the
    /// block check.
    async fn post_inbox_request_body_hook(
        &self,
        mut ctx: RequestContext,
        _request: &Parts,
        activity: &ApObject,
    ) -> AppResult<RequestContext> {
        ctx.involved_iris = involved_iris(activity);
        Ok(ctx)
    }

    /// Verify the request signature. Denials carry their own 401/403/410.
    async fn authenticate_post_inbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
        body: &[u8],
    ) -> AppResult<Authentication>;

    /// Block check for the actors behind an activity.
    async fn blocked(&self, ctx: &RequestContext, actor_iris: &[Url]) -> AppResult<BlockStatus>;

    /// Wrapped defaults plus overrides for inbox activities.
    async fn federating_callbacks(
        &self,
        _ctx: &RequestContext,
    ) -> AppResult<(FederatingWrappedCallbacks, CallbackOverrides)> {
        Ok((
            FederatingWrappedCallbacks::default(),
            CallbackOverrides::default(),
        ))
    }

    /// Handles activity types nothing else claimed.
    async fn default_callback(&self, _ctx: &RequestContext, activity: &ApObject) -> AppResult<()> {
        debug!(activity_type = ?activity.type_name(), "Unhandled inbox activity");
        Ok(())
    }

    /// Bound for the forwarding chain walk. 0 or less is unbounded.
    fn max_inbox_forwarding_recursion_depth(&self, ctx: &RequestContext) -> i32;

    /// Bound for collection expansion during delivery. 0 or less is unbounded.
    fn max_delivery_recursion_depth(&self, ctx: &RequestContext) -> i32;

    /// Narrow the owned collections an activity is forwarded to.
    async fn filter_forwarding(
        &self,
        _ctx: &RequestContext,
        potential_recipients: Vec<Url>,
        _activity: &ApObject,
    ) -> AppResult<Vec<Url>> {
        Ok(potential_recipients)
    }

    /// The inbox page served on GET.
    async fn get_inbox(&self, ctx: &RequestContext, inbox: &Url) -> AppResult<ApObject>;
}

/// Every IRI tangentially involved in an activity.
///
/// Covers the activity id, `inReplyTo`, and `to`/`cc` of the activity and of
/// each embedded object, minus Public, deduplicated in order.
#[must_use]
pub fn involved_iris(activity: &ApObject) -> Vec<Url> {
    let mut iris = Vec::new();
    iris.extend(activity.id());
    collect_addressing(activity, &mut iris);
    for object in activity.values("object") {
        match object.as_object() {
            Some(embedded) => {
                iris.extend(embedded.id());
                collect_addressing(embedded, &mut iris);
            }
            None => iris.extend(object.id()),
        }
    }

    let mut seen = HashSet::new();
    iris.into_iter()
        .filter(|iri| !is_public(iri.as_str()) && seen.insert(iri.to_string()))
        .collect()
}

fn collect_addressing(object: &ApObject, iris: &mut Vec<Url>) {
    for key in ["inReplyTo", "to", "cc"] {
        iris.extend(object.ids(key));
    }
}
