//! Axum routes for actor inboxes and outboxes.

use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use outpost_common::AppResult;

use crate::actor::Actor;

/// Mount `/users/{username}/inbox` and `/users/{username}/outbox`.
///
/// Requests that are not ActivityPub get 415 on POST and 406 on GET.
pub fn router<S>(actor: Actor) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route(
            "/users/{username}/inbox",
            get(get_inbox).post(post_inbox),
        )
        .route(
            "/users/{username}/outbox",
            get(get_outbox).post(post_outbox),
        )
        .with_state(actor)
}

async fn post_inbox(State(actor): State<Actor>, request: Request) -> AppResult<Response> {
    Ok(actor
        .post_inbox(request)
        .await?
        .unwrap_or_else(unsupported_media_type))
}

async fn get_inbox(State(actor): State<Actor>, request: Request) -> AppResult<Response> {
    Ok(actor.get_inbox(request).await?.unwrap_or_else(not_acceptable))
}

async fn post_outbox(State(actor): State<Actor>, request: Request) -> AppResult<Response> {
    Ok(actor
        .post_outbox(request)
        .await?
        .unwrap_or_else(unsupported_media_type))
}

async fn get_outbox(State(actor): State<Actor>, request: Request) -> AppResult<Response> {
    Ok(actor.get_outbox(request).await?.unwrap_or_else(not_acceptable))
}

fn unsupported_media_type() -> Response {
    StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response()
}

fn not_acceptable() -> Response {
    StatusCode::NOT_ACCEPTABLE.into_response()
}
