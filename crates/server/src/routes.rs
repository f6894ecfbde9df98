//! Endpoints served next to the inbox and outbox.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use outpost_common::{AppError, AppResult};
use outpost_federation::media_type::CONTENT_TYPE_LD_JSON;
use outpost_federation::{Database, MemoryDatabase};

#[derive(Clone)]
struct ActorDocumentState {
    db: Arc<MemoryDatabase>,
}

/// Mount `GET /users/{username}` for the actors held in `db`.
pub fn actor_documents(db: Arc<MemoryDatabase>) -> Router {
    Router::new()
        .route("/users/{username}", get(actor_document))
        .with_state(ActorDocumentState { db })
}

async fn actor_document(
    State(state): State<ActorDocumentState>,
    Path(username): Path<String>,
) -> AppResult<Response> {
    let iri = state.db.actor_iri(&username)?;
    let actor = {
        let _guard = state.db.lock(&iri).await?;
        state.db.get(&iri).await?
    };
    if !actor.contains("inbox") {
        return Err(AppError::NotFound(format!("no actor named {username}")));
    }

    let mut response = (StatusCode::OK, actor.to_bytes()?).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(CONTENT_TYPE_LD_JSON),
    );
    Ok(response)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;
    use url::Url;

    fn router() -> Router {
        let db = Arc::new(MemoryDatabase::new(
            Url::parse("https://local.example").unwrap(),
        ));
        db.add_local_actor("alice", None, "PEM").unwrap();
        actor_documents(db)
    }

    async fn get(path: &str) -> Response {
        router()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_serves_local_actor() {
        let response = get("/users/alice").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_LD_JSON
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let actor: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(actor["id"], "https://local.example/users/alice");
        assert_eq!(actor["publicKey"]["publicKeyPem"], "PEM");
    }

    #[tokio::test]
    async fn test_unknown_actor_is_not_found() {
        assert_eq!(get("/users/nobody").await.status(), StatusCode::NOT_FOUND);
    }
}
