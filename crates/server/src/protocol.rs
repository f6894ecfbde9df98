//! The instance's answers to the federation engine's questions.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode, header, request::Parts};
use outpost_common::{AppResult, FederationConfig};
use outpost_federation::{
    ApObject, Authentication, BlockStatus, CallbackOverrides, CommonBehavior, Database,
    FederatingProtocol, FederatingWrappedCallbacks, MemoryDatabase, RequestContext,
    SignatureAuthenticator, SocialProtocol, Transport,
};
use tracing::debug;
use url::Url;

/// Single-actor policy: domain blocks, signed inbox POSTs and a bearer
/// token for the owner's own requests.
pub struct InstanceProtocol {
    db: Arc<MemoryDatabase>,
    transport: Arc<dyn Transport>,
    authenticator: SignatureAuthenticator,
    federation: FederationConfig,
    owner_token: Option<String>,
}

impl InstanceProtocol {
    /// `transport` signs with the local actor's key and is shared by every request.
    pub fn new(
        db: Arc<MemoryDatabase>,
        transport: Arc<dyn Transport>,
        authenticator: SignatureAuthenticator,
        federation: FederationConfig,
        owner_token: Option<String>,
    ) -> Self {
        Self {
            db,
            transport,
            authenticator,
            federation,
            owner_token,
        }
    }

    fn authenticate_owner(&self, ctx: RequestContext, request: &Parts) -> Authentication {
        if bearer_matches(&request.headers, self.owner_token.as_deref()) {
            Authentication::Granted(ctx)
        } else {
            debug!(path = %request.uri.path(), "Missing or wrong owner token");
            Authentication::deny(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Whether the request carries `Authorization: Bearer {token}`.
///
/// Always false when no token is configured.
fn bearer_matches(headers: &HeaderMap, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented.trim() == token)
}

fn block_status(domain_blocks: &[String], actors: &[Url], involved: &[Url]) -> BlockStatus {
    let blocked = |iri: &Url| {
        iri.host_str().is_some_and(|host| {
            domain_blocks
                .iter()
                .any(|blocked| host == blocked || host.ends_with(&format!(".{blocked}")))
        })
    };
    if actors.iter().any(blocked) {
        BlockStatus::Actor
    } else if involved.iter().any(blocked) {
        BlockStatus::OtherIri
    } else {
        BlockStatus::None
    }
}

#[async_trait]
impl CommonBehavior for InstanceProtocol {
    async fn authenticate_get_inbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
    ) -> AppResult<Authentication> {
        Ok(self.authenticate_owner(ctx, request))
    }

    async fn authenticate_get_outbox(
        &self,
        ctx: RequestContext,
        _request: &Parts,
    ) -> AppResult<Authentication> {
        Ok(Authentication::Granted(ctx))
    }

    async fn get_outbox(&self, _ctx: &RequestContext, outbox: &Url) -> AppResult<ApObject> {
        let _guard = self.db.lock(outbox).await?;
        self.db.get_outbox(outbox).await
    }

    async fn new_transport(
        &self,
        _ctx: &RequestContext,
        _box_iri: &Url,
    ) -> AppResult<Arc<dyn Transport>> {
        Ok(self.transport.clone())
    }
}

#[async_trait]
impl FederatingProtocol for InstanceProtocol {
    async fn authenticate_post_inbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
        body: &[u8],
    ) -> AppResult<Authentication> {
        self.authenticator
            .authenticate(ctx, request, body, self.transport.as_ref())
            .await
    }

    async fn blocked(&self, ctx: &RequestContext, actor_iris: &[Url]) -> AppResult<BlockStatus> {
        let mut actors = actor_iris.to_vec();
        actors.extend(ctx.requesting_actor.iter().cloned());
        Ok(block_status(
            &self.federation.domain_blocks,
            &actors,
            &ctx.involved_iris,
        ))
    }

    async fn federating_callbacks(
        &self,
        _ctx: &RequestContext,
    ) -> AppResult<(FederatingWrappedCallbacks, CallbackOverrides)> {
        Ok((
            FederatingWrappedCallbacks::default().with_on_follow(self.federation.on_follow),
            CallbackOverrides::default(),
        ))
    }

    fn max_inbox_forwarding_recursion_depth(&self, _ctx: &RequestContext) -> i32 {
        self.federation.max_inbox_forwarding_recursion_depth
    }

    fn max_delivery_recursion_depth(&self, _ctx: &RequestContext) -> i32 {
        self.federation.max_delivery_recursion_depth
    }

    async fn get_inbox(&self, _ctx: &RequestContext, inbox: &Url) -> AppResult<ApObject> {
        let _guard = self.db.lock(inbox).await?;
        self.db.get_inbox(inbox).await
    }
}

#[async_trait]
impl SocialProtocol for InstanceProtocol {
    async fn authenticate_post_outbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
    ) -> AppResult<Authentication> {
        Ok(self.authenticate_owner(ctx, request))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::HeaderValue;
    use outpost_common::AppError;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn dereference(&self, _ctx: &RequestContext, iri: &Url) -> AppResult<ApObject> {
            Err(AppError::NotFound(iri.to_string()))
        }

        async fn deliver(&self, _ctx: &RequestContext, _payload: Bytes, _to: &Url) -> AppResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(!bearer_matches(&headers, Some("secret")));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(bearer_matches(&headers, Some("secret")));
        assert!(!bearer_matches(&headers, Some("other")));
        assert!(!bearer_matches(&headers, None));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic secret"));
        assert!(!bearer_matches(&headers, Some("secret")));
    }

    #[test]
    fn test_block_status() {
        let blocks = vec!["spam.example".to_string()];

        assert_eq!(
            block_status(&blocks, &[url("https://spam.example/users/x")], &[]),
            BlockStatus::Actor
        );
        assert_eq!(
            block_status(&blocks, &[url("https://eu.spam.example/users/x")], &[]),
            BlockStatus::Actor
        );
        assert_eq!(
            block_status(
                &blocks,
                &[url("https://fine.example/users/y")],
                &[url("https://spam.example/notes/1")],
            ),
            BlockStatus::OtherIri
        );
        assert_eq!(
            block_status(
                &blocks,
                &[url("https://notspam.example/users/y")],
                &[url("https://fine.example/notes/1")],
            ),
            BlockStatus::None
        );
    }

    #[tokio::test]
    async fn test_signer_host_is_block_checked() {
        let db = Arc::new(MemoryDatabase::new(url("https://local.example")));
        let federation = FederationConfig {
            domain_blocks: vec!["spam.example".to_string()],
            ..FederationConfig::default()
        };
        let protocol = InstanceProtocol::new(
            db,
            Arc::new(Offline),
            SignatureAuthenticator::new(Arc::new(outpost_federation::SystemClock)),
            federation,
            None,
        );

        let claimed = [url("https://fine.example/users/y")];
        let ctx = RequestContext::new();
        assert_eq!(
            protocol.blocked(&ctx, &claimed).await.unwrap(),
            BlockStatus::None
        );

        let ctx = RequestContext {
            requesting_actor: Some(url("https://spam.example/users/x")),
            ..RequestContext::new()
        };
        assert_eq!(
            protocol.blocked(&ctx, &claimed).await.unwrap(),
            BlockStatus::Actor
        );
    }
}
