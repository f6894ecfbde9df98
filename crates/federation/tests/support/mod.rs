//! Shared fixtures for the inbox and outbox tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header, request::Parts};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use outpost_common::{AppError, AppResult, OnFollow};
use outpost_federation::{
    Actor, ApObject, Authentication, BlockStatus, CallbackOverrides, CommonBehavior, Database,
    FederatingProtocol, FederatingWrappedCallbacks, FixedClock, MemoryDatabase, Property,
    RequestContext, SideEffectActor, SignatureAuthenticator, SocialProtocol, Transport, handler,
};
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;

pub const LOCAL: &str = "https://local.example";
pub const REMOTE: &str = "https://remote.example";
pub const ACTIVITY_JSON: &str = "application/activity+json";

pub fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// A remote actor document with its own inbox.
pub fn remote_actor(name: &str, public_key_pem: Option<&str>) -> ApObject {
    let id = format!("{REMOTE}/users/{name}");
    let mut actor = json!({
        "id": id,
        "type": "Person",
        "preferredUsername": name,
        "inbox": format!("{id}/inbox"),
        "outbox": format!("{id}/outbox"),
    });
    if let Some(pem) = public_key_pem {
        actor["publicKey"] = json!({
            "id": format!("{id}#main-key"),
            "owner": id,
            "publicKeyPem": pem,
        });
    }
    ApObject::from_value(actor).unwrap()
}

/// Serves canned documents and records every POST.
#[derive(Default)]
pub struct FakeTransport {
    documents: Mutex<HashMap<String, ApObject>>,
    deliveries: Mutex<Vec<(Url, Value)>>,
}

impl FakeTransport {
    pub fn serve(&self, object: ApObject) {
        let id = object.id().unwrap();
        self.documents
            .lock()
            .unwrap()
            .insert(id.to_string(), object);
    }

    pub fn deliveries(&self) -> Vec<(Url, Value)> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Target inboxes in delivery order.
    pub fn delivered_to(&self) -> Vec<String> {
        self.deliveries()
            .into_iter()
            .map(|(to, _)| to.to_string())
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dereference(&self, _ctx: &RequestContext, iri: &Url) -> AppResult<ApObject> {
        self.documents
            .lock()
            .unwrap()
            .get(iri.as_str())
            .cloned()
            .ok_or_else(|| AppError::NotFound(iri.to_string()))
    }

    async fn deliver(&self, _ctx: &RequestContext, payload: Bytes, to: &Url) -> AppResult<()> {
        let payload: Value = serde_json::from_slice(&payload)?;
        self.deliveries.lock().unwrap().push((to.clone(), payload));
        Ok(())
    }
}

/// Application side of the tests: every knob the engine asks about.
pub struct TestProtocol {
    pub db: Arc<MemoryDatabase>,
    pub transport: Arc<FakeTransport>,
    pub authenticator: Option<SignatureAuthenticator>,
    pub blocked_hosts: Vec<String>,
    pub on_follow: OnFollow,
    pub wrapped: FederatingWrappedCallbacks,
    pub overrides: CallbackOverrides,
    pub forwarding_depth: i32,
    pub delivery_depth: i32,
    pub default_calls: AtomicUsize,
}

impl TestProtocol {
    fn new(db: Arc<MemoryDatabase>, transport: Arc<FakeTransport>) -> Self {
        Self {
            db,
            transport,
            authenticator: None,
            blocked_hosts: Vec::new(),
            on_follow: OnFollow::AutomaticallyAccept,
            wrapped: FederatingWrappedCallbacks::default(),
            overrides: CallbackOverrides::default(),
            forwarding_depth: 4,
            delivery_depth: 4,
            default_calls: AtomicUsize::new(0),
        }
    }

    fn is_blocked(&self, iri: &Url) -> bool {
        iri.host_str()
            .is_some_and(|host| self.blocked_hosts.iter().any(|b| b == host))
    }
}

#[async_trait]
impl CommonBehavior for TestProtocol {
    async fn authenticate_get_inbox(
        &self,
        ctx: RequestContext,
        _request: &Parts,
    ) -> AppResult<Authentication> {
        Ok(Authentication::Granted(ctx))
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
impl FederatingProtocol for TestProtocol {
    async fn authenticate_post_inbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
        body: &[u8],
    ) -> AppResult<Authentication> {
        match &self.authenticator {
            Some(authenticator) => {
                authenticator
                    .authenticate(ctx, request, body, self.transport.as_ref())
                    .await
            }
            None => Ok(Authentication::Granted(ctx)),
        }
    }

    async fn blocked(&self, ctx: &RequestContext, actor_iris: &[Url]) -> AppResult<BlockStatus> {
        if actor_iris.iter().any(|iri| self.is_blocked(iri)) {
            return Ok(BlockStatus::Actor);
        }
        if ctx.involved_iris.iter().any(|iri| self.is_blocked(iri)) {
            return Ok(BlockStatus::OtherIri);
        }
        Ok(BlockStatus::None)
    }

    async fn federating_callbacks(
        &self,
        _ctx: &RequestContext,
    ) -> AppResult<(FederatingWrappedCallbacks, CallbackOverrides)> {
        Ok((
            self.wrapped.clone().with_on_follow(self.on_follow),
            self.overrides.clone(),
        ))
    }

    async fn default_callback(&self, _ctx: &RequestContext, _activity: &ApObject) -> AppResult<()> {
        self.default_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn max_inbox_forwarding_recursion_depth(&self, _ctx: &RequestContext) -> i32 {
        self.forwarding_depth
    }

    fn max_delivery_recursion_depth(&self, _ctx: &RequestContext) -> i32 {
        self.delivery_depth
    }

    async fn get_inbox(&self, _ctx: &RequestContext, inbox: &Url) -> AppResult<ApObject> {
        let _guard = self.db.lock(inbox).await?;
        self.db.get_inbox(inbox).await
    }
}

#[async_trait]
impl SocialProtocol for TestProtocol {
    async fn authenticate_post_outbox(
        &self,
        ctx: RequestContext,
        _request: &Parts,
    ) -> AppResult<Authentication> {
        Ok(Authentication::Granted(ctx))
    }
}

/// One local actor, `alice`, behind the full router.
pub struct Harness {
    pub db: Arc<MemoryDatabase>,
    pub transport: Arc<FakeTransport>,
    pub protocol: Arc<TestProtocol>,
    pub router: Router,
    pub alice: Url,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(configure: impl FnOnce(&mut TestProtocol)) -> Self {
        let base = url(LOCAL);
        let db = Arc::new(MemoryDatabase::new(base.clone()));
        let alice = db
            .add_local_actor("alice", Some("Alice"), "PEM")
            .unwrap()
            .id()
            .unwrap();
        let transport = Arc::new(FakeTransport::default());

        let mut protocol = TestProtocol::new(db.clone(), transport.clone());
        configure(&mut protocol);
        let protocol = Arc::new(protocol);

        let side_effect = SideEffectActor::new(protocol.clone(), db.clone(), Arc::new(FixedClock(now())))
            .with_federating(protocol.clone())
            .with_social(protocol.clone());
        let actor = Actor::new(side_effect, base).deliver_in_background(false);

        Self {
            db,
            transport,
            protocol,
            router: handler::router(actor),
            alice,
        }
    }

    pub fn alice_iri(&self, suffix: &str) -> Url {
        url(&format!("{}/{suffix}", self.alice))
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn post(&self, path: &str, body: &Value) -> Response {
        let request = Request::post(path)
            .header(header::CONTENT_TYPE, ACTIVITY_JSON)
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap();
        self.send(request).await
    }

    pub async fn post_inbox(&self, body: &Value) -> StatusCode {
        self.post("/users/alice/inbox", body).await.status()
    }

    pub async fn get(&self, path: &str) -> Response {
        let request = Request::get(path)
            .header(header::ACCEPT, ACTIVITY_JSON)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// Stored object, read without locking.
    pub fn stored(&self, id: &Url) -> Option<ApObject> {
        self.db.snapshot(id)
    }

    /// Ids held by one of alice's collections or boxes.
    pub fn item_ids(&self, suffix: &str) -> Vec<String> {
        self.stored(&self.alice_iri(suffix))
            .unwrap()
            .items()
            .iter()
            .filter_map(Property::id)
            .map(String::from)
            .collect()
    }

    /// Put `members` into one of alice's collections.
    pub fn fill(&self, suffix: &str, members: &[&str]) {
        let mut collection = self.stored(&self.alice_iri(suffix)).unwrap();
        for member in members {
            collection.append_item(Property::Iri(url(member)));
        }
        self.db.insert(collection).unwrap();
    }

    pub fn default_calls(&self) -> usize {
        self.protocol.default_calls.load(Ordering::SeqCst)
    }
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Counts calls and remembers the last requesting actor.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<AtomicUsize>,
    requester: Arc<Mutex<Option<Url>>>,
}

impl Recorder {
    pub fn handler(&self) -> Arc<dyn outpost_federation::ActivityHandler> {
        let recorder = self.clone();
        outpost_federation::handler_fn(move |ctx, _activity| {
            let recorder = recorder.clone();
            async move {
                recorder.calls.fetch_add(1, Ordering::SeqCst);
                *recorder.requester.lock().unwrap() = ctx.requesting_actor;
                Ok(())
            }
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requester(&self) -> Option<Url> {
        self.requester.lock().unwrap().clone()
    }
}
