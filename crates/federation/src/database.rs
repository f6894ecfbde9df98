//! Storage seam consumed by the engine.
//!
//! Implementations own persistence. The engine brackets every
//! read-then-write of a resource with [`Database::lock`] on its IRI; the
//! lock says nothing about whether the resource exists.

use async_trait::async_trait;
use outpost_common::AppResult;
use url::Url;

use crate::lock::IriGuard;
use crate::object::ApObject;

#[async_trait]
pub trait Database: Send + Sync {
    /// Exclusive access to `iri` until the guard drops.
    async fn lock(&self, iri: &Url) -> AppResult<IriGuard>;

    /// Whether the inbox already lists `id`.
    async fn inbox_contains(&self, inbox: &Url, id: &Url) -> AppResult<bool>;

    /// The latest inbox page, as an `OrderedCollectionPage`.
    async fn get_inbox(&self, inbox: &Url) -> AppResult<ApObject>;

    /// Persist an inbox page returned by [`Database::get_inbox`].
    async fn set_inbox(&self, inbox: &ApObject) -> AppResult<()>;

    /// The latest outbox page, as an `OrderedCollectionPage`.
    async fn get_outbox(&self, outbox: &Url) -> AppResult<ApObject>;

    async fn set_outbox(&self, outbox: &ApObject) -> AppResult<()>;

    /// Whether `id` is hosted by this server.
    async fn owns(&self, id: &Url) -> AppResult<bool>;

    async fn actor_for_outbox(&self, outbox: &Url) -> AppResult<Url>;

    async fn actor_for_inbox(&self, inbox: &Url) -> AppResult<Url>;

    async fn outbox_for_inbox(&self, inbox: &Url) -> AppResult<Url>;

    /// Inboxes already known for an actor or collection IRI.
    ///
    /// An empty result means "unknown here", and the caller dereferences
    /// the IRI instead.
    async fn inboxes_for_iri(&self, _iri: &Url) -> AppResult<Vec<Url>> {
        Ok(Vec::new())
    }

    /// Whether anything with this id has been stored.
    async fn exists(&self, id: &Url) -> AppResult<bool>;

    /// Fetch a stored object. Missing ids are a `NotFound` error.
    async fn get(&self, id: &Url) -> AppResult<ApObject>;

    /// Store a new object. An existing id is a `Conflict` error.
    async fn create(&self, object: &ApObject) -> AppResult<()>;

    async fn update(&self, object: &ApObject) -> AppResult<()>;

    async fn delete(&self, id: &Url) -> AppResult<()>;

    /// Mint a fresh id for a locally created object.
    async fn new_id(&self, object: &ApObject) -> AppResult<Url>;

    async fn followers(&self, actor: &Url) -> AppResult<ApObject>;

    async fn following(&self, actor: &Url) -> AppResult<ApObject>;

    async fn liked(&self, actor: &Url) -> AppResult<ApObject>;
}
