//! In-memory [`Database`].
//!
//! Everything on the configured host is ours. Local actors live at
//! `/users/{name}` with their boxes and collections underneath, and new
//! objects are minted at `/{kind}/{ulid}`.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use outpost_common::{AppError, AppResult, IdGenerator};
use serde_json::json;
use url::Url;

use crate::database::Database;
use crate::lock::{IriGuard, LockTable};
use crate::object::{AS_CONTEXT, ApObject, same_origin};

const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// Objects keyed by id, plus the lock table guarding them.
#[derive(Debug)]
pub struct MemoryDatabase {
    base: Url,
    ids: IdGenerator,
    locks: LockTable,
    objects: RwLock<HashMap<String, ApObject>>,
}

impl MemoryDatabase {
    /// Create a new empty database owning everything under `base`.
    #[must_use]
    pub fn new(base: Url) -> Self {
        Self {
            ids: IdGenerator::new(base.clone()),
            base,
            locks: LockTable::new(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    #[must_use]
    pub const fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// The IRI of a local actor.
    pub fn actor_iri(&self, username: &str) -> AppResult<Url> {
        Ok(self.base.join(&format!("/users/{username}"))?)
    }

    /// Seed a local `Person` with empty boxes and collections.
    pub fn add_local_actor(
        &self,
        username: &str,
        name: Option<&str>,
        public_key_pem: &str,
    ) -> AppResult<ApObject> {
        let id = self.actor_iri(username)?;
        let box_iri = |suffix: &str| -> AppResult<Url> {
            Ok(self.base.join(&format!("/users/{username}/{suffix}"))?)
        };
        let inbox = box_iri("inbox")?;
        let outbox = box_iri("outbox")?;
        let followers = box_iri("followers")?;
        let following = box_iri("following")?;
        let liked = box_iri("liked")?;

        let person = ApObject::from_value(json!({
            "@context": [AS_CONTEXT, SECURITY_CONTEXT],
            "id": id.as_str(),
            "type": "Person",
            "preferredUsername": username,
            "name": name.unwrap_or(username),
            "inbox": inbox.as_str(),
            "outbox": outbox.as_str(),
            "followers": followers.as_str(),
            "following": following.as_str(),
            "liked": liked.as_str(),
            "publicKey": {
                "id": format!("{id}#main-key"),
                "owner": id.as_str(),
                "publicKeyPem": public_key_pem,
            },
        }))?;

        self.insert(person.clone())?;
        self.insert(empty_collection(&inbox, "OrderedCollectionPage"))?;
        self.insert(empty_collection(&outbox, "OrderedCollectionPage"))?;
        for collection in [&followers, &following, &liked] {
            self.insert(empty_collection(collection, "OrderedCollection"))?;
        }
        Ok(person)
    }

    /// Store `object` under its id without taking its lock.
    pub fn insert(&self, object: ApObject) -> AppResult<()> {
        let id = object.require_id("stored object")?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), object);
        Ok(())
    }

    /// Read an object without taking its lock.
    #[must_use]
    pub fn snapshot(&self, id: &Url) -> Option<ApObject> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.as_str())
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_actor(&self, property: &str, iri: &Url) -> AppResult<ApObject> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|object| object.contains("inbox") && object.ids(property).contains(iri))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no actor has {property} {iri}")))
    }

    fn actor_collection(&self, actor: &Url, property: &str) -> AppResult<ApObject> {
        let iri = self
            .snapshot(actor)
            .and_then(|object| object.ids(property).into_iter().next())
            .ok_or_else(|| AppError::NotFound(format!("{actor} has no {property}")))?;
        self.snapshot(&iri)
            .ok_or_else(|| AppError::NotFound(iri.to_string()))
    }
}

fn empty_collection(id: &Url, kind: &str) -> ApObject {
    let mut collection = ApObject::new(kind);
    collection.set_id(id);
    collection.set("totalItems", 0);
    collection.set("orderedItems", json!([]));
    collection
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn lock(&self, iri: &Url) -> AppResult<IriGuard> {
        Ok(self.locks.acquire(iri).await)
    }

    async fn inbox_contains(&self, inbox: &Url, id: &Url) -> AppResult<bool> {
        let inbox = self.get(inbox).await?;
        Ok(inbox.items().iter().any(|item| item.id().as_ref() == Some(id)))
    }

    async fn get_inbox(&self, inbox: &Url) -> AppResult<ApObject> {
        self.get(inbox).await
    }

    async fn set_inbox(&self, inbox: &ApObject) -> AppResult<()> {
        self.insert(inbox.clone())
    }

    async fn get_outbox(&self, outbox: &Url) -> AppResult<ApObject> {
        self.get(outbox).await
    }

    async fn set_outbox(&self, outbox: &ApObject) -> AppResult<()> {
        self.insert(outbox.clone())
    }

    async fn owns(&self, id: &Url) -> AppResult<bool> {
        Ok(same_origin(&self.base, id))
    }

    async fn actor_for_outbox(&self, outbox: &Url) -> AppResult<Url> {
        self.find_actor("outbox", outbox)?.require_id("actor")
    }

    async fn actor_for_inbox(&self, inbox: &Url) -> AppResult<Url> {
        self.find_actor("inbox", inbox)?.require_id("actor")
    }

    async fn outbox_for_inbox(&self, inbox: &Url) -> AppResult<Url> {
        self.find_actor("inbox", inbox)?
            .ids("outbox")
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("no outbox next to {inbox}")))
    }

    async fn inboxes_for_iri(&self, iri: &Url) -> AppResult<Vec<Url>> {
        Ok(self
            .snapshot(iri)
            .map(|object| object.ids("inbox"))
            .unwrap_or_default())
    }

    async fn exists(&self, id: &Url) -> AppResult<bool> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id.as_str()))
    }

    async fn get(&self, id: &Url) -> AppResult<ApObject> {
        self.snapshot(id)
            .ok_or_else(|| AppError::NotFound(id.to_string()))
    }

    async fn create(&self, object: &ApObject) -> AppResult<()> {
        let id = object.require_id("stored object")?;
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        if objects.contains_key(id.as_str()) {
            return Err(AppError::Conflict(format!("{id} already exists")));
        }
        objects.insert(id.to_string(), object.clone());
        Ok(())
    }

    async fn update(&self, object: &ApObject) -> AppResult<()> {
        self.insert(object.clone())
    }

    async fn delete(&self, id: &Url) -> AppResult<()> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id.as_str());
        Ok(())
    }

    async fn new_id(&self, object: &ApObject) -> AppResult<Url> {
        self.ids.iri(object.type_name().unwrap_or_default())
    }

    async fn followers(&self, actor: &Url) -> AppResult<ApObject> {
        self.actor_collection(actor, "followers")
    }

    async fn following(&self, actor: &Url) -> AppResult<ApObject> {
        self.actor_collection(actor, "following")
    }

    async fn liked(&self, actor: &Url) -> AppResult<ApObject> {
        self.actor_collection(actor, "liked")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn database() -> MemoryDatabase {
        MemoryDatabase::new(Url::parse("https://local.example").unwrap())
    }

    #[tokio::test]
    async fn test_local_actor_layout() {
        let db = database();
        db.add_local_actor("alice", None, "PEM").unwrap();

        let alice = db.actor_iri("alice").unwrap();
        let inbox = Url::parse("https://local.example/users/alice/inbox").unwrap();
        let outbox = Url::parse("https://local.example/users/alice/outbox").unwrap();

        assert_eq!(db.actor_for_inbox(&inbox).await.unwrap(), alice);
        assert_eq!(db.actor_for_outbox(&outbox).await.unwrap(), alice);
        assert_eq!(db.outbox_for_inbox(&inbox).await.unwrap(), outbox);
        assert!(db.followers(&alice).await.unwrap().is_collection());
        assert_eq!(db.inboxes_for_iri(&alice).await.unwrap(), vec![inbox]);
    }

    #[tokio::test]
    async fn test_create_never_overwrites() {
        let db = database();
        db.add_local_actor("alice", None, "PEM").unwrap();
        let alice = db.actor_iri("alice").unwrap();

        let mut impostor = ApObject::new("Note");
        impostor.set_id(&alice);
        assert!(matches!(
            db.create(&impostor).await,
            Err(AppError::Conflict(_))
        ));
        assert!(db.get(&alice).await.unwrap().is_type("Person"));
    }

    #[tokio::test]
    async fn test_ownership_is_by_origin() {
        let db = database();
        assert!(db.owns(&Url::parse("https://local.example/notes/1").unwrap()).await.unwrap());
        assert!(!db.owns(&Url::parse("https://remote.example/notes/1").unwrap()).await.unwrap());
        assert!(!db.owns(&Url::parse("http://local.example/notes/1").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_new_id_uses_type_segment() {
        let db = database();
        let id = db.new_id(&ApObject::new("Note")).await.unwrap();
        assert!(id.as_str().starts_with("https://local.example/note/"));
        assert!(matches!(
            db.get(&id).await,
            Err(AppError::NotFound(_))
        ));
    }
}
