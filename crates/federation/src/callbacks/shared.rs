//! Pieces shared by the inbox and outbox defaults.

use std::collections::HashSet;
use std::sync::Arc;

use outpost_common::{AppError, AppResult};
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use crate::context::RequestContext;
use crate::database::Database;
use crate::object::{ApObject, Property, same_origin};
use crate::side_effect::SideEffectActor;
use crate::transport::Transport;

/// The `object` values, which must not be empty.
pub(super) fn require_objects(activity: &ApObject) -> AppResult<Vec<Property>> {
    let objects = activity.values("object");
    if objects.is_empty() {
        return Err(AppError::ObjectRequired);
    }
    Ok(objects)
}

/// The `target` values, which must not be empty.
pub(super) fn require_targets(activity: &ApObject) -> AppResult<Vec<Property>> {
    let targets = activity.values("target");
    if targets.is_empty() {
        return Err(AppError::TargetRequired);
    }
    Ok(targets)
}

/// Every object must live on the same origin as one of the activity's actors.
pub(super) fn require_origin_match(activity: &ApObject) -> AppResult<()> {
    let actors = activity.ids("actor");
    if actors.is_empty() {
        return Err(AppError::BadRequest(format!(
            "{} has no actor",
            activity.type_name().unwrap_or("activity")
        )));
    }
    for object in require_objects(activity)? {
        let id = object
            .id()
            .ok_or_else(|| AppError::BadRequest("object has no id".into()))?;
        if !actors.iter().any(|actor| same_origin(actor, &id)) {
            return Err(AppError::OriginMismatch(format!(
                "{id} is not hosted alongside the activity's actor"
            )));
        }
    }
    Ok(())
}

/// Dereferences bare IRIs with a transport created on first use.
pub(super) struct Resolver<'a> {
    actor: &'a SideEffectActor,
    box_iri: &'a Url,
    transport: OnceCell<Arc<dyn Transport>>,
}

impl<'a> Resolver<'a> {
    pub(super) fn new(actor: &'a SideEffectActor, box_iri: &'a Url) -> Self {
        Self {
            actor,
            box_iri,
            transport: OnceCell::new(),
        }
    }

    pub(super) async fn resolve(
        &self,
        ctx: &RequestContext,
        value: Property,
    ) -> AppResult<ApObject> {
        match value {
            Property::Object(object) => Ok(object),
            Property::Iri(iri) => {
                let transport = self
                    .transport
                    .get_or_try_init(|| self.actor.new_transport(ctx, self.box_iri))
                    .await?;
                transport.dereference(ctx, &iri).await
            }
        }
    }
}

/// Every actor of every object must also be an actor of the activity.
pub(super) async fn require_actors_match_objects(
    ctx: &RequestContext,
    resolver: &Resolver<'_>,
    activity: &ApObject,
) -> AppResult<()> {
    let objects = require_objects(activity)?;
    let actors: HashSet<String> = activity
        .ids("actor")
        .into_iter()
        .map(String::from)
        .collect();

    for object in objects {
        let object = resolver.resolve(ctx, object).await?;
        let object_actors = object.ids("actor");
        if object_actors.is_empty() {
            return Err(AppError::BadRequest(
                "cannot verify actors: object has no actor".into(),
            ));
        }
        if let Some(stray) = object_actors
            .iter()
            .find(|actor| !actors.contains(actor.as_str()))
        {
            return Err(AppError::BadRequest(format!(
                "activity does not include {stray}, an actor of its object"
            )));
        }
    }
    Ok(())
}

/// Add every object id to every locally owned target collection.
pub(super) async fn add_to_targets(db: &dyn Database, activity: &ApObject) -> AppResult<()> {
    let object_ids: Vec<Url> = require_objects(activity)?
        .iter()
        .filter_map(Property::id)
        .collect();
    for target in require_targets(activity)?.iter().filter_map(Property::id) {
        let _guard = db.lock(&target).await?;
        if !db.owns(&target).await? {
            continue;
        }
        let mut collection = owned_collection(db, &target).await?;
        for id in &object_ids {
            collection.append_item(Property::Iri(id.clone()));
        }
        db.update(&collection).await?;
    }
    Ok(())
}

/// Drop every object id from every locally owned target collection.
pub(super) async fn remove_from_targets(db: &dyn Database, activity: &ApObject) -> AppResult<()> {
    let object_ids: Vec<Url> = require_objects(activity)?
        .iter()
        .filter_map(Property::id)
        .collect();
    for target in require_targets(activity)?.iter().filter_map(Property::id) {
        let _guard = db.lock(&target).await?;
        if !db.owns(&target).await? {
            continue;
        }
        let mut collection = owned_collection(db, &target).await?;
        for id in &object_ids {
            collection.remove_item(id);
        }
        db.update(&collection).await?;
    }
    Ok(())
}

async fn owned_collection(db: &dyn Database, iri: &Url) -> AppResult<ApObject> {
    let collection = db.get(iri).await?;
    if !collection.is_collection() {
        return Err(AppError::BadRequest(format!(
            "{iri} is neither a Collection nor an OrderedCollection"
        )));
    }
    Ok(collection)
}

/// Record the activity in the `likes` or `shares` collection of each owned object.
pub(super) async fn add_reaction(
    db: &dyn Database,
    activity: &ApObject,
    property: &str,
) -> AppResult<()> {
    let objects = require_objects(activity)?;
    let activity_id = activity.require_id("activity")?;

    for object_id in objects.iter().filter_map(Property::id) {
        let _guard = db.lock(&object_id).await?;
        if !db.owns(&object_id).await? {
            debug!(object = %object_id, property, "Reaction to a remote object, skipping");
            continue;
        }
        let mut stored = db.get(&object_id).await?;
        match stored.values(property).into_iter().next() {
            None => {
                let mut collection = embedded_collection();
                collection.append_item(Property::Iri(activity_id.clone()));
                stored.set(property, collection.into_value());
                db.update(&stored).await?;
            }
            Some(Property::Object(mut collection)) => {
                if !collection.is_collection() {
                    return Err(AppError::BadRequest(format!(
                        "{property} of {object_id} is not a collection"
                    )));
                }
                collection.append_item(Property::Iri(activity_id.clone()));
                stored.set(property, collection.into_value());
                db.update(&stored).await?;
            }
            Some(Property::Iri(collection_iri)) => {
                if collection_iri == object_id {
                    return Err(AppError::BadRequest(format!(
                        "{property} of {object_id} points back at the object"
                    )));
                }
                let _collection_guard = db.lock(&collection_iri).await?;
                if !db.owns(&collection_iri).await? {
                    return Err(AppError::BadRequest(format!(
                        "{property} of {object_id} is hosted elsewhere"
                    )));
                }
                let mut collection = owned_collection(db, &collection_iri).await?;
                collection.append_item(Property::Iri(activity_id.clone()));
                db.update(&collection).await?;
            }
        }
    }
    Ok(())
}

fn embedded_collection() -> ApObject {
    let mut collection = ApObject::new("Collection");
    collection.remove("@context");
    collection.set("totalItems", 0);
    collection
}
