//! Default side effects for activities posted to an outbox.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::SecondsFormat;
use outpost_common::{AppError, AppResult};
use tracing::debug;
use url::Url;

use super::shared::{
    Resolver, add_to_targets, remove_from_targets, require_actors_match_objects, require_objects,
};
use super::{ActivityHandler, CallbackOverrides, run_hook};
use crate::context::RequestContext;
use crate::object::{ActivityKind, ApObject, Property, RECIPIENT_PROPERTIES};
use crate::protocol::SocialProtocol;
use crate::side_effect::SideEffectActor;

/// Hooks run after the built-in outbox defaults.
#[derive(Clone, Default)]
pub struct SocialWrappedCallbacks {
    pub create: Option<Arc<dyn ActivityHandler>>,
    pub update: Option<Arc<dyn ActivityHandler>>,
    pub delete: Option<Arc<dyn ActivityHandler>>,
    pub follow: Option<Arc<dyn ActivityHandler>>,
    pub accept: Option<Arc<dyn ActivityHandler>>,
    pub reject: Option<Arc<dyn ActivityHandler>>,
    pub add: Option<Arc<dyn ActivityHandler>>,
    pub remove: Option<Arc<dyn ActivityHandler>>,
    pub like: Option<Arc<dyn ActivityHandler>>,
    pub announce: Option<Arc<dyn ActivityHandler>>,
    pub undo: Option<Arc<dyn ActivityHandler>>,
    /// Runs after a Block is recorded. The Block itself is never delivered.
    pub block: Option<Arc<dyn ActivityHandler>>,
}

impl SocialWrappedCallbacks {
    fn hook(&self, kind: &ActivityKind) -> Option<&Arc<dyn ActivityHandler>> {
        match kind {
            ActivityKind::Create => self.create.as_ref(),
            ActivityKind::Update => self.update.as_ref(),
            ActivityKind::Delete => self.delete.as_ref(),
            ActivityKind::Follow => self.follow.as_ref(),
            ActivityKind::Accept => self.accept.as_ref(),
            ActivityKind::Reject => self.reject.as_ref(),
            ActivityKind::Add => self.add.as_ref(),
            ActivityKind::Remove => self.remove.as_ref(),
            ActivityKind::Like => self.like.as_ref(),
            ActivityKind::Announce => self.announce.as_ref(),
            ActivityKind::Undo => self.undo.as_ref(),
            ActivityKind::Block => self.block.as_ref(),
            ActivityKind::Other(_) => None,
        }
    }
}

/// Callbacks resolved for one outbox POST.
pub(crate) struct SocialScope<'a> {
    pub(crate) actor: &'a SideEffectActor,
    pub(crate) protocol: &'a dyn SocialProtocol,
    pub(crate) outbox: &'a Url,
    pub(crate) wrapped: SocialWrappedCallbacks,
    pub(crate) overrides: CallbackOverrides,
    /// Set when the activity must stay on this server.
    pub(crate) undeliverable: bool,
}

impl SocialScope<'_> {
    /// Run exactly one handler for `activity`, which defaults may rewrite.
    pub(crate) async fn dispatch(
        &mut self,
        ctx: &RequestContext,
        activity: &mut ApObject,
    ) -> AppResult<()> {
        let kind = activity.activity_kind().ok_or_else(|| {
            AppError::NotActivity(activity.type_name().unwrap_or("untyped").to_string())
        })?;

        if let Some(handler) = self.overrides.get(&kind) {
            debug!(kind = %kind, "Dispatching outbox activity to override");
            return handler.handle(ctx, activity).await;
        }

        let resolver = Resolver::new(self.actor, self.outbox);
        match &kind {
            ActivityKind::Create => self.create(activity).await?,
            ActivityKind::Update => self.update(activity).await?,
            ActivityKind::Delete => self.delete(activity).await?,
            ActivityKind::Follow | ActivityKind::Announce => {
                require_objects(activity)?;
            }
            ActivityKind::Accept | ActivityKind::Reject => {}
            ActivityKind::Add => add_to_targets(self.actor.db(), activity).await?,
            ActivityKind::Remove => remove_from_targets(self.actor.db(), activity).await?,
            ActivityKind::Like => self.like(activity).await?,
            ActivityKind::Undo => require_actors_match_objects(ctx, &resolver, activity).await?,
            ActivityKind::Block => {
                self.undeliverable = true;
                require_objects(activity)?;
            }
            ActivityKind::Other(_) => return self.protocol.default_callback(ctx, activity).await,
        }
        run_hook(self.wrapped.hook(&kind), ctx, activity).await
    }

    async fn create(&self, activity: &mut ApObject) -> AppResult<()> {
        let objects = require_objects(activity)?;
        let actors = activity.ids("actor");
        if actors.is_empty() {
            return Err(AppError::BadRequest("Create has no actor".into()));
        }

        let mut created = Vec::with_capacity(objects.len());
        for object in objects {
            match object {
                Property::Object(object) => created.push(object),
                Property::Iri(iri) => {
                    return Err(AppError::BadRequest(format!(
                        "cannot create {iri}: the object must be embedded"
                    )));
                }
            }
        }

        normalize_recipients(activity, &mut created);
        for object in &mut created {
            object.set_iris("attributedTo", &actors);
        }
        let values: Vec<Property> = created.iter().cloned().map(Property::Object).collect();
        activity.set_values("object", &values);

        let db = self.actor.db();
        for object in &created {
            let id = object.require_id("created object")?;
            let _guard = db.lock(&id).await?;
            db.create(object).await?;
        }
        Ok(())
    }

    async fn update(&self, activity: &ApObject) -> AppResult<()> {
        let db = self.actor.db();
        for object in require_objects(activity)? {
            let Property::Object(patch) = object else {
                return Err(AppError::BadRequest(
                    "an Update must carry the changed fields, not an IRI".into(),
                ));
            };
            let id = patch.require_id("updated object")?;
            let _guard = db.lock(&id).await?;
            let mut stored = db.get(&id).await?;
            for (key, value) in patch.as_map() {
                if key == "@context" {
                    continue;
                }
                if value.is_null() {
                    stored.remove(key);
                } else {
                    stored.set(key, value.clone());
                }
            }
            db.update(&stored).await?;
        }
        Ok(())
    }

    async fn delete(&self, activity: &ApObject) -> AppResult<()> {
        let db = self.actor.db();
        let now = self.actor.clock().now();
        for id in require_objects(activity)?.iter().filter_map(Property::id) {
            let _guard = db.lock(&id).await?;
            let stored = db.get(&id).await?;
            let mut tombstone = ApObject::new("Tombstone");
            tombstone.set_id(&id);
            if let Some(former) = stored.type_name() {
                tombstone.set("formerType", former);
            }
            for key in ["published", "updated"] {
                if let Some(value) = stored.get(key) {
                    tombstone.set(key, value.clone());
                }
            }
            tombstone.set("deleted", now.to_rfc3339_opts(SecondsFormat::Secs, true));
            db.update(&tombstone).await?;
        }
        Ok(())
    }

    async fn like(&self, activity: &ApObject) -> AppResult<()> {
        let object_ids: Vec<Url> = require_objects(activity)?
            .iter()
            .filter_map(Property::id)
            .collect();
        let db = self.actor.db();
        let me = {
            let _guard = db.lock(self.outbox).await?;
            db.actor_for_outbox(self.outbox).await?
        };
        let _guard = db.lock(&me).await?;
        let mut liked = db.liked(&me).await?;
        for id in object_ids {
            liked.prepend_item(Property::Iri(id));
        }
        db.update(&liked).await
    }
}

/// Share addressing between a Create and the objects it creates.
///
/// Each object gains the activity's recipients, and the activity gains the
/// recipients of every object.
fn normalize_recipients(activity: &mut ApObject, objects: &mut [ApObject]) {
    for key in RECIPIENT_PROPERTIES {
        let from_activity = activity.ids(key);
        let mut merged = from_activity.clone();
        for object in objects.iter_mut() {
            let own = object.ids(key);
            merged = union(merged, &own);
            let combined = union(own, &from_activity);
            if !combined.is_empty() {
                object.set_iris(key, &combined);
            }
        }
        if !merged.is_empty() {
            activity.set_iris(key, &merged);
        }
    }
}

fn union(mut base: Vec<Url>, extra: &[Url]) -> Vec<Url> {
    let mut seen: HashSet<String> = base.iter().map(ToString::to_string).collect();
    for iri in extra {
        if seen.insert(iri.to_string()) {
            base.push(iri.clone());
        }
    }
    base
}
