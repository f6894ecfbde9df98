//! Default side effects for activities received in an inbox.

use std::collections::HashSet;
use std::sync::Arc;

use outpost_common::{AppError, AppResult, OnFollow};
use tracing::{debug, info};
use url::Url;

use super::shared::{
    Resolver, add_reaction, add_to_targets, remove_from_targets, require_actors_match_objects,
    require_objects, require_origin_match,
};
use super::{ActivityHandler, CallbackOverrides, run_hook};
use crate::context::RequestContext;
use crate::object::{ActivityKind, ApObject, Property, same_origin};
use crate::protocol::FederatingProtocol;
use crate::side_effect::SideEffectActor;

/// Hooks run after the built-in inbox defaults.
///
/// Each hook only runs when the default for its verb succeeded. An entry in
/// [`CallbackOverrides`] replaces the default and the hook together.
#[derive(Clone, Default)]
pub struct FederatingWrappedCallbacks {
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
    pub block: Option<Arc<dyn ActivityHandler>>,
    /// How to answer a Follow of the inbox owner.
    pub on_follow: OnFollow,
}

impl FederatingWrappedCallbacks {
    #[must_use]
    pub fn with_on_follow(mut self, on_follow: OnFollow) -> Self {
        self.on_follow = on_follow;
        self
    }

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

/// Callbacks resolved for one inbox POST.
pub(crate) struct FederatingScope<'a> {
    pub(crate) actor: &'a SideEffectActor,
    pub(crate) protocol: &'a dyn FederatingProtocol,
    pub(crate) inbox: &'a Url,
    pub(crate) wrapped: FederatingWrappedCallbacks,
    pub(crate) overrides: CallbackOverrides,
}

impl FederatingScope<'_> {
    /// Run exactly one handler for `activity`.
    pub(crate) async fn dispatch(&self, ctx: &RequestContext, activity: &ApObject) -> AppResult<()> {
        let kind = activity.activity_kind().ok_or_else(|| {
            AppError::NotActivity(activity.type_name().unwrap_or("untyped").to_string())
        })?;

        if let Some(handler) = self.overrides.get(&kind) {
            debug!(kind = %kind, "Dispatching inbox activity to override");
            return handler.handle(ctx, activity).await;
        }

        let resolver = Resolver::new(self.actor, self.inbox);
        match &kind {
            ActivityKind::Create => self.create(ctx, &resolver, activity).await?,
            ActivityKind::Update => self.update(activity).await?,
            ActivityKind::Delete => self.delete(activity).await?,
            ActivityKind::Follow => self.follow(ctx, activity).await?,
            ActivityKind::Accept => self.accept(ctx, &resolver, activity).await?,
            ActivityKind::Reject => {}
            ActivityKind::Add => add_to_targets(self.actor.db(), activity).await?,
            ActivityKind::Remove => remove_from_targets(self.actor.db(), activity).await?,
            ActivityKind::Like => add_reaction(self.actor.db(), activity, "likes").await?,
            ActivityKind::Announce => add_reaction(self.actor.db(), activity, "shares").await?,
            ActivityKind::Undo => require_actors_match_objects(ctx, &resolver, activity).await?,
            ActivityKind::Block => {
                require_objects(activity)?;
            }
            ActivityKind::Other(_) => return self.protocol.default_callback(ctx, activity).await,
        }
        run_hook(self.wrapped.hook(&kind), ctx, activity).await
    }

    async fn create(
        &self,
        ctx: &RequestContext,
        resolver: &Resolver<'_>,
        activity: &ApObject,
    ) -> AppResult<()> {
        let db = self.actor.db();
        let actors = activity.ids("actor");
        for object in require_objects(activity)? {
            let object = resolver.resolve(ctx, object).await?;
            let id = object.require_id("created object")?;
            let _guard = db.lock(&id).await?;
            if db.owns(&id).await? {
                // Our own outbox stored it already.
                if actors.iter().any(|actor| same_origin(actor, &id)) {
                    continue;
                }
                return Err(AppError::OriginMismatch(format!(
                    "{id} is hosted here, not by the activity's actor"
                )));
            }
            if db.exists(&id).await? {
                debug!(object = %id, "Federated object already stored");
                continue;
            }
            db.create(&object).await?;
            debug!(object = %id, "Stored federated object");
        }
        Ok(())
    }

    async fn update(&self, activity: &ApObject) -> AppResult<()> {
        require_origin_match(activity)?;
        let db = self.actor.db();
        for object in require_objects(activity)? {
            let Property::Object(object) = object else {
                return Err(AppError::BadRequest(
                    "an Update must carry the whole object, not an IRI".into(),
                ));
            };
            let id = object.require_id("updated object")?;
            let _guard = db.lock(&id).await?;
            db.update(&object).await?;
        }
        Ok(())
    }

    async fn delete(&self, activity: &ApObject) -> AppResult<()> {
        require_origin_match(activity)?;
        let db = self.actor.db();
        for id in require_objects(activity)?.iter().filter_map(Property::id) {
            let _guard = db.lock(&id).await?;
            db.delete(&id).await?;
        }
        Ok(())
    }

    async fn follow(&self, ctx: &RequestContext, activity: &ApObject) -> AppResult<()> {
        let objects = require_objects(activity)?;
        if self.wrapped.on_follow == OnFollow::DoNothing {
            return Ok(());
        }

        let db = self.actor.db();
        let me = {
            let _guard = db.lock(self.inbox).await?;
            db.actor_for_inbox(self.inbox).await?
        };
        if !objects.iter().any(|object| object.id().as_ref() == Some(&me)) {
            return Ok(());
        }

        let accept = self.wrapped.on_follow == OnFollow::AutomaticallyAccept;
        let followers = activity.ids("actor");
        let mut follow = activity.clone();
        follow.remove("@context");

        let mut response = ApObject::new(if accept { "Accept" } else { "Reject" });
        response.set_iris("actor", std::slice::from_ref(&me));
        response.set_values("object", &[Property::Object(follow)]);
        response.set_iris("to", &followers);

        if accept {
            let _guard = db.lock(&me).await?;
            let mut collection = db.followers(&me).await?;
            for follower in &followers {
                if !collection.contains_item(follower) {
                    collection.append_item(Property::Iri(follower.clone()));
                }
            }
            db.update(&collection).await?;
        }

        let outbox = {
            let _guard = db.lock(self.inbox).await?;
            db.outbox_for_inbox(self.inbox).await?
        };
        self.actor.add_new_ids(&mut response).await?;
        info!(
            actor = %me,
            followers = followers.len(),
            accepted = accept,
            "Answering Follow request"
        );
        self.actor.deliver(ctx, &outbox, &response).await
    }

    async fn accept(
        &self,
        ctx: &RequestContext,
        resolver: &Resolver<'_>,
        activity: &ApObject,
    ) -> AppResult<()> {
        let objects = activity.values("object");
        if objects.is_empty() {
            return Ok(());
        }

        let db = self.actor.db();
        let me = {
            let _guard = db.lock(self.inbox).await?;
            db.actor_for_inbox(self.inbox).await?
        };

        let mut my_follow = None;
        for object in objects {
            let object = resolver.resolve(ctx, object).await?;
            if !object.is_type("Follow") {
                continue;
            }
            if object.ids("actor").contains(&me) {
                my_follow = Some(object.require_id("accepted Follow")?);
                break;
            }
        }
        let Some(follow_id) = my_follow else {
            return Ok(());
        };

        let accepted_by = activity.ids("actor");
        if accepted_by.is_empty() {
            return Err(AppError::BadRequest(
                "an Accept of a Follow has no actor".into(),
            ));
        }

        {
            let _guard = db.lock(&follow_id).await?;
            let stored = db.get(&follow_id).await?;
            if !stored.is_type("Follow") {
                return Err(AppError::BadRequest(
                    "peer gave an Accept wrapping a Follow but provided a non-Follow id".into(),
                ));
            }
            if !stored.ids("actor").contains(&me) {
                return Err(AppError::BadRequest(
                    "peer gave an Accept wrapping a Follow but we are not the actor on that Follow"
                        .into(),
                ));
            }
            let followed: HashSet<Url> = stored.ids("object").into_iter().collect();
            if accepted_by.iter().any(|actor| !followed.contains(actor)) {
                return Err(AppError::BadRequest(
                    "peer gave an Accept wrapping a Follow but was not an object in the original Follow"
                        .into(),
                ));
            }
        }

        let _guard = db.lock(&me).await?;
        let mut following = db.following(&me).await?;
        for actor in &accepted_by {
            following.prepend_item(Property::Iri(actor.clone()));
        }
        db.update(&following).await?;
        info!(actor = %me, follow = %follow_id, "Follow accepted");
        Ok(())
    }
}
