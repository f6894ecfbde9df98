//! Inbox and outbox life cycle.
//!
//! [`SideEffectActor`] runs the protocol steps in a fixed order and owns
//! the two graph walks: recipient resolution for delivery and the
//! ownership walk behind inbox forwarding.

mod delivery;
mod forwarding;

use std::sync::Arc;

use axum::http::request::Parts;
use outpost_common::{AppError, AppResult};
use tracing::{debug, info};
use url::Url;

use crate::callbacks::{FederatingScope, SocialScope};
use crate::clock::Clock;
use crate::context::RequestContext;
use crate::database::Database;
use crate::object::{ActivityKind, ApObject, Property, RECIPIENT_PROPERTIES};
use crate::protocol::{
    Authentication, BlockStatus, CommonBehavior, FederatingProtocol, SocialProtocol,
};
use crate::transport::Transport;

/// Applies the side effects of activities posted to an inbox or outbox.
#[derive(Clone)]
pub struct SideEffectActor {
    common: Arc<dyn CommonBehavior>,
    social: Option<Arc<dyn SocialProtocol>>,
    federating: Option<Arc<dyn FederatingProtocol>>,
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    prefer_shared_inbox: bool,
}

impl SideEffectActor {
    /// Create a new side effect actor with neither protocol enabled.
    #[must_use]
    pub fn new(
        common: Arc<dyn CommonBehavior>,
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            common,
            social: None,
            federating: None,
            db,
            clock,
            prefer_shared_inbox: false,
        }
    }

    /// Enable the client-to-server outbox.
    #[must_use]
    pub fn with_social(mut self, social: Arc<dyn SocialProtocol>) -> Self {
        self.social = Some(social);
        self
    }

    /// Enable the server-to-server inbox and delivery.
    #[must_use]
    pub fn with_federating(mut self, federating: Arc<dyn FederatingProtocol>) -> Self {
        self.federating = Some(federating);
        self
    }

    /// Deliver to `endpoints.sharedInbox` when an actor declares one.
    #[must_use]
    pub const fn prefer_shared_inbox(mut self, prefer: bool) -> Self {
        self.prefer_shared_inbox = prefer;
        self
    }

    #[must_use]
    pub const fn is_social(&self) -> bool {
        self.social.is_some()
    }

    #[must_use]
    pub const fn is_federating(&self) -> bool {
        self.federating.is_some()
    }

    pub(crate) fn db(&self) -> &dyn Database {
        self.db.as_ref()
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) async fn new_transport(
        &self,
        ctx: &RequestContext,
        box_iri: &Url,
    ) -> AppResult<Arc<dyn Transport>> {
        self.common.new_transport(ctx, box_iri).await
    }

    fn federating_protocol(&self) -> AppResult<&Arc<dyn FederatingProtocol>> {
        self.federating.as_ref().ok_or(AppError::MethodNotAllowed)
    }

    fn social_protocol(&self) -> AppResult<&Arc<dyn SocialProtocol>> {
        self.social.as_ref().ok_or(AppError::MethodNotAllowed)
    }

    pub async fn authenticate_get_inbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
    ) -> AppResult<Authentication> {
        self.common.authenticate_get_inbox(ctx, request).await
    }

    pub async fn authenticate_get_outbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
    ) -> AppResult<Authentication> {
        self.common.authenticate_get_outbox(ctx, request).await
    }

    /// The inbox page served on GET.
    ///
    /// Actors without the federating protocol read it straight from the database.
    pub async fn get_inbox(&self, ctx: &RequestContext, inbox: &Url) -> AppResult<ApObject> {
        match &self.federating {
            Some(federating) => federating.get_inbox(ctx, inbox).await,
            None => {
                let _guard = self.db.lock(inbox).await?;
                self.db.get_inbox(inbox).await
            }
        }
    }

    pub async fn get_outbox(&self, ctx: &RequestContext, outbox: &Url) -> AppResult<ApObject> {
        self.common.get_outbox(ctx, outbox).await
    }

    pub async fn authenticate_post_inbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
        body: &[u8],
    ) -> AppResult<Authentication> {
        self.federating_protocol()?
            .authenticate_post_inbox(ctx, request, body)
            .await
    }

    pub async fn authenticate_post_outbox(
        &self,
        ctx: RequestContext,
        request: &Parts,
    ) -> AppResult<Authentication> {
        self.social_protocol()?
            .authenticate_post_outbox(ctx, request)
            .await
    }

    pub async fn post_inbox_request_body_hook(
        &self,
        ctx: RequestContext,
        request: &Parts,
        activity: &ApObject,
    ) -> AppResult<RequestContext> {
        self.federating_protocol()?
            .post_inbox_request_body_hook(ctx, request, activity)
            .await
    }

    pub async fn post_outbox_request_body_hook(
        &self,
        ctx: RequestContext,
        request: &Parts,
        data: &ApObject,
    ) -> AppResult<RequestContext> {
        self.social_protocol()?
            .post_outbox_request_body_hook(ctx, request, data)
            .await
    }

    /// Block check on the actors directly behind an inbound activity.
    ///
    /// When the request was signed, the signer must be one of the
    /// activity's actors, so it is block-checked with them. No other actor
    /// may be one we host.
    pub async fn authorize_post_inbox(
        &self,
        ctx: &RequestContext,
        activity: &ApObject,
    ) -> AppResult<BlockStatus> {
        let federating = self.federating_protocol()?;
        let actors = activity.ids("actor");
        if actors.is_empty() {
            return Err(AppError::BadRequest("activity has no actor".into()));
        }

        if let Some(signer) = &ctx.requesting_actor {
            if !actors.contains(signer) {
                return Err(AppError::Forbidden(format!(
                    "{signer} signed an activity by someone else"
                )));
            }
            for actor in actors.iter().filter(|actor| *actor != signer) {
                let _guard = self.db.lock(actor).await?;
                if self.db.owns(actor).await? {
                    return Err(AppError::Forbidden(format!(
                        "{signer} cannot act for {actor}"
                    )));
                }
            }
        }
        federating.blocked(ctx, &actors).await
    }

    /// Record an inbound activity in `inbox` and run its callback.
    ///
    /// Returns `false` when the inbox already held the activity, in which
    /// case nothing else happens.
    pub async fn post_inbox(
        &self,
        ctx: &RequestContext,
        inbox: &Url,
        activity: &ApObject,
    ) -> AppResult<bool> {
        let federating = self.federating_protocol()?;
        let id = activity.require_id("inbox activity")?;

        {
            let _guard = self.db.lock(inbox).await?;
            if self.db.inbox_contains(inbox, &id).await? {
                debug!(activity = %id, inbox = %inbox, "Activity already in inbox");
                return Ok(false);
            }
            let mut page = self.db.get_inbox(inbox).await?;
            page.prepend_item(Property::Iri(id.clone()));
            self.db.set_inbox(&page).await?;
        }

        let (wrapped, overrides) = federating.federating_callbacks(ctx).await?;
        let scope = FederatingScope {
            actor: self,
            protocol: federating.as_ref(),
            inbox,
            wrapped,
            overrides,
        };
        scope.dispatch(ctx, activity).await?;

        info!(
            activity = %id,
            kind = activity.type_name().unwrap_or_default(),
            inbox = %inbox,
            "Processed inbox activity"
        );
        Ok(true)
    }

    /// Run the outbox callback and record the activity in `outbox`.
    ///
    /// Returns whether the activity should be delivered.
    pub async fn post_outbox(
        &self,
        ctx: &RequestContext,
        activity: &mut ApObject,
        outbox: &Url,
    ) -> AppResult<bool> {
        let social = self.social_protocol()?;
        let (wrapped, overrides) = social.social_callbacks(ctx).await?;
        let mut scope = SocialScope {
            actor: self,
            protocol: social.as_ref(),
            outbox,
            wrapped,
            overrides,
            undeliverable: false,
        };
        scope.dispatch(ctx, activity).await?;
        let deliverable = !scope.undeliverable;

        self.add_to_outbox(activity, outbox).await?;
        Ok(deliverable)
    }

    async fn add_to_outbox(&self, activity: &ApObject, outbox: &Url) -> AppResult<()> {
        let id = activity.require_id("outbox activity")?;
        {
            let _guard = self.db.lock(&id).await?;
            self.db.create(activity).await?;
        }

        let _guard = self.db.lock(outbox).await?;
        let mut page = self.db.get_outbox(outbox).await?;
        page.prepend_item(Property::Iri(id.clone()));
        self.db.set_outbox(&page).await?;
        info!(activity = %id, outbox = %outbox, "Activity added to outbox");
        Ok(())
    }

    /// Give an outgoing activity a fresh id.
    ///
    /// Objects embedded in a Create get fresh ids too. Objects referenced
    /// by IRI are left untouched.
    pub async fn add_new_ids(&self, activity: &mut ApObject) -> AppResult<()> {
        let id = self.db.new_id(activity).await?;
        activity.set_id(&id);

        if activity.activity_kind() == Some(ActivityKind::Create) {
            let mut objects = activity.values("object");
            if objects.is_empty() {
                return Ok(());
            }
            for object in &mut objects {
                if let Property::Object(object) = object {
                    let id = self.db.new_id(object).await?;
                    object.set_id(&id);
                }
            }
            activity.set_values("object", &objects);
        }
        Ok(())
    }

    /// Wrap a bare object posted to `outbox` in a Create by the outbox owner.
    pub async fn wrap_in_create(&self, mut object: ApObject, outbox: &Url) -> AppResult<ApObject> {
        let actor = {
            let _guard = self.db.lock(outbox).await?;
            self.db.actor_for_outbox(outbox).await?
        };

        let mut create = ApObject::new("Create");
        if let Some(context) = object.remove("@context") {
            create.set("@context", context);
        }
        create.set_iris("actor", std::slice::from_ref(&actor));
        for key in RECIPIENT_PROPERTIES {
            if let Some(value) = object.get(key) {
                create.set(key, value.clone());
            }
        }
        create.set_values("object", &[Property::Object(object)]);
        Ok(create)
    }
}
