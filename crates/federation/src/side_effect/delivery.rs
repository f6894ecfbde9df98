//! Recipient resolution and outbox delivery.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use outpost_common::{AppError, AppResult};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::SideEffectActor;
use crate::context::RequestContext;
use crate::object::{ApObject, Property, RECIPIENT_PROPERTIES, is_public};
use crate::transport::Transport;

impl SideEffectActor {
    /// Send an activity from `outbox` to every inbox it addresses.
    ///
    /// Recipients that cannot be dereferenced are skipped. A failed batch
    /// POST fails the whole delivery.
    pub async fn deliver(
        &self,
        ctx: &RequestContext,
        outbox: &Url,
        activity: &ApObject,
    ) -> AppResult<()> {
        let max_depth = self.federating_protocol()?.max_delivery_recursion_depth(ctx);
        let transport = self.new_transport(ctx, outbox).await?;

        let recipients = recipient_iris(activity);
        let mut inboxes = self
            .resolve_inboxes(ctx, transport.as_ref(), recipients, max_depth)
            .await?;

        if let Some(own) = self.outbox_owner_inbox(outbox).await? {
            inboxes.retain(|inbox| inbox != &own);
        }
        if inboxes.is_empty() {
            debug!(outbox = %outbox, "No inboxes to deliver to");
            return Ok(());
        }

        let mut payload = activity.clone();
        payload.strip_hidden_recipients();
        let payload = Bytes::from(payload.to_bytes()?);

        info!(
            activity = ?activity.id().map(String::from),
            recipients = inboxes.len(),
            "Delivering activity"
        );
        transport.batch_deliver(ctx, payload, &inboxes).await
    }

    /// Map actor and collection IRIs to a deduplicated list of inboxes.
    pub(crate) async fn resolve_inboxes(
        &self,
        ctx: &RequestContext,
        transport: &dyn Transport,
        iris: Vec<Url>,
        max_depth: i32,
    ) -> AppResult<Vec<Url>> {
        let mut inboxes = Vec::new();
        let mut unresolved = Vec::new();
        for iri in iris {
            let known = {
                let _guard = self.db.lock(&iri).await?;
                self.db.inboxes_for_iri(&iri).await?
            };
            if known.is_empty() {
                unresolved.push(iri);
            } else {
                inboxes.extend(known);
            }
        }

        for actor in self
            .resolve_actors(ctx, transport, unresolved, max_depth)
            .await?
        {
            match self.actor_inbox(&actor) {
                Some(inbox) => inboxes.push(inbox),
                None => warn!(actor = ?actor.id().map(String::from), "Recipient has no inbox, skipping"),
            }
        }

        Ok(dedupe(inboxes))
    }

    /// Dereference recipients, expanding collections level by level.
    ///
    /// Top-level IRIs sit at depth 0 and collection members one level below
    /// their collection. Nothing at or past `max_depth` is fetched unless
    /// `max_depth` is 0 or less. IRIs we host are read from the database.
    async fn resolve_actors(
        &self,
        ctx: &RequestContext,
        transport: &dyn Transport,
        roots: Vec<Url>,
        max_depth: i32,
    ) -> AppResult<Vec<ApObject>> {
        let within = |depth: i32| max_depth <= 0 || depth < max_depth;
        let mut seen = HashSet::new();
        let mut queue: VecDeque<(Url, i32)> = roots.into_iter().map(|iri| (iri, 0)).collect();
        let mut actors = Vec::new();

        while let Some((iri, depth)) = queue.pop_front() {
            if !within(depth) || !seen.insert(iri.to_string()) {
                continue;
            }
            let Some(object) = self.fetch_recipient(ctx, transport, &iri).await? else {
                continue;
            };
            if !object.is_collection() {
                actors.push(object);
                continue;
            }

            let (members, pages) = collection_members(&object);
            queue.extend(pages.into_iter().map(|page| (page, depth)));
            for member in members {
                match member {
                    Property::Object(embedded) if embedded.contains("inbox") => {
                        if within(depth + 1) {
                            actors.push(embedded);
                        }
                    }
                    member => {
                        if let Some(id) = member.id().filter(|id| !is_public(id.as_str())) {
                            queue.push_back((id, depth + 1));
                        }
                    }
                }
            }
        }
        Ok(actors)
    }

    /// Local recipients come from the database, remote ones over the transport.
    ///
    /// A remote failure skips the recipient. A local one is an error.
    async fn fetch_recipient(
        &self,
        ctx: &RequestContext,
        transport: &dyn Transport,
        iri: &Url,
    ) -> AppResult<Option<ApObject>> {
        {
            let _guard = self.db.lock(iri).await?;
            if self.db.owns(iri).await? {
                return match self.db.get(iri).await {
                    Ok(object) => Ok(Some(object)),
                    Err(AppError::NotFound(_)) => {
                        warn!(recipient = %iri, "Local recipient does not exist, skipping");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                };
            }
        }
        match transport.dereference(ctx, iri).await {
            Ok(object) => Ok(Some(object)),
            Err(e) => {
                warn!(recipient = %iri, error = %e, "Failed to dereference recipient, skipping");
                Ok(None)
            }
        }
    }

    fn actor_inbox(&self, actor: &ApObject) -> Option<Url> {
        let shared = || {
            actor
                .get("endpoints")
                .and_then(|endpoints| endpoints.get("sharedInbox"))
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok())
        };
        let direct = || actor.ids("inbox").into_iter().next();
        if self.prefer_shared_inbox {
            shared().or_else(direct)
        } else {
            direct()
        }
    }

    async fn outbox_owner_inbox(&self, outbox: &Url) -> AppResult<Option<Url>> {
        let owner = {
            let _guard = self.db.lock(outbox).await?;
            self.db.actor_for_outbox(outbox).await?
        };
        let _guard = self.db.lock(&owner).await?;
        let actor = self.db.get(&owner).await?;
        Ok(actor.ids("inbox").into_iter().next())
    }
}

/// Addressed IRIs in reading order, minus Public, deduplicated.
pub(crate) fn recipient_iris(activity: &ApObject) -> Vec<Url> {
    let iris = RECIPIENT_PROPERTIES
        .iter()
        .flat_map(|key| activity.ids(key))
        .filter(|iri| !is_public(iri.as_str()));
    dedupe(iris)
}

pub(crate) fn dedupe(iris: impl IntoIterator<Item = Url>) -> Vec<Url> {
    let mut seen = HashSet::new();
    iris.into_iter()
        .filter(|iri| seen.insert(iri.to_string()))
        .collect()
}

/// Members of a collection plus the IRIs of pages still to fetch.
///
/// A page is part of the same collection, so it does not count as a level.
fn collection_members(collection: &ApObject) -> (Vec<Property>, Vec<Url>) {
    let mut members = collection.items();
    let mut pages = Vec::new();
    for key in ["first", "next"] {
        for page in collection.values(key) {
            match page {
                Property::Iri(iri) => pages.push(iri),
                Property::Object(page) => {
                    members.extend(page.items());
                    pages.extend(page.ids("next"));
                }
            }
        }
    }
    (members, pages)
}
