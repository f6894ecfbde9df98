//! Inbox forwarding.
//!
//! A received activity is re-sent to our own collections it addresses,
//! but only when its chain of `object`, `inReplyTo`, `target` and `tag`
//! values reaches something this server hosts within the configured depth.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use outpost_common::{AppError, AppResult};
use tracing::{debug, info, warn};
use url::Url;

use super::SideEffectActor;
use super::delivery::dedupe;
use crate::context::RequestContext;
use crate::object::{ApObject, Property};
use crate::transport::Transport;

const AUDIENCE_PROPERTIES: [&str; 3] = ["to", "cc", "audience"];
const CHAIN_PROPERTIES: [&str; 4] = ["inReplyTo", "object", "target", "tag"];

impl SideEffectActor {
    /// Forward an inbound activity to the owned collections it addresses.
    ///
    /// Storage errors fail the call. Delivery problems are only logged.
    pub async fn inbox_forwarding(
        &self,
        ctx: &RequestContext,
        inbox: &Url,
        activity: &ApObject,
    ) -> AppResult<()> {
        let federating = self.federating_protocol()?;
        let id = activity.require_id("forwarded activity")?;

        {
            let _guard = self.db.lock(&id).await?;
            if self.db.exists(&id).await? {
                debug!(activity = %id, "Activity already seen, not forwarding");
                return Ok(());
            }
            self.db.create(activity).await?;
        }

        let audience = dedupe(AUDIENCE_PROPERTIES.iter().flat_map(|key| activity.ids(key)));
        let mut owned = Vec::new();
        for iri in audience {
            let _guard = self.db.lock(&iri).await?;
            if self.db.owns(&iri).await? {
                owned.push(iri);
            }
        }
        if owned.is_empty() {
            return Ok(());
        }

        let mut collections = Vec::new();
        for iri in owned {
            let _guard = self.db.lock(&iri).await?;
            match self.db.get(&iri).await {
                Ok(object) if object.is_collection() => collections.push((iri, object)),
                Ok(_) | Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if collections.is_empty() {
            return Ok(());
        }

        let max_depth = federating.max_inbox_forwarding_recursion_depth(ctx);
        let mut transport = None;
        if !self
            .chain_is_anchored(ctx, inbox, activity, max_depth, &mut transport)
            .await?
        {
            debug!(activity = %id, "Activity does not touch local content, not forwarding");
            return Ok(());
        }

        let candidates: Vec<Url> = collections.iter().map(|(iri, _)| iri.clone()).collect();
        let chosen = federating
            .filter_forwarding(ctx, candidates, activity)
            .await?;
        let members = dedupe(
            collections
                .iter()
                .filter(|(iri, _)| chosen.contains(iri))
                .flat_map(|(_, collection)| collection.items())
                .filter_map(|member| member.id()),
        );
        if members.is_empty() {
            return Ok(());
        }

        let transport = match transport {
            Some(transport) => transport,
            None => self.new_transport(ctx, inbox).await?,
        };
        if let Err(e) = self
            .forward(ctx, transport.as_ref(), inbox, activity, members)
            .await
        {
            warn!(activity = %id, error = %e, "Inbox forwarding failed");
        }
        Ok(())
    }

    async fn forward(
        &self,
        ctx: &RequestContext,
        transport: &dyn Transport,
        inbox: &Url,
        activity: &ApObject,
        members: Vec<Url>,
    ) -> AppResult<()> {
        let max_depth = self.federating_protocol()?.max_delivery_recursion_depth(ctx);
        let mut inboxes = self
            .resolve_inboxes(ctx, transport, members, max_depth)
            .await?;
        inboxes.retain(|target| target != inbox);
        if inboxes.is_empty() {
            return Ok(());
        }

        let payload = Bytes::from(activity.to_bytes()?);
        info!(
            activity = ?activity.id().map(String::from),
            recipients = inboxes.len(),
            "Forwarding activity"
        );
        transport.batch_deliver(ctx, payload, &inboxes).await
    }

    /// Whether any value reachable from `activity` within `max_depth` hops is ours.
    ///
    /// Values found on the activity itself are at depth 0. Bare IRIs that
    /// are not ours are dereferenced to continue the walk; failures end
    /// that branch only.
    async fn chain_is_anchored(
        &self,
        ctx: &RequestContext,
        inbox: &Url,
        activity: &ApObject,
        max_depth: i32,
        transport: &mut Option<Arc<dyn Transport>>,
    ) -> AppResult<bool> {
        let mut visited = HashSet::new();
        let mut level = vec![activity.clone()];
        let mut depth = 0;

        while !level.is_empty() {
            if max_depth > 0 && depth >= max_depth {
                return Ok(false);
            }

            let mut iris = Vec::new();
            let mut next = Vec::new();
            for node in &level {
                for value in CHAIN_PROPERTIES.iter().flat_map(|key| node.values(key)) {
                    if let Some(id) = value.id() {
                        let _guard = self.db.lock(&id).await?;
                        if self.db.owns(&id).await? {
                            debug!(anchor = %id, depth, "Activity chain reaches local content");
                            return Ok(true);
                        }
                    }
                    match value {
                        Property::Object(embedded) => next.push(embedded),
                        Property::Iri(iri) => iris.push(iri),
                    }
                }
            }

            for iri in iris {
                if !visited.insert(iri.to_string()) {
                    continue;
                }
                let fetcher = match transport {
                    Some(fetcher) => fetcher.clone(),
                    None => {
                        let fetcher = self.new_transport(ctx, inbox).await?;
                        *transport = Some(fetcher.clone());
                        fetcher
                    }
                };
                match fetcher.dereference(ctx, &iri).await {
                    Ok(object) => next.push(object),
                    Err(e) => debug!(iri = %iri, error = %e, "Chain value unavailable"),
                }
            }

            level = next;
            depth += 1;
        }
        Ok(false)
    }
}
