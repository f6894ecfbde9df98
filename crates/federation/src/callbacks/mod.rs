//! Per-verb side effects.
//!
//! For each activity exactly one handler runs, picked in this order:
//!
//! 1. an application override registered for the exact activity type,
//! 2. the built-in default for a wrapped verb, followed by its optional hook,
//! 3. the protocol's `default_callback`.

mod federating;
mod shared;
mod social;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use outpost_common::AppResult;

use crate::context::RequestContext;
use crate::object::{ActivityKind, ApObject};

pub use federating::FederatingWrappedCallbacks;
pub(crate) use federating::FederatingScope;
pub use social::SocialWrappedCallbacks;
pub(crate) use social::SocialScope;

/// Application code run for one activity.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn handle(&self, ctx: &RequestContext, activity: &ApObject) -> AppResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnHandler<F>
where
    F: Fn(RequestContext, ApObject) -> Fut + Send + Sync,
    Fut: Future<Output = AppResult<()>> + Send,
{
    async fn handle(&self, ctx: &RequestContext, activity: &ApObject) -> AppResult<()> {
        (self.0)(ctx.clone(), activity.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActivityHandler>
where
    F: Fn(RequestContext, ApObject) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers that replace the default for an activity type.
#[derive(Clone, Default)]
pub struct CallbackOverrides {
    handlers: HashMap<ActivityKind, Arc<dyn ActivityHandler>>,
}

impl CallbackOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any earlier one.
    #[must_use]
    pub fn on(mut self, kind: ActivityKind, handler: Arc<dyn ActivityHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    #[must_use]
    pub fn get(&self, kind: &ActivityKind) -> Option<&Arc<dyn ActivityHandler>> {
        self.handlers.get(kind)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Run the after-hook registered for a verb, if any.
async fn run_hook(
    hook: Option<&Arc<dyn ActivityHandler>>,
    ctx: &RequestContext,
    activity: &ApObject,
) -> AppResult<()> {
    match hook {
        Some(hook) => hook.handle(ctx, activity).await,
        None => Ok(()),
    }
}
