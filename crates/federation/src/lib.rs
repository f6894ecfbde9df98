//! ActivityPub federation engine for outpost.
//!
//! This crate implements the inbox and outbox life cycle of an ActivityPub actor:
//!
//! - **Actor dispatch**: media type checks and status mapping via [`Actor`]
//! - **Side effects**: authentication, authorization, callbacks, forwarding and
//!   delivery via [`SideEffectActor`]
//! - **Callbacks**: per-verb defaults with application overrides
//! - **Seams**: [`Database`], [`Transport`] and the protocol traits an
//!   application implements
//! - **Security**: HTTP signatures and per-IRI locking
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use outpost_federation::{
//!     Actor, CommonBehavior, Database, FederatingProtocol, SideEffectActor, SystemClock,
//! };
//!
//! fn build(
//!     common: Arc<dyn CommonBehavior>,
//!     federating: Arc<dyn FederatingProtocol>,
//!     db: Arc<dyn Database>,
//!     base: url::Url,
//! ) -> axum::Router {
//!     let side_effect = SideEffectActor::new(common, db, Arc::new(SystemClock))
//!         .with_federating(federating);
//!     outpost_federation::handler::router(Actor::new(side_effect, base))
//! }
//! ```

pub mod actor;
pub mod auth;
pub mod callbacks;
pub mod clock;
pub mod context;
pub mod database;
pub mod handler;
pub mod lock;
pub mod media_type;
pub mod memory;
pub mod object;
pub mod protocol;
pub mod side_effect;
pub mod signature;
pub mod transport;

pub use actor::Actor;
pub use auth::{KeyOwner, SignatureAuthenticator};
pub use callbacks::{
    ActivityHandler, CallbackOverrides, FederatingWrappedCallbacks, SocialWrappedCallbacks,
    handler_fn,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::RequestContext;
pub use database::Database;
pub use lock::{IriGuard, LockTable};
pub use memory::MemoryDatabase;
pub use object::{ActivityKind, ApObject, PUBLIC, Property};
pub use protocol::{
    Authentication, BlockStatus, CommonBehavior, FederatingProtocol, SocialProtocol,
};
pub use side_effect::SideEffectActor;
pub use signature::{HttpSigner, HttpVerifier, SignatureComponents, SignatureError};
pub use transport::{HttpTransport, HttpTransportFactory, RetryPolicy, Transport};
