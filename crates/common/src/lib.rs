//! Common utilities and shared types for outpost.
//!
//! This crate provides the foundational pieces shared by the federation engine
//! and the server binary:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **Cryptography**: RSA key material for HTTP Signatures via [`RsaKeypair`]
//! - **ID Generation**: ULID-based IRIs via [`IdGenerator`]
//!
//! # Example
//!
//! ```no_run
//! use outpost_common::{Config, IdGenerator, AppResult};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let base = url::Url::parse(&config.server.url)?;
//!     let id = IdGenerator::new(base).iri("Note")?;
//!     println!("Minted: {id}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod id;

pub use config::{Config, FederationConfig, LocalActorConfig, LogFormat, OnFollow, ServerConfig};
pub use crypto::RsaKeypair;
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
