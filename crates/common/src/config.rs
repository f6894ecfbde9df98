//! Application configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Federation configuration.
    #[serde(default)]
    pub federation: FederationConfig,
    /// The actor this instance hosts.
    pub actor: LocalActorConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this instance.
    pub url: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Bearer token accepted on outbox POSTs.
    #[serde(default)]
    pub outbox_token: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// How a received `Follow` is answered by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFollow {
    /// Leave the answer to application hooks.
    DoNothing,
    /// Add the follower and send an `Accept`.
    #[default]
    AutomaticallyAccept,
    /// Send a `Reject`.
    AutomaticallyReject,
}

/// Federation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Serve the server-to-server (inbox) protocol.
    #[serde(default = "default_true")]
    pub enable_federation: bool,
    /// Serve the client-to-server (outbox) protocol.
    #[serde(default = "default_true")]
    pub enable_social: bool,
    /// Depth bound for the inbox forwarding chain walk. 0 or less is unbounded.
    #[serde(default = "default_recursion_depth")]
    pub max_inbox_forwarding_recursion_depth: i32,
    /// Depth bound for collection expansion during delivery. 0 or less is unbounded.
    #[serde(default = "default_recursion_depth")]
    pub max_delivery_recursion_depth: i32,
    /// Default answer to received follows.
    #[serde(default)]
    pub on_follow: OnFollow,
    /// Deliver to `sharedInbox` endpoints when an actor declares one.
    #[serde(default)]
    pub prefer_shared_inbox: bool,
    /// Run outbox delivery on a spawned task instead of inside the request.
    #[serde(default = "default_true")]
    pub deliver_in_background: bool,
    /// User agent sent on outbound requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Number of inboxes delivered to concurrently.
    #[serde(default = "default_delivery_concurrency")]
    pub delivery_concurrency: usize,
    /// Per-request timeout for outbound HTTP calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retry attempts for failed deliveries, skipped in fast-fail mode.
    #[serde(default = "default_delivery_retries")]
    pub delivery_retries: u32,
    /// Hosts whose actors are refused.
    #[serde(default)]
    pub domain_blocks: Vec<String>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enable_federation: true,
            enable_social: true,
            max_inbox_forwarding_recursion_depth: default_recursion_depth(),
            max_delivery_recursion_depth: default_recursion_depth(),
            on_follow: OnFollow::default(),
            prefer_shared_inbox: false,
            deliver_in_background: true,
            user_agent: default_user_agent(),
            delivery_concurrency: default_delivery_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            delivery_retries: default_delivery_retries(),
            domain_blocks: Vec::new(),
        }
    }
}

/// The local actor served by this instance.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalActorConfig {
    /// Preferred username, also the path segment under `/users`.
    pub username: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// PKCS#8 PEM private key. Generated at startup when absent.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

const fn default_true() -> bool {
    true
}

const fn default_recursion_depth() -> i32 {
    4
}

fn default_user_agent() -> String {
    format!("outpost/{}", env!("CARGO_PKG_VERSION"))
}

const fn default_delivery_concurrency() -> usize {
    8
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_delivery_retries() -> u32 {
    3
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `OUTPOST_ENV`)
    /// 4. Environment variables with `OUTPOST_` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let env = std::env::var("OUTPOST_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("OUTPOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("OUTPOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults_fill_federation_section() {
        let config = parse(
            r#"
            [server]
            url = "https://example.com"

            [actor]
            username = "alice"
            "#,
        );

        assert_eq!(config.server.port, 3000);
        assert!(config.federation.enable_federation);
        assert_eq!(config.federation.max_delivery_recursion_depth, 4);
        assert_eq!(config.federation.on_follow, OnFollow::AutomaticallyAccept);
        assert!(!config.federation.prefer_shared_inbox);
    }

    #[test]
    fn test_on_follow_parses_snake_case() {
        let config = parse(
            r#"
            [server]
            url = "https://example.com"

            [federation]
            on_follow = "automatically_reject"
            max_inbox_forwarding_recursion_depth = 0

            [actor]
            username = "alice"
            "#,
        );

        assert_eq!(config.federation.on_follow, OnFollow::AutomaticallyReject);
        assert_eq!(config.federation.max_inbox_forwarding_recursion_depth, 0);
    }
}
