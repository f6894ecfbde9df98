//! Outpost server entry point.

mod protocol;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use outpost_common::{Config, LogFormat, RsaKeypair};
use outpost_federation::{
    Actor, ApObject, HttpSigner, HttpTransportFactory, MemoryDatabase, RetryPolicy,
    SideEffectActor, SignatureAuthenticator, SystemClock, handler,
};
use tokio::signal;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use crate::protocol::InstanceProtocol;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "outpost=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var_os("OUTPOST_CONFIG") {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    init_tracing(config.server.log_format);

    info!("Starting outpost server...");

    let base = Url::parse(&config.server.url)?;
    let federation = config.federation.clone();
    let db = Arc::new(MemoryDatabase::new(base.clone()));

    // Seed the local actor
    let keypair = RsaKeypair::load_or_generate(config.actor.private_key_path.as_deref())?;
    let actor: ApObject = db.add_local_actor(
        &config.actor.username,
        config.actor.name.as_deref(),
        &keypair.public_key_pem,
    )?;
    let actor_iri = actor.require_id("local actor")?;
    info!(actor = %actor_iri, "Local actor ready");

    // Outbound requests are signed with the actor's key
    let signer = HttpSigner::new(&keypair.private_key_pem, format!("{actor_iri}#main-key"))?;
    let retry = RetryPolicy {
        max_retries: federation.delivery_retries,
        ..RetryPolicy::default()
    };
    let transport = HttpTransportFactory::new(
        Arc::new(SystemClock),
        &federation.user_agent,
        Duration::from_secs(federation.request_timeout_secs),
        retry,
        federation.delivery_concurrency,
    )?
    .transport(Arc::new(signer));

    let protocol = Arc::new(InstanceProtocol::new(
        db.clone(),
        Arc::new(transport),
        SignatureAuthenticator::new(Arc::new(SystemClock)),
        federation.clone(),
        config.server.outbox_token.clone(),
    ));

    let mut side_effect = SideEffectActor::new(protocol.clone(), db.clone(), Arc::new(SystemClock))
        .prefer_shared_inbox(federation.prefer_shared_inbox);
    if federation.enable_federation {
        side_effect = side_effect.with_federating(protocol.clone());
    }
    if federation.enable_social {
        side_effect = side_effect.with_social(protocol);
    }
    info!(
        federating = federation.enable_federation,
        social = federation.enable_social,
        "Actor protocols configured"
    );
    let actor = Actor::new(side_effect, base).deliver_in_background(federation.deliver_in_background);

    let app = handler::router(actor)
        .merge(routes::actor_documents(db))
        .layer(RequestBodyLimitLayer::new(
            outpost_federation::actor::MAX_ACTIVITY_BYTES,
        ))
        .layer(TraceLayer::new_for_http());

    // Start server with graceful shutdown
    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}
