//! Callback Forwarder - Main entry point.
//!
//! This binary runs the HTTP server that captures blockchain-provider
//! webhook callbacks into PostgreSQL.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use callback_forwarder::auth::Authenticator;
use callback_forwarder::config::Config;
use callback_forwarder::dedup::DedupCache;
use callback_forwarder::server::{AppState, build_router};
use callback_forwarder::store::schema::run_migrations;
use callback_forwarder::store::{EventStore, PgEventStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callback_forwarder=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    tracing::info!(
        auth_enabled = config.enable_auth,
        allowed_ips = config.allowed_ips.len(),
        max_body_bytes = config.max_body_bytes,
        "Starting callback forwarder"
    );
    if config.strict_webhook_auth {
        // Reserved flag, not wired yet.
        tracing::warn!("STRICT_WEBHOOK_AUTH is set but not implemented; ignoring");
    }
    if config.enable_auth && config.provider_secrets.is_empty() {
        tracing::warn!(
            "ENABLE_AUTH is set but no SECRET_<PROVIDER> is configured; \
             requests will be accepted unverified"
        );
    }

    // Connect to the store
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(std::time::Duration::from_secs(
            config.database_connect_timeout_secs,
        ))
        .connect(&config.database_url)
        .await?;

    if config.run_migrations_on_startup {
        run_migrations(&pool).await?;
    }

    let store = Arc::new(PgEventStore::new(pool));

    // Startup probe: reachability plus a feel for recent traffic.
    if store.check_health().await {
        let since = Utc::now() - chrono::Duration::hours(24);
        match store.recent_count(since).await {
            Ok(count) => tracing::info!(events_last_24h = count, "database reachable"),
            Err(error) => tracing::warn!(%error, "database reachable but count query failed"),
        }
    } else {
        tracing::warn!("database health probe failed at startup; continuing anyway");
    }

    // Shutdown token: cancelled on SIGINT/SIGTERM, observed by in-flight
    // store retries and by the server's graceful shutdown.
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_for_shutdown_signals(shutdown.clone()));

    // Create application state
    let app_state = AppState::new(
        Authenticator::from_config(&config),
        store,
        Arc::new(DedupCache::new(
            chrono::Duration::seconds(config.dedup_cache_ttl_secs as i64),
            config.dedup_cache_soft_cap,
        )),
        config.max_body_bytes,
        shutdown.clone(),
    );

    // Build router
    let app = build_router(app_state);

    tracing::info!("Listening on {}", config.listen_addr);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    Ok(())
}

/// Cancels the token on SIGINT or, on Unix, SIGTERM.
async fn watch_for_shutdown_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to listen for SIGINT");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => tracing::warn!(%error, "failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received, draining");
    shutdown.cancel();
}
