//! TillSync Server binary.

use tillsync_server::config::Config;
use tillsync_server::{app, db, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tillsync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    if config.auth_secret.is_none() {
        tracing::warn!("AUTH_SECRET is not set; accepting any bearer token");
    }

    let pool = db::create_pool(&config.database_url, config.max_connections).await?;
    db::run_migrations(&pool).await?;
    tracing::info!(
        max_connections = config.max_connections,
        max_push_changes = config.max_push_changes,
        "database ready"
    );

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("TillSync Server listening on {}", addr);

    axum::serve(listener, app(AppState::new(pool, config)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

/// Resolves on Ctrl-C. In-flight push transactions either commit or roll back.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
