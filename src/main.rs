use std::sync::Arc;

use anyhow::Context;
use chunkdrop::directory::FsDirectories;
use chunkdrop::registry::SessionRegistry;
use chunkdrop::server::{self, AppState};
use chunkdrop::{Config, UploadEngine};
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chunkdrop=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let directories = Arc::new(FsDirectories::new(&config.root));
    directories
        .ensure_root()
        .await
        .with_context(|| format!("failed to prepare repository root {}", config.root.display()))?;

    let registry = Arc::new(SessionRegistry::new(config.upload.inactivity_timeout));
    let engine = Arc::new(UploadEngine::new(
        &config.root,
        directories.clone(),
        registry,
        config.upload.clone(),
    ));
    let app = server::router(AppState {
        engine,
        directories,
    });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(
        addr = %config.listen_addr,
        root = %config.root.display(),
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}
