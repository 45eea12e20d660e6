use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod app;
mod common;
mod config;
mod docs;
mod infrastructure;
mod middleware;
mod modules;
mod routes;
mod state;
mod workers;

#[cfg(test)]
mod test_support;

use crate::config::settings::AppConfig;
use crate::infrastructure::db::pool::connect_to_db;
use crate::infrastructure::probe::FfprobeProber;
use crate::infrastructure::provisioner::HttpProvisioner;
use crate::infrastructure::queue::{FinishedNotifier, LogNotifier, RabbitMqService};
use crate::infrastructure::storage::s3::StorageService;
use crate::modules::asset::repository::{AssetStore, MemoryAssetStore, PgAssetStore};
use crate::state::{AppState, Backends};
use crate::workers::autoscaler::Autoscaler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting server...");

    let config = AppConfig::new().context("incomplete configuration")?;

    let store: Arc<dyn AssetStore> = match &config.database_url {
        Some(url) => {
            let pool = connect_to_db(url).await?;
            let store = PgAssetStore::new(pool);
            store.ensure_schema().await?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, asset records are kept in memory");
            Arc::new(MemoryAssetStore::new())
        }
    };

    let storage = Arc::new(
        StorageService::new(
            &config.minio_url,
            &config.minio_bucket,
            &config.minio_access_key,
            &config.minio_secret_key,
        )
        .await,
    );

    let notifier: Arc<dyn FinishedNotifier> = match &config.rabbitmq_url {
        Some(url) => Arc::new(RabbitMqService::new(url).await?),
        None => Arc::new(LogNotifier),
    };

    let autoscaler = config.provisioner_url.as_ref().map(|url| {
        let provisioner = HttpProvisioner::new(reqwest::Client::new(), url);
        Arc::new(Autoscaler::new(Arc::new(provisioner), config.max_worker_instances))
    });

    tokio::fs::create_dir_all(&config.staging_dir)
        .await
        .with_context(|| format!("cannot create staging dir {}", config.staging_dir.display()))?;

    let port = config.server_port;
    let prober = Arc::new(FfprobeProber::new(config.ffprobe_path.clone()));
    let (state, uploads, upload_events) = AppState::new(
        config,
        Backends {
            store,
            storage,
            prober,
            notifier,
            autoscaler,
        },
    );

    uploads.start();
    // The watcher stops when dropped, keep it for the life of the process.
    let _watcher = uploads.watch()?;
    let backlog = uploads.rescan().await?;
    if backlog > 0 {
        info!(files = backlog, "staged files picked up from a previous run");
    }

    tokio::spawn(state.tracker.clone().run(upload_events));
    tokio::spawn(state.lifecycle.scheduler().clone().run_idle_sweeper());

    let mut scheduler_events = state.lifecycle.scheduler().subscribe();
    tokio::spawn(async move {
        loop {
            match scheduler_events.recv().await {
                Ok(event) => debug!(?event, "scheduler event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "scheduler event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let app = app::create_app(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server running on http://{addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
