//! outpost daemon entry point.
//!
//! Boots the document cache, crawler and task queue, optionally loads the URLs
//! given on the command line (printing each document to stdout as a JSON
//! line), then runs until Ctrl-C. Logging goes to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use outpost_client::{FetchClient, FetchConfig, LoadOptions, Loader, Pipeline};
use outpost_core::queue::QueueOptions;
use outpost_core::{AppConfig, DocumentStore, Queue, Registry, Store, TaskStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load().context("loading configuration")?;
    tracing::info!(db_path = %config.db_path.display(), "starting outpost");

    let store = Arc::new(
        Store::open(&config.db_path)
            .await
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );

    let queue = Queue::new(QueueOptions::from(&config.queue), Some(store.clone() as Arc<dyn TaskStore>));
    let transport = Arc::new(FetchClient::new(FetchConfig::from(&config))?);
    let pipeline = Pipeline::new(&config, transport, Some(store.clone() as Arc<dyn DocumentStore>), Arc::clone(&queue));

    let mut registry = Registry::new();
    pipeline.register(&mut registry)?;
    let handle = queue.start(registry)?;
    let purge = pipeline.cache().spawn_purge_loop();

    let root = pipeline.root();
    for url in std::env::args().skip(1) {
        match root.load(&url, &LoadOptions::new()).await {
            Ok(document) => println!("{}", serde_json::to_string(document.object())?),
            Err(e) => tracing::warn!(url = %url, error = %e, "seed load failed"),
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");

    handle.shutdown_and_join().await;
    pipeline.cache().flush().await;
    if let Some(purge) = purge {
        purge.abort();
    }

    match store.count_tasks().await {
        Ok(pending) => tracing::info!(pending, "outpost stopped"),
        Err(e) => tracing::warn!(error = %e, "outpost stopped"),
    }
    Ok(())
}
