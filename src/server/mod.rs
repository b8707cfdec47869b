//! Hub server assembly and connection handling.
//!
//! [`run`] wires the full hub (store, blob store, throttle, propagator,
//! execution queue, listener) from a [`HubConfig`] and serves until a
//! shutdown signal arrives.

mod exec;
mod hub;

pub use exec::{Command, Executor};
pub use hub::{HubServer, ServerError};

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use crate::blob::{BlobStore, FsBlobStore};
use crate::config::HubConfig;
use crate::graph::GraphPropagator;
use crate::scheduler::Scheduler;
use crate::store::StepStore;
use crate::throttle::{TagThrottle, DECAY_INTERVAL};

/// Binds the configured address and runs the hub until shutdown.
pub async fn run(config: HubConfig, shutdown_tx: broadcast::Sender<()>) -> Result<(), ServerError> {
    let listener = TcpListener::bind(config.addr()).await?;
    info!(addr = %config.addr(), "Hub listening");
    serve_on(config, listener, shutdown_tx).await
}

/// Assembles the hub components over an already-bound listener and
/// serves until shutdown.
///
/// Split out from [`run`] so tests can bind an ephemeral port first.
pub async fn serve_on(
    config: HubConfig,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), ServerError> {
    let store = Arc::new(StepStore::connect(&config.database_url).await?);
    store.run_migrations().await?;

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&config.blob_path));
    let throttle = Arc::new(TagThrottle::new());
    let decay_handle = throttle.spawn_decay(DECAY_INTERVAL, shutdown_tx.subscribe());

    let propagator = Arc::new(GraphPropagator::new(Arc::clone(&store), blobs));
    let (exec_tx, exec_handle) =
        Executor::new(Arc::clone(&store), propagator).spawn(config.queue_capacity);

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&throttle),
        config.scheduler.clone(),
    );
    let server = Arc::new(HubServer::new(
        store,
        scheduler,
        exec_tx,
        config.read_timeout,
    ));

    let result = Arc::clone(&server).serve(listener, shutdown_tx.subscribe()).await;

    // The executor drains and exits once every queue sender is gone;
    // in-flight connection tasks hold the last clones.
    drop(server);
    let _ = decay_handle.await;
    let _ = exec_handle.await;

    result
}
