use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use eno_controllers::aggregation::StatusAggregator;
use eno_controllers::cleanup::SliceCleanupController;
use eno_controllers::schemas::StoreSchemaResolver;
use eno_controllers::symphony::SymphonyController;
use eno_controllers::{
    Config, ExecutorBridge, LifecycleController, LocalCommandExecutor, ReconcileController,
    SynthesisExecutor,
};
use eno_reconstitute::{Cache, Reconstituter};
use eno_store::ObjectStore;
use tracing::{error, info, warn};

fn init_tracing() {
    let env = std::env::var("ENO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cfg = Config::from_env();
    info!(?cfg, "starting eno");

    let store: Arc<dyn ObjectStore> = Arc::new(eno_kubehub::KubeStore::new());
    let cache = Arc::new(Cache::new());
    let resolver = StoreSchemaResolver::new(Arc::clone(&store));

    // The reconciler registers its queue with the cache, so it must be
    // constructed before the reconstituter starts filling.
    let reconciler =
        ReconcileController::new(Arc::clone(&store), Arc::clone(&cache), resolver, cfg.clone());
    let reconstituter = Arc::new(Reconstituter::new(Arc::clone(&store), Arc::clone(&cache)));
    let lifecycle = LifecycleController::new(Arc::clone(&store), cfg.clone());
    let cleanup = SliceCleanupController::new(Arc::clone(&store));
    let aggregator = StatusAggregator::new(Arc::clone(&store));
    let symphony = SymphonyController::new(Arc::clone(&store));
    let executor: Arc<dyn SynthesisExecutor> = Arc::new(LocalCommandExecutor);
    let bridge = Arc::new(ExecutorBridge::new(Arc::clone(&store), executor, cfg.clone()));

    let tasks = vec![
        tokio::spawn(async move { reconciler.run().await }),
        tokio::spawn(async move { reconstituter.run().await }),
        tokio::spawn(async move { lifecycle.run().await }),
        tokio::spawn(async move { cleanup.run().await }),
        tokio::spawn(async move { aggregator.run().await }),
        tokio::spawn(async move { symphony.run().await }),
        tokio::spawn(async move { bridge.run().await }),
    ];

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for task in tasks {
        task.abort();
        if let Ok(Err(err)) = task.await {
            warn!(error = %err, "controller exited with error");
        }
    }
    Ok(())
}
