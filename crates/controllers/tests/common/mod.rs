//! Shared harness: every controller running against an in-memory store
//! with a pluggable synthesizer executor.
#![allow(dead_code)] // each test binary uses a different slice of this

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use eno_controllers::aggregation::StatusAggregator;
use eno_controllers::cleanup::SliceCleanupController;
use eno_controllers::schemas::StoreSchemaResolver;
use eno_controllers::symphony::SymphonyController;
use eno_controllers::{
    Config, ExecutorBridge, LifecycleController, ReconcileController, SynthesisExecutor,
};
use eno_core::api::{self, Composition, NamespacedName, Synthesizer};
use eno_reconstitute::{Cache, Reconstituter};
use eno_store::{get_as, keys, MemoryStore, ObjectStore};

pub struct Harness {
    pub store: Arc<dyn ObjectStore>,
    pub cache: Arc<Cache>,
}

pub fn test_config() -> Config {
    Config {
        max_synthesis_attempts: 3,
        default_exec_timeout: Duration::from_millis(500),
        default_pod_timeout: Duration::from_secs(30),
        default_reconcile_interval: Duration::from_millis(100),
        reconcile_workers: 2,
        max_slice_bytes: 1024 * 1024,
    }
}

impl Harness {
    pub async fn start(executor: Arc<dyn SynthesisExecutor>) -> Self {
        Self::start_with_config(executor, test_config()).await
    }

    pub async fn start_with_config(executor: Arc<dyn SynthesisExecutor>, cfg: Config) -> Self {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new());
        let resolver = StoreSchemaResolver::new(Arc::clone(&store));

        let reconciler =
            ReconcileController::new(Arc::clone(&store), Arc::clone(&cache), resolver, cfg.clone());
        let reconstituter = Arc::new(Reconstituter::new(Arc::clone(&store), Arc::clone(&cache)));
        let lifecycle = LifecycleController::new(Arc::clone(&store), cfg.clone());
        let cleanup = SliceCleanupController::new(Arc::clone(&store));
        let aggregator = StatusAggregator::new(Arc::clone(&store));
        let symphony = SymphonyController::new(Arc::clone(&store));
        let bridge = Arc::new(ExecutorBridge::new(Arc::clone(&store), executor, cfg));

        tokio::spawn(reconciler.run());
        tokio::spawn(reconstituter.run());
        tokio::spawn(lifecycle.run());
        tokio::spawn(cleanup.run());
        tokio::spawn(aggregator.run());
        tokio::spawn(symphony.run());
        tokio::spawn(bridge.run());

        Self { store, cache }
    }

    pub async fn create_synthesizer(&self, name: &str, image: &str) -> Synthesizer {
        let mut syn = Synthesizer::new("default", name);
        syn.spec.image = image.into();
        let v = self.store.create(keys::SYNTHESIZER, api::to_value(&syn)).await.unwrap();
        api::from_value(v).unwrap()
    }

    pub async fn create_composition(&self, name: &str, synthesizer: &str) -> Composition {
        let mut comp = Composition::new("default", name);
        comp.spec.synthesizer.name = synthesizer.into();
        let v = self.store.create(keys::COMPOSITION, api::to_value(&comp)).await.unwrap();
        api::from_value(v).unwrap()
    }

    pub async fn composition(&self, name: &str) -> Option<Composition> {
        get_as(self.store.as_ref(), keys::COMPOSITION, Some("default"), name).await.unwrap()
    }

    /// Polls the composition until `pred` holds.
    pub async fn eventually_comp<F>(&self, name: &str, pred: F) -> Composition
    where
        F: Fn(&Composition) -> bool,
    {
        let nsn = NamespacedName::new("default", name);
        eventually(|| async {
            self.composition(&nsn.name).await.filter(|c| pred(c))
        })
        .await
        .unwrap_or_else(|| panic!("composition {} never satisfied the predicate", name))
    }
}

/// Polls until `f` returns `Some`, or gives up after five seconds.
pub async fn eventually<T, F, Fut>(f: F) -> Option<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(v) = f().await {
            return Some(v);
        }
        if tokio::time::Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls until `f` returns true.
pub async fn eventually_true<F, Fut>(f: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    eventually(|| async { f().await.then_some(()) }).await.is_some()
}

pub fn configmap(name: &str) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": "default" },
        "data": {}
    })
}
