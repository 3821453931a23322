//! The control loops: synthesis lifecycle, reconciliation, slice lifecycle,
//! status aggregation, and symphony replication.
//!
//! Each controller is event-driven: it watches a set of kinds, computes the
//! desired state from what it observed, writes at most one change per pass,
//! and relies on the resulting watch event to drive the next decision.

#![forbid(unsafe_code)]

use std::time::Duration;

pub mod aggregation;
pub mod cleanup;
pub mod executor;
pub mod lifecycle;
pub mod pods;
pub mod reconcile;
pub mod schemas;
pub mod slices;
pub mod symphony;

pub use executor::{ExecutorBridge, FnExecutor, LocalCommandExecutor, ResourceList, SynthesisExecutor};
pub use lifecycle::LifecycleController;
pub use reconcile::ReconcileController;

pub(crate) use eno_store::jittered;

/// Upper bound on a single reconciliation pass; a stuck store call is
/// abandoned and the item requeued.
pub(crate) const PASS_DEADLINE: Duration = Duration::from_secs(30);

/// Runtime knobs, environment-driven with parse-or-default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker retries before an in-flight synthesis is canceled outright.
    pub max_synthesis_attempts: i32,
    /// Fallbacks when the synthesizer spec leaves the timeouts unset.
    pub default_exec_timeout: Duration,
    pub default_pod_timeout: Duration,
    /// Requeue interval for resources that declare none of their own.
    pub default_reconcile_interval: Duration,
    pub reconcile_workers: usize,
    /// Byte budget per ResourceSlice.
    pub max_slice_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_synthesis_attempts: 3,
            default_exec_timeout: Duration::from_secs(120),
            default_pod_timeout: Duration::from_secs(300),
            default_reconcile_interval: Duration::from_secs(60),
            reconcile_workers: 4,
            max_slice_bytes: 1024 * 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_synthesis_attempts: env_parse("ENO_MAX_SYNTHESIS_ATTEMPTS", d.max_synthesis_attempts),
            default_exec_timeout: Duration::from_secs(env_parse(
                "ENO_DEFAULT_EXEC_TIMEOUT_SECS",
                d.default_exec_timeout.as_secs(),
            )),
            default_pod_timeout: Duration::from_secs(env_parse(
                "ENO_DEFAULT_POD_TIMEOUT_SECS",
                d.default_pod_timeout.as_secs(),
            )),
            default_reconcile_interval: Duration::from_secs(env_parse(
                "ENO_DEFAULT_RECONCILE_INTERVAL_SECS",
                d.default_reconcile_interval.as_secs(),
            )),
            reconcile_workers: env_parse("ENO_RECONCILE_WORKERS", d.reconcile_workers),
            max_slice_bytes: env_parse("ENO_MAX_SLICE_BYTES", d.max_slice_bytes),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Typed read-modify-write of a composition's status with conflict retries.
/// The mutator returns false to abort without writing.
pub async fn update_composition_status<F>(
    store: &dyn eno_store::ObjectStore,
    nsn: &eno_core::api::NamespacedName,
    mut mutate: F,
) -> eno_store::StoreResult<bool>
where
    F: FnMut(&mut eno_core::api::Composition) -> bool + Send,
{
    eno_store::update_status_with_retry(
        store,
        eno_store::keys::COMPOSITION,
        Some(&nsn.namespace),
        &nsn.name,
        |value| {
            let Ok(mut comp) = serde_json::from_value::<eno_core::api::Composition>(value.clone())
            else {
                return false;
            };
            if !mutate(&mut comp) {
                return false;
            }
            *value = eno_core::api::to_value(&comp);
            true
        },
    )
    .await
}
