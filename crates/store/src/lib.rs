//! The object-store boundary.
//!
//! Everything durable lives in an external, strongly-consistent,
//! watch-capable store of versioned JSON objects (a Kubernetes apiserver in
//! production). Controllers only ever talk to [`ObjectStore`]; the kube
//! adapter and the in-memory store used by tests both implement it.

#![forbid(unsafe_code)]

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod meta;
pub mod queue;

pub use memory::MemoryStore;
pub use queue::Workqueue;

/// Store keys for the kinds the controllers touch, in `group/version/Kind`
/// (or `version/Kind`) form.
pub mod keys {
    pub const COMPOSITION: &str = "eno.azure.io/v1/Composition";
    pub const SYNTHESIZER: &str = "eno.azure.io/v1/Synthesizer";
    pub const RESOURCE_SLICE: &str = "eno.azure.io/v1/ResourceSlice";
    pub const SYMPHONY: &str = "eno.azure.io/v1/Symphony";
    pub const POD: &str = "v1/Pod";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Applied(Value),
    Deleted(Value),
}

impl StoreEvent {
    pub fn object(&self) -> &Value {
        match self {
            StoreEvent::Applied(v) | StoreEvent::Deleted(v) => v,
        }
    }
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default)]
pub struct Selector(pub Vec<(String, String)>);

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, obj: &Value) -> bool {
        self.0.iter().all(|(k, v)| {
            obj.pointer("/metadata/labels")
                .and_then(|l| l.get(k))
                .and_then(|l| l.as_str())
                == Some(v.as_str())
        })
    }

    /// `k1=v1,k2=v2` form for apiserver-side filtering.
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A strongly-consistent, watch-capable store of versioned objects.
///
/// Semantics mirror the apiserver's: `update`/`update_status` require the
/// caller's resourceVersion to match (else [`StoreError::Conflict`]);
/// `update_status` touches only the status subresource; `delete` of a
/// missing object succeeds; deleting an object holding finalizers stamps
/// its deletionTimestamp instead of removing it, and the removal happens
/// when an update clears the last finalizer. `watch` replays the current
/// contents as `Applied` events before streaming changes.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, gvk_key: &str, namespace: Option<&str>, name: &str) -> StoreResult<Option<Value>>;

    async fn list(&self, gvk_key: &str, namespace: Option<&str>, selector: &Selector) -> StoreResult<Vec<Value>>;

    async fn create(&self, gvk_key: &str, obj: Value) -> StoreResult<Value>;

    async fn update(&self, gvk_key: &str, obj: Value) -> StoreResult<Value>;

    async fn update_status(&self, gvk_key: &str, obj: Value) -> StoreResult<Value>;

    async fn delete(
        &self,
        gvk_key: &str,
        namespace: Option<&str>,
        name: &str,
        resource_version: Option<&str>,
    ) -> StoreResult<()>;

    async fn watch(&self, gvk_key: &str) -> StoreResult<mpsc::Receiver<StoreEvent>>;
}

/// Get + deserialize in one step.
pub async fn get_as<T: serde::de::DeserializeOwned>(
    store: &dyn ObjectStore,
    gvk_key: &str,
    namespace: Option<&str>,
    name: &str,
) -> StoreResult<Option<T>> {
    match store.get(gvk_key, namespace, name).await? {
        None => Ok(None),
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|e| StoreError::Internal(format!("decoding {}: {}", gvk_key, e))),
    }
}

/// Read-modify-write of the status subresource with bounded conflict
/// retries. The mutator returns false to abort without writing (e.g. the
/// condition it wanted to record is already present).
pub async fn update_status_with_retry<F>(
    store: &dyn ObjectStore,
    gvk_key: &str,
    namespace: Option<&str>,
    name: &str,
    mut mutate: F,
) -> StoreResult<bool>
where
    F: FnMut(&mut Value) -> bool + Send,
{
    const ATTEMPTS: usize = 5;
    for _ in 0..ATTEMPTS {
        let Some(mut obj) = store.get(gvk_key, namespace, name).await? else {
            return Ok(false);
        };
        if !mutate(&mut obj) {
            return Ok(false);
        }
        match store.update_status(gvk_key, obj).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_conflict() => continue,
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::Conflict(format!("{}/{}: retries exhausted", gvk_key, name)))
}

/// Bounded channel capacity used for watch fan-out.
pub fn queue_cap() -> usize {
    std::env::var("ENO_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2048)
}

/// Applies a deterministic ±10% jitter to an interval so periodic work
/// (requeues, relists) spreads out instead of synchronizing across keys.
pub fn jittered(interval: std::time::Duration) -> std::time::Duration {
    use std::time::Duration;
    let span = interval / 10;
    if span.is_zero() {
        return interval;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u128;
    let offset = Duration::from_nanos((nanos % span.as_nanos().max(1)) as u64);
    if nanos % 2 == 0 {
        interval + offset
    } else {
        interval.saturating_sub(offset).max(Duration::from_millis(1))
    }
}
