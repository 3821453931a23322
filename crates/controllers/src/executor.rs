//! The synthesizer worker contract and the bridge that drives it.
//!
//! A worker receives a KRM `ResourceList` of resolved inputs and must emit
//! a `ResourceList` of output manifests; its exit status is not
//! authoritative, output presence is. [`SynthesisExecutor`] is the seam:
//! production transports live behind it, tests plug in closures.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use eno_core::api::{
    self, Composition, Manifest, NamespacedName, ResourceSliceRef, Synthesizer, SynthesisResult,
};
use eno_core::resource::new_input_revisions;
use eno_store::{get_as, keys, ObjectStore, StoreError, StoreEvent};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::slices::build_slices;
use crate::{update_composition_status, Config};

/// Binding key annotation stamped on each input object handed to a worker.
pub const INPUT_KEY_ANNOTATION: &str = "eno.azure.io/input-key";

/// KRM-style resource list: the wire shape on both sides of a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceList {
    pub api_version: String,
    pub kind: String,
    pub items: Vec<Value>,
    pub results: Vec<SynthesisResult>,
}

impl Default for ResourceList {
    fn default() -> Self {
        Self {
            api_version: "config.kubernetes.io/v1".into(),
            kind: "ResourceList".into(),
            items: Vec::new(),
            results: Vec::new(),
        }
    }
}

impl ResourceList {
    pub fn of(items: Vec<Value>) -> Self {
        Self { items, ..Default::default() }
    }
}

#[async_trait::async_trait]
pub trait SynthesisExecutor: Send + Sync {
    async fn synthesize(
        &self,
        synthesizer: &Synthesizer,
        comp: &Composition,
        input: &ResourceList,
    ) -> Result<ResourceList>;
}

/// Closure-backed executor for tests.
pub struct FnExecutor<F>(pub F);

#[async_trait::async_trait]
impl<F> SynthesisExecutor for FnExecutor<F>
where
    F: Fn(&Synthesizer, &Composition, &ResourceList) -> Result<ResourceList> + Send + Sync,
{
    async fn synthesize(
        &self,
        synthesizer: &Synthesizer,
        comp: &Composition,
        input: &ResourceList,
    ) -> Result<ResourceList> {
        (self.0)(synthesizer, comp, input)
    }
}

/// Runs the synthesizer command as a local child process, writing the
/// input list to stdin and parsing the output list from stdout. This is
/// the in-process rendition of the worker contract; the sandboxed pod
/// transport lives outside this repository.
pub struct LocalCommandExecutor;

#[async_trait::async_trait]
impl SynthesisExecutor for LocalCommandExecutor {
    async fn synthesize(
        &self,
        synthesizer: &Synthesizer,
        comp: &Composition,
        input: &ResourceList,
    ) -> Result<ResourceList> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let command = &synthesizer.spec.command;
        if command.is_empty() {
            bail!("synthesizer {} has no command", synthesizer.metadata.name);
        }
        let mut child = tokio::process::Command::new(&command[0])
            .args(&command[1..])
            .envs(comp.spec.synthesis_env.iter().map(|e| (e.name.clone(), e.value.clone())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning synthesizer {}", command[0]))?;

        let payload = serde_json::to_vec(input)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }
        let out = child.wait_with_output().await?;
        // Exit status is not authoritative; output presence is.
        serde_json::from_slice(&out.stdout).context("parsing synthesizer output")
    }
}

/// Resolves the composition's bindings into the worker input list.
/// Returns `None` when any bound object is missing.
pub async fn build_input(
    store: &dyn ObjectStore,
    comp: &Composition,
    synthesizer: &Synthesizer,
) -> Result<Option<ResourceList>> {
    let mut items = Vec::with_capacity(comp.spec.bindings.len());
    for binding in &comp.spec.bindings {
        let Some(input_ref) = synthesizer.spec.refs.iter().find(|r| r.key == binding.key) else {
            bail!("binding {} has no matching synthesizer ref", binding.key);
        };
        let r = &input_ref.resource;
        let gvk_key = if r.group.is_empty() {
            format!("{}/{}", r.version, r.kind)
        } else {
            format!("{}/{}/{}", r.group, r.version, r.kind)
        };
        let namespace = if binding.resource.namespace.is_empty() {
            comp.metadata.namespace.as_str()
        } else {
            binding.resource.namespace.as_str()
        };
        let Some(mut obj) = store.get(&gvk_key, Some(namespace), &binding.resource.name).await? else {
            return Ok(None);
        };
        obj["metadata"]["annotations"][INPUT_KEY_ANNOTATION] = Value::String(binding.key.clone());
        items.push(obj);
    }
    Ok(Some(ResourceList::of(items)))
}

/// Recomputes the input revision snapshot for the current bindings.
/// `None` when an input is missing.
pub async fn snapshot_input_revisions(
    store: &dyn ObjectStore,
    comp: &Composition,
    synthesizer: &Synthesizer,
) -> Result<Option<Vec<api::InputRevisions>>> {
    let Some(input) = build_input(store, comp, synthesizer).await? else {
        return Ok(None);
    };
    let revisions = comp
        .spec
        .bindings
        .iter()
        .zip(input.items.iter())
        .map(|(binding, obj)| new_input_revisions(obj, &binding.key))
        .collect();
    Ok(Some(revisions))
}

/// Persists a worker's output: slices are created first, then the
/// in-flight synthesis is stamped `synthesized` and promoted to current in
/// a single status update. Stale deliveries (canceled or replaced
/// syntheses) are dropped.
pub async fn ingest(
    store: &dyn ObjectStore,
    cfg: &Config,
    nsn: &NamespacedName,
    uuid: &str,
    output: ResourceList,
) -> Result<()> {
    let Some(comp) =
        get_as::<Composition>(store, keys::COMPOSITION, Some(&nsn.namespace), &nsn.name).await?
    else {
        return Ok(());
    };
    let Some(in_flight) = &comp.status.in_flight_synthesis else { return Ok(()) };
    if in_flight.uuid != uuid || in_flight.canceled.is_some() || in_flight.synthesized() {
        debug!(comp = %nsn, uuid, "dropping stale synthesis output");
        return Ok(());
    }

    // A deleting composition still synthesizes one final time, with every
    // manifest marked for removal.
    let deleting = comp.deleting() && !comp.should_orphan_resources();

    let mut results = output.results;
    let mut manifests = Vec::with_capacity(output.items.len());
    for item in &output.items {
        let valid = item.get("apiVersion").and_then(|v| v.as_str()).map(|s| !s.is_empty()).unwrap_or(false)
            && item.get("kind").and_then(|v| v.as_str()).map(|s| !s.is_empty()).unwrap_or(false)
            && item.pointer("/metadata/name").and_then(|v| v.as_str()).map(|s| !s.is_empty()).unwrap_or(false);
        if !valid {
            counter!("synthesis_invalid_manifests_total", 1u64);
            results.push(SynthesisResult {
                message: "manifest missing name, kind, or apiVersion".into(),
                severity: "error".into(),
            });
            continue;
        }
        manifests.push(Manifest { manifest: serde_json::to_string(item)?, deleted: deleting });
    }

    let slices = build_slices(&comp, uuid, manifests, cfg.max_slice_bytes);
    let refs: Vec<ResourceSliceRef> =
        slices.iter().map(|s| ResourceSliceRef { name: s.metadata.name.clone() }).collect();
    let count = slices.len() as i64;
    for slice in slices {
        match store.create(keys::RESOURCE_SLICE, api::to_value(&slice)).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists(_)) => {} // ingestion retry
            Err(e) => return Err(e.into()),
        }
    }

    let uuid = uuid.to_string();
    update_composition_status(store, nsn, move |comp| {
        let Some(in_flight) = comp.status.in_flight_synthesis.as_mut() else { return false };
        if in_flight.uuid != uuid || in_flight.canceled.is_some() || in_flight.synthesized() {
            return false;
        }
        in_flight.resource_slices = refs.clone();
        in_flight.resource_slice_count = Some(count);
        in_flight.results = results.clone();
        in_flight.synthesized = Some(chrono::Utc::now());
        let done = comp.status.in_flight_synthesis.take().unwrap();
        comp.status.current_synthesis = Some(done);
        true
    })
    .await?;
    counter!("syntheses_completed_total", 1u64);
    info!(comp = %nsn, slices = count, "synthesis complete");
    Ok(())
}

/// Watches compositions and runs the executor for in-flight syntheses
/// whose worker has been requested.
pub struct ExecutorBridge {
    store: Arc<dyn ObjectStore>,
    executor: Arc<dyn SynthesisExecutor>,
    cfg: Config,
    running: Mutex<HashSet<String>>,
}

impl ExecutorBridge {
    pub fn new(store: Arc<dyn ObjectStore>, executor: Arc<dyn SynthesisExecutor>, cfg: Config) -> Self {
        Self { store, executor, cfg, running: Mutex::new(HashSet::new()) }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut events = self.store.watch(keys::COMPOSITION).await?;
        while let Some(ev) = events.recv().await {
            let StoreEvent::Applied(v) = ev else { continue };
            let Ok(comp) = api::from_value::<Composition>(v) else { continue };
            let Some(in_flight) = &comp.status.in_flight_synthesis else { continue };
            if in_flight.canceled.is_some()
                || in_flight.synthesized()
                || in_flight.pod_creation.is_none()
            {
                continue;
            }
            let uuid = in_flight.uuid.clone();
            if !self.running.lock().unwrap().insert(uuid.clone()) {
                continue; // already synthesizing this uuid
            }
            let bridge = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = bridge.synthesize_once(&comp, &uuid).await {
                    warn!(comp = %comp.nsn(), uuid = %uuid, error = %err, "synthesis attempt failed");
                }
                bridge.running.lock().unwrap().remove(&uuid);
            });
        }
        Ok(())
    }

    async fn synthesize_once(&self, comp: &Composition, uuid: &str) -> Result<()> {
        let Some(synthesizer) = get_as::<Synthesizer>(
            self.store.as_ref(),
            keys::SYNTHESIZER,
            Some(&comp.metadata.namespace),
            &comp.spec.synthesizer.name,
        )
        .await?
        else {
            return Ok(()); // synthesizer gone; lifecycle handles it
        };
        let Some(input) = build_input(self.store.as_ref(), comp, &synthesizer).await? else {
            warn!(comp = %comp.nsn(), "bound input missing; deferring synthesis");
            return Ok(());
        };
        let timeout = synthesizer.spec.exec_timeout.unwrap_or(self.cfg.default_exec_timeout);
        match tokio::time::timeout(timeout, self.executor.synthesize(&synthesizer, comp, &input)).await {
            Ok(Ok(output)) => ingest(self.store.as_ref(), &self.cfg, &comp.nsn(), uuid, output).await,
            Ok(Err(err)) => {
                counter!("synthesis_executor_errors_total", 1u64);
                warn!(comp = %comp.nsn(), error = %err, "synthesizer failed; worker pruning will retry");
                Ok(())
            }
            Err(_) => {
                counter!("synthesis_executor_timeouts_total", 1u64);
                warn!(comp = %comp.nsn(), "synthesizer timed out; worker pruning will retry");
                Ok(())
            }
        }
    }
}
