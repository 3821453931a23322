//! Per-resource reconciliation: converge each live object toward its
//! synthesized [`Resource`], evaluate readiness, and record the outcome in
//! the owning slice's status.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use eno_core::api::{self, Composition, NamespacedName, ResourceSlice, ResourceState};
use eno_core::readiness;
use eno_core::resource::Resource;
use eno_reconstitute::{Cache, ResourceKey};
use eno_schema::SchemaResolver;
use eno_store::{get_as, keys, meta, update_status_with_retry, ObjectStore, StoreError, Workqueue};
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::{jittered, Config};

enum Outcome {
    Done,
    /// Try again shortly (gate not open, conflict, cache not filled).
    Soon,
    /// Converged; come back after the reconcile interval.
    After(Duration),
}

pub struct ReconcileController {
    store: Arc<dyn ObjectStore>,
    cache: Arc<Cache>,
    resolver: Arc<dyn SchemaResolver>,
    cfg: Config,
    queue: Arc<Workqueue<ResourceKey>>,
}

impl ReconcileController {
    /// Registers this controller's queue with the cache; must therefore be
    /// called before the reconstituter starts filling.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: Arc<Cache>,
        resolver: Arc<dyn SchemaResolver>,
        cfg: Config,
    ) -> Arc<Self> {
        let queue = Arc::new(Workqueue::new());
        cache.add_queue(Arc::clone(&queue));
        Arc::new(Self { store, cache, resolver, cfg, queue })
    }

    pub fn queue(&self) -> Arc<Workqueue<ResourceKey>> {
        Arc::clone(&self.queue)
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let workers = self.cfg.reconcile_workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let ctrl = Arc::clone(&self);
            handles.push(tokio::spawn(async move { ctrl.worker().await }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn worker(&self) {
        while let Some(key) = self.queue.next().await {
            let started = std::time::Instant::now();
            match tokio::time::timeout(crate::PASS_DEADLINE, self.reconcile(&key)).await {
                Ok(Ok(Outcome::Done)) => {}
                Ok(Ok(Outcome::Soon)) => self.queue.add_after(key.clone(), Duration::from_millis(250)),
                Ok(Ok(Outcome::After(interval))) => {
                    self.queue.add_after(key.clone(), jittered(interval))
                }
                Ok(Err(err)) => {
                    warn!(resource = %key.reference, error = %err, "reconciliation failed; requeueing");
                    self.queue.add_after(key.clone(), Duration::from_secs(1));
                }
                Err(_) => {
                    warn!(resource = %key.reference, "reconcile pass deadline exceeded; requeueing");
                    self.queue.add_after(key.clone(), Duration::from_secs(1));
                }
            }
            histogram!("reconcile_pass_ms", started.elapsed().as_secs_f64() * 1000.0);
            self.queue.done(&key);
        }
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<Outcome> {
        let store = self.store.as_ref();
        let nsn = &key.composition;
        let Some(comp) =
            get_as::<Composition>(store, keys::COMPOSITION, Some(&nsn.namespace), &nsn.name).await?
        else {
            return Ok(Outcome::Done); // cache purge follows the watch event
        };

        // Prefer the current synthesis; fall back to the previous one while
        // the current fill is still pending.
        let mut picked: Option<(Arc<Resource>, Option<Arc<Resource>>, String)> = None;
        if let Some(current) = &comp.status.current_synthesis {
            if let Some(res) = self.cache.get(nsn, &current.uuid, &key.reference) {
                let old = comp
                    .status
                    .previous_synthesis
                    .as_ref()
                    .and_then(|p| self.cache.get(nsn, &p.uuid, &key.reference));
                picked = Some((res, old, current.uuid.clone()));
            }
        }
        if picked.is_none() {
            if let Some(previous) = &comp.status.previous_synthesis {
                if let Some(res) = self.cache.get(nsn, &previous.uuid, &key.reference) {
                    picked = Some((res, None, previous.uuid.clone()));
                }
            }
        }
        let Some((resource, old, uuid)) = picked else {
            debug!(resource = %key.reference, "not cached yet; requeueing");
            return Ok(Outcome::Soon);
        };

        let gvk_key = resource.gvk_key();
        let namespace = opt_ns(&resource.reference.namespace);
        let name = resource.reference.name.as_str();
        let mut live = store.get(&gvk_key, namespace, name).await?;

        if resource.deleted(&comp) {
            // Patched objects are not owned; teardown leaves them alone
            // unless the patch itself set the deletion timestamp.
            let owned = resource.patch.is_none() || resource.patch_sets_deletion_timestamp();
            if let (Some(current), true) = (&live, owned) {
                match store.delete(&gvk_key, namespace, name, meta::resource_version(current)).await {
                    Ok(()) => counter!("resources_deleted_total", 1u64),
                    Err(e) if e.is_conflict() => return Ok(Outcome::Soon),
                    Err(e) => return Err(e.into()),
                }
            }
            let state = ResourceState { ready: None, reconciled: true };
            self.write_state(&resource, &state).await?;
            resource.set_state(state);
            return Ok(Outcome::Done);
        }

        // Rollout ordering: every resource in a strictly smaller readiness
        // group must be ready before this one is touched.
        if !self.gate_open(nsn, &uuid, &resource) {
            debug!(resource = %key.reference, group = resource.readiness_group, "readiness group gate closed");
            return Ok(Outcome::Soon);
        }

        if let Some(ops) = &resource.patch {
            // Patch resources modify existing objects only.
            if let Some(current) = &live {
                if let Some(patched) = eno_apply::apply_ops(ops, current)? {
                    match store.update(&gvk_key, patched).await {
                        Ok(v) => {
                            counter!("resources_patched_total", 1u64);
                            live = Some(v);
                        }
                        Err(e) if e.is_conflict() => return Ok(Outcome::Soon),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        } else if live.is_none() {
            match store.create(&gvk_key, resource.parsed().clone()).await {
                Ok(v) => {
                    counter!("resources_created_total", 1u64);
                    live = Some(v);
                }
                Err(StoreError::AlreadyExists(_)) => return Ok(Outcome::Soon),
                Err(e) => return Err(e.into()),
            }
        } else if !resource.disable_updates {
            let current = live.as_ref().unwrap();
            let schema = match self.resolver.resolve(&resource.gvk).await {
                Ok(schema) => schema,
                Err(err) => {
                    warn!(resource = %key.reference, error = %err, "schema lookup failed; using schema-free merge");
                    None
                }
            };
            let old_parsed = old.as_ref().map(|o| o.parsed());
            if let Some(merged) =
                eno_apply::merge(old_parsed, resource.parsed(), current, schema.as_deref())?
            {
                match store.update(&gvk_key, merged).await {
                    Ok(v) => {
                        counter!("resources_updated_total", 1u64);
                        live = Some(v);
                    }
                    Err(e) if e.is_conflict() => return Ok(Outcome::Soon),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        // Readiness: sticky once every check has passed.
        let ready_now = live
            .as_ref()
            .map(|l| readiness::all_ready(&resource.readiness_checks, l))
            .unwrap_or(false);
        let ready = resource
            .state()
            .and_then(|s| s.ready)
            .or_else(|| ready_now.then(Utc::now));
        let state = ResourceState { ready, reconciled: true };
        self.write_state(&resource, &state).await?;
        resource.set_state(state);

        let interval = resource
            .reconcile_interval
            .or(comp.spec.reconcile_interval)
            .unwrap_or(self.cfg.default_reconcile_interval);
        Ok(Outcome::After(interval))
    }

    fn gate_open(&self, nsn: &NamespacedName, uuid: &str, resource: &Resource) -> bool {
        let Some(view) = self.cache.synthesis(nsn, uuid) else { return true };
        let result = view.resources().all(|other| {
            other.readiness_group >= resource.readiness_group
                || other.state().map(|s| s.ready.is_some()).unwrap_or(false)
        });
        result
    }

    /// Persists the resource state into the owning slice's status at the
    /// manifest index.
    async fn write_state(&self, resource: &Resource, state: &ResourceState) -> Result<()> {
        let slice_nsn = &resource.manifest_ref.slice;
        let index = resource.manifest_ref.index;
        let state = state.clone();
        update_status_with_retry(
            self.store.as_ref(),
            keys::RESOURCE_SLICE,
            Some(&slice_nsn.namespace),
            &slice_nsn.name,
            move |value| {
                let Ok(mut slice) = serde_json::from_value::<ResourceSlice>(value.clone()) else {
                    return false;
                };
                let len = slice.spec.resources.len();
                if index >= len {
                    return false;
                }
                if slice.status.resources.len() != len {
                    slice.status.resources.resize(len, ResourceState::default());
                }
                if slice.status.resources[index] == state {
                    return false;
                }
                slice.status.resources[index] = state.clone();
                *value = api::to_value(&slice);
                true
            },
        )
        .await?;
        Ok(())
    }
}

fn opt_ns(ns: &str) -> Option<&str> {
    if ns.is_empty() {
        None
    } else {
        Some(ns)
    }
}
