//! Slice lifecycle: garbage-collects slices whose synthesis rotated out,
//! slices orphaned by cancellation, and every slice of a torn-down
//! composition; detects referenced slices that went missing and forces a
//! resynthesis. This controller is the sole writer of
//! `pendingResynthesis`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use eno_core::api::{
    self, Composition, NamespacedName, ResourceSlice, COMPOSITION_NAME_LABEL, SYNTHESIS_UUID_LABEL,
};
use eno_store::{get_as, keys, meta, ObjectStore, Selector, Workqueue};
use metrics::counter;
use tracing::{info, warn};

use crate::update_composition_status;

pub struct SliceCleanupController {
    store: Arc<dyn ObjectStore>,
}

impl SliceCleanupController {
    pub fn new(store: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let queue = Arc::new(Workqueue::<NamespacedName>::new());
        let mut slice_events = self.store.watch(keys::RESOURCE_SLICE).await?;
        let mut comp_events = self.store.watch(keys::COMPOSITION).await?;

        {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(ev) = slice_events.recv().await {
                    let obj = ev.object();
                    // Deletion events matter most here: a still-referenced
                    // slice disappearing forces resynthesis.
                    if let Some((Composition::KIND, owner)) = meta::controller_owner(obj) {
                        queue.add(NamespacedName::new(meta::namespace(obj), owner));
                    }
                }
                queue.close();
            });
        }
        {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(ev) = comp_events.recv().await {
                    queue.add(meta::nsn(ev.object()));
                }
            });
        }

        while let Some(nsn) = queue.next().await {
            if let Err(err) = self.reconcile(&nsn).await {
                warn!(comp = %nsn, error = %err, "slice cleanup failed; requeueing");
                queue.add_after(nsn.clone(), Duration::from_millis(500));
            }
            queue.done(&nsn);
        }
        Ok(())
    }

    pub async fn reconcile(&self, nsn: &NamespacedName) -> Result<()> {
        let store = self.store.as_ref();
        let by_comp = Selector::new().with(COMPOSITION_NAME_LABEL, &nsn.name);

        let Some(comp) =
            get_as::<Composition>(store, keys::COMPOSITION, Some(&nsn.namespace), &nsn.name).await?
        else {
            // Composition is gone entirely; everything it labeled goes too.
            for slice in store.list(keys::RESOURCE_SLICE, Some(&nsn.namespace), &by_comp).await? {
                self.delete_slice(&nsn.namespace, &slice).await?;
            }
            return Ok(());
        };

        if comp.deleting() {
            return self.collect_torn_down(&comp).await;
        }

        // Previous synthesis slices go once the current one has converged.
        if let (Some(previous), Some(current)) =
            (&comp.status.previous_synthesis, &comp.status.current_synthesis)
        {
            if current.reconciled.is_some() {
                let sel = by_comp.clone().with(SYNTHESIS_UUID_LABEL, &previous.uuid);
                let stale = store.list(keys::RESOURCE_SLICE, Some(&nsn.namespace), &sel).await?;
                if !stale.is_empty() {
                    for slice in stale {
                        self.delete_slice(&nsn.namespace, &slice).await?;
                    }
                    return Ok(());
                }
                // All previous slices gone: drop the record.
                update_composition_status(store, nsn, |c| {
                    c.status.previous_synthesis.take().is_some()
                })
                .await?;
                return Ok(());
            }
        }

        // Orphans: slices labeled for a synthesis no reference points at
        // (e.g. produced by a synthesis that was canceled mid-delivery).
        let referenced: HashSet<&str> = [
            comp.status.in_flight_synthesis.as_ref(),
            comp.status.current_synthesis.as_ref(),
            comp.status.previous_synthesis.as_ref(),
        ]
        .into_iter()
        .flatten()
        .map(|s| s.uuid.as_str())
        .collect();
        for slice in store.list(keys::RESOURCE_SLICE, Some(&nsn.namespace), &by_comp).await? {
            let uuid = meta::label(&slice, SYNTHESIS_UUID_LABEL).unwrap_or("");
            if !referenced.contains(uuid) {
                counter!("orphaned_slices_deleted_total", 1u64);
                self.delete_slice(&nsn.namespace, &slice).await?;
            }
        }

        // A slice the current synthesis still references must not vanish;
        // if one did, force a resynthesis.
        if comp.status.pending_resynthesis.is_none() && !comp.synthesis_in_flight() {
            if let Some(current) = &comp.status.current_synthesis {
                if current.observed_composition_generation == comp.metadata.generation {
                    for slice_ref in &current.resource_slices {
                        let missing = store
                            .get(keys::RESOURCE_SLICE, Some(&nsn.namespace), &slice_ref.name)
                            .await?
                            .is_none();
                        if missing {
                            counter!("forced_resyntheses_total", 1u64);
                            info!(comp = %nsn, slice = %slice_ref.name, "referenced slice missing; forcing resynthesis");
                            update_composition_status(store, nsn, |c| {
                                if c.status.pending_resynthesis.is_some() {
                                    return false;
                                }
                                c.status.pending_resynthesis = Some(Utc::now());
                                true
                            })
                            .await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// On composition teardown a slice may be collected only once every
    /// non-patch object it materialized is actually gone from the store
    /// (or the composition orphans its resources).
    async fn collect_torn_down(&self, comp: &Composition) -> Result<()> {
        let store = self.store.as_ref();
        let nsn = comp.nsn();
        let orphaning = comp.should_orphan_resources();
        let owned = store
            .list(
                keys::RESOURCE_SLICE,
                Some(&nsn.namespace),
                &Selector::new().with(COMPOSITION_NAME_LABEL, &nsn.name),
            )
            .await?;
        for value in owned {
            let slice: ResourceSlice = api::from_value(value.clone())?;
            if orphaning || self.all_absent(&slice).await? {
                self.delete_slice(&nsn.namespace, &value).await?;
            }
        }
        Ok(())
    }

    async fn all_absent(&self, slice: &ResourceSlice) -> Result<bool> {
        for entry in &slice.spec.resources {
            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&entry.manifest) else {
                continue; // unparseable manifests never materialized
            };
            let api_version = parsed.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
            let kind = parsed.get("kind").and_then(|v| v.as_str()).unwrap_or("");
            if api_version == api::API_VERSION && kind == "Patch" {
                continue; // patch targets are not owned
            }
            let name = parsed.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or("");
            if name.is_empty() {
                continue;
            }
            let ns = parsed.pointer("/metadata/namespace").and_then(|v| v.as_str());
            let gvk_key = format!("{}/{}", api_version, kind);
            if self.store.get(&gvk_key, ns, name).await?.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn delete_slice(&self, namespace: &str, slice: &serde_json::Value) -> Result<()> {
        self.store
            .delete(
                keys::RESOURCE_SLICE,
                Some(namespace),
                meta::name(slice),
                meta::resource_version(slice),
            )
            .await?;
        counter!("slices_deleted_total", 1u64);
        Ok(())
    }
}
