//! Rolls per-resource slice states up into the owning synthesis:
//! `reconciled` once every resource has been reconciled, `ready` once every
//! resource is ready. Timestamps are stamped once and never move.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use eno_core::api::{Composition, NamespacedName, ResourceSlice};
use eno_store::{get_as, keys, meta, ObjectStore, Workqueue};
use tracing::{debug, warn};

use crate::update_composition_status;

pub struct StatusAggregator {
    store: Arc<dyn ObjectStore>,
}

impl StatusAggregator {
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
                warn!(comp = %nsn, error = %err, "status aggregation failed; requeueing");
                queue.add_after(nsn.clone(), Duration::from_millis(500));
            }
            queue.done(&nsn);
        }
        Ok(())
    }

    pub async fn reconcile(&self, nsn: &NamespacedName) -> Result<()> {
        let store = self.store.as_ref();
        let Some(comp) =
            get_as::<Composition>(store, keys::COMPOSITION, Some(&nsn.namespace), &nsn.name).await?
        else {
            return Ok(());
        };
        let Some(current) = &comp.status.current_synthesis else { return Ok(()) };
        if !current.synthesized() || (current.reconciled.is_some() && current.ready.is_some()) {
            return Ok(());
        }

        let mut all_reconciled = true;
        let mut ready_at = None;
        let mut all_ready = true;
        for slice_ref in &current.resource_slices {
            let Some(slice) = get_as::<ResourceSlice>(
                store,
                keys::RESOURCE_SLICE,
                Some(&nsn.namespace),
                &slice_ref.name,
            )
            .await?
            else {
                debug!(comp = %nsn, slice = %slice_ref.name, "referenced slice missing; skipping rollup");
                return Ok(());
            };
            all_reconciled = all_reconciled && slice.fully_reconciled();
            match slice.all_ready_at() {
                Some(t) => ready_at = Some(ready_at.map_or(t, |m: chrono::DateTime<Utc>| m.max(t))),
                None => all_ready = false,
            }
        }
        if current.resource_slices.is_empty() {
            // Nothing to materialize; the synthesis is trivially done.
            ready_at = Some(Utc::now());
        }
        if !all_reconciled && !(all_ready && ready_at.is_some()) {
            return Ok(());
        }

        let uuid = current.uuid.clone();
        let ready = if all_ready { ready_at } else { None };
        update_composition_status(store, nsn, move |c| {
            let Some(current) = c.status.current_synthesis.as_mut() else { return false };
            if current.uuid != uuid {
                return false;
            }
            let mut changed = false;
            if all_reconciled && current.reconciled.is_none() {
                current.reconciled = Some(Utc::now());
                changed = true;
            }
            if let Some(ready) = ready {
                if current.ready.is_none() {
                    current.ready = Some(ready);
                    changed = true;
                }
            }
            changed
        })
        .await?;
        Ok(())
    }
}
