//! The synthesis lifecycle state machine.
//!
//! One pass makes at most one logical change (finalizer, pod delete, pod
//! create, or a single status update) and returns; the watch event for
//! that change drives the next pass. State is always re-derived from the
//! store, never replayed from memory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use eno_core::api::{
    self, Composition, NamespacedName, Synthesis, Synthesizer, CLEANUP_FINALIZER,
    COMPOSITION_NAMESPACE_LABEL, COMPOSITION_NAME_LABEL,
};
use eno_store::{get_as, keys, meta, ObjectStore, Selector, StoreError, Workqueue};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::executor::snapshot_input_revisions;
use crate::pods::{build_worker_pod, should_delete_pod, PodView};
use crate::{update_composition_status, Config};

pub struct LifecycleController {
    store: Arc<dyn ObjectStore>,
    cfg: Config,
}

impl LifecycleController {
    pub fn new(store: Arc<dyn ObjectStore>, cfg: Config) -> Arc<Self> {
        Arc::new(Self { store, cfg })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let queue = Arc::new(Workqueue::<NamespacedName>::new());

        let mut comp_events = self.store.watch(keys::COMPOSITION).await?;
        let mut synth_events = self.store.watch(keys::SYNTHESIZER).await?;
        let mut pod_events = self.store.watch(keys::POD).await?;

        {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(ev) = comp_events.recv().await {
                    queue.add(meta::nsn(ev.object()));
                }
                queue.close();
            });
        }
        {
            // A synthesizer change re-enqueues every composition that uses it.
            let queue = Arc::clone(&queue);
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                while let Some(ev) = synth_events.recv().await {
                    let synth_name = meta::name(ev.object()).to_string();
                    let ns = meta::namespace(ev.object()).to_string();
                    let comps = match store.list(keys::COMPOSITION, Some(&ns), &Selector::new()).await {
                        Ok(comps) => comps,
                        Err(err) => {
                            warn!(error = %err, "listing compositions for synthesizer event");
                            continue;
                        }
                    };
                    for comp in comps {
                        let uses = comp
                            .pointer("/spec/synthesizer/name")
                            .and_then(|v| v.as_str())
                            == Some(synth_name.as_str());
                        if uses {
                            queue.add(meta::nsn(&comp));
                        }
                    }
                }
            });
        }
        {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(ev) = pod_events.recv().await {
                    let obj = ev.object();
                    let (Some(name), Some(ns)) = (
                        meta::label(obj, COMPOSITION_NAME_LABEL),
                        meta::label(obj, COMPOSITION_NAMESPACE_LABEL),
                    ) else {
                        continue;
                    };
                    queue.add(NamespacedName::new(ns, name));
                }
            });
        }

        // Single worker serializes the per-composition state machine. Each
        // pass runs under a deadline so a stuck store call cannot wedge it.
        while let Some(nsn) = queue.next().await {
            match tokio::time::timeout(crate::PASS_DEADLINE, self.reconcile(&nsn)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(comp = %nsn, error = %err, "lifecycle pass failed; requeueing");
                    queue.add_after(nsn.clone(), Duration::from_millis(500));
                }
                Err(_) => {
                    warn!(comp = %nsn, "lifecycle pass deadline exceeded; requeueing");
                    queue.add_after(nsn.clone(), Duration::from_millis(500));
                }
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
        let synthesizer = get_as::<Synthesizer>(
            store,
            keys::SYNTHESIZER,
            Some(&nsn.namespace),
            &comp.spec.synthesizer.name,
        )
        .await?;

        // Every live composition holds the cleanup finalizer.
        if !comp.deleting() && !comp.metadata.has_finalizer(CLEANUP_FINALIZER) {
            let mut updated = comp.clone();
            updated.metadata.add_finalizer(CLEANUP_FINALIZER);
            store.update(keys::COMPOSITION, api::to_value(&updated)).await?;
            return Ok(());
        }

        // Worker pruning runs unconditionally, deleted compositions included.
        let selector = Selector::new()
            .with(COMPOSITION_NAME_LABEL, &comp.metadata.name)
            .with(COMPOSITION_NAMESPACE_LABEL, &comp.metadata.namespace);
        let pods: Vec<PodView> = store
            .list(keys::POD, Some(&nsn.namespace), &selector)
            .await?
            .iter()
            .map(PodView::from_value)
            .collect();
        let (deletable, pod_exists) =
            should_delete_pod(&comp, synthesizer.as_ref(), &pods, &self.cfg, Utc::now());
        if let Some(pod) = deletable {
            store
                .delete(keys::POD, Some(&nsn.namespace), &pod.name, pod.resource_version.as_deref())
                .await?;
            counter!("worker_pods_deleted_total", 1u64);
            info!(comp = %nsn, pod = %pod.name, "deleted worker pod");

            // A worker that never delivered consumed one attempt.
            let uuid = pod.synthesis_uuid().map(str::to_string);
            let never_delivered = uuid
                .as_deref()
                .and_then(|u| comp.synthesis_by_uuid(u))
                .map(|s| !s.synthesized() && s.canceled.is_none())
                .unwrap_or(false);
            if never_delivered {
                update_composition_status(store, nsn, move |c| {
                    let Some(in_flight) = c.status.in_flight_synthesis.as_mut() else { return false };
                    if Some(in_flight.uuid.as_str()) != uuid.as_deref() || in_flight.synthesized() {
                        return false;
                    }
                    in_flight.attempts += 1;
                    true
                })
                .await?;
            }
            return Ok(());
        }

        if comp.deleting() {
            return self.reconcile_deleted(&comp, synthesizer.as_ref(), pod_exists).await;
        }

        if let Some(in_flight) = &comp.status.in_flight_synthesis {
            if in_flight.canceled.is_none() {
                return self.drive_in_flight(&comp, synthesizer.as_ref(), in_flight, pod_exists).await;
            }
            // A canceled in-flight stays in place to suppress retries; the
            // eligibility gate below replaces it once a generation advances.
        }

        let Some(synthesizer) = synthesizer else {
            debug!(comp = %nsn, synthesizer = %comp.spec.synthesizer.name, "synthesizer not found");
            return Ok(());
        };
        let Some(revisions) = snapshot_input_revisions(store, &comp, &synthesizer).await? else {
            debug!(comp = %nsn, "bound input missing; deferring synthesis");
            return Ok(());
        };
        if comp.needs_synthesis(&synthesizer, &revisions) {
            let fresh = Synthesis::new(&comp, &synthesizer, revisions);
            let uuid = fresh.uuid.clone();
            let wrote = update_composition_status(store, nsn, move |c| {
                if c.synthesis_in_flight() {
                    return false; // someone beat us to it
                }
                // The last good synthesis stays visible while the new one runs.
                if let Some(current) = c.status.current_synthesis.take() {
                    c.status.previous_synthesis = Some(current);
                }
                c.status.in_flight_synthesis = Some(fresh.clone());
                c.status.pending_resynthesis = None;
                true
            })
            .await?;
            if wrote {
                counter!("syntheses_started_total", 1u64);
                info!(comp = %nsn, uuid = %uuid, "started synthesis");
            }
        }
        Ok(())
    }

    /// Deletion drives the status forward without launching workers, then
    /// releases the finalizer once every owned slice has been collected.
    async fn reconcile_deleted(
        &self,
        comp: &Composition,
        synthesizer: Option<&Synthesizer>,
        pod_exists: bool,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let nsn = comp.nsn();

        // Nothing can progress without the synthesizer; let go immediately.
        if synthesizer.is_none() {
            return self.release_finalizer(comp).await;
        }

        let generation = comp.metadata.generation;
        let needs_stamp = comp.synthesis_in_flight()
            || comp
                .status
                .current_synthesis
                .as_ref()
                .map(|s| s.observed_composition_generation < generation)
                .unwrap_or(false);
        if needs_stamp {
            let now = Utc::now();
            update_composition_status(store, &nsn, move |c| {
                let mut changed = false;
                if let Some(in_flight) = c.status.in_flight_synthesis.as_mut() {
                    if in_flight.canceled.is_none() {
                        in_flight.canceled = Some(now);
                        changed = true;
                    }
                }
                if let Some(current) = c.status.current_synthesis.as_mut() {
                    if current.observed_composition_generation < generation {
                        current.observed_composition_generation = generation;
                        changed = true;
                    }
                }
                changed
            })
            .await?;
            return Ok(());
        }

        let owned = store
            .list(
                keys::RESOURCE_SLICE,
                Some(&nsn.namespace),
                &Selector::new().with(COMPOSITION_NAME_LABEL, &comp.metadata.name),
            )
            .await?;
        if owned.is_empty() && !pod_exists {
            return self.release_finalizer(comp).await;
        }
        Ok(())
    }

    async fn release_finalizer(&self, comp: &Composition) -> Result<()> {
        let mut updated = comp.clone();
        if updated.metadata.remove_finalizer(CLEANUP_FINALIZER) {
            self.store.update(keys::COMPOSITION, api::to_value(&updated)).await?;
            info!(comp = %comp.nsn(), "released cleanup finalizer");
        }
        Ok(())
    }

    async fn drive_in_flight(
        &self,
        comp: &Composition,
        synthesizer: Option<&Synthesizer>,
        in_flight: &Synthesis,
        pod_exists: bool,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let nsn = comp.nsn();
        let uuid = in_flight.uuid.clone();

        // Further mutation while synthesizing cancels the attempt.
        let superseded = in_flight.observed_composition_generation < comp.metadata.generation
            || synthesizer
                .map(|s| in_flight.observed_synthesizer_generation < s.metadata.generation)
                .unwrap_or(false);
        if superseded {
            let now = Utc::now();
            let uuid = uuid.clone();
            let wrote = update_composition_status(store, &nsn, move |c| {
                let Some(in_flight) = c.status.in_flight_synthesis.as_mut() else { return false };
                if in_flight.uuid != uuid || in_flight.canceled.is_some() {
                    return false;
                }
                in_flight.canceled = Some(now);
                true
            })
            .await?;
            if wrote {
                counter!("syntheses_canceled_total", 1u64);
                info!(comp = %nsn, "canceled superseded synthesis");
            }
            return Ok(());
        }

        if in_flight.synthesized() {
            return Ok(()); // promotion happens at ingestion
        }

        // Retry ceiling: cancel and hold until the generation advances.
        if in_flight.attempts >= self.cfg.max_synthesis_attempts {
            let now = Utc::now();
            let attempts = in_flight.attempts;
            let uuid = uuid.clone();
            let wrote = update_composition_status(store, &nsn, move |c| {
                let Some(in_flight) = c.status.in_flight_synthesis.as_mut() else { return false };
                if in_flight.uuid != uuid || in_flight.canceled.is_some() {
                    return false;
                }
                in_flight.canceled = Some(now);
                in_flight.results.push(api::SynthesisResult {
                    message: format!("synthesis canceled after {} failed attempts", attempts),
                    severity: "error".into(),
                });
                true
            })
            .await?;
            if wrote {
                counter!("syntheses_exhausted_total", 1u64);
                warn!(comp = %nsn, attempts, "synthesis retry budget exhausted");
            }
            return Ok(());
        }

        // Worker request: one non-deleting pod at a time.
        if !pod_exists {
            let Some(synthesizer) = synthesizer else { return Ok(()) };
            let pod = build_worker_pod(comp, synthesizer, in_flight);
            match store.create(keys::POD, pod).await {
                Ok(_) | Err(StoreError::AlreadyExists(_)) => {}
                Err(err) => return Err(err.into()),
            }
            counter!("worker_pods_created_total", 1u64);
        }
        if in_flight.pod_creation.is_none() {
            let now = Utc::now();
            update_composition_status(store, &nsn, move |c| {
                let Some(in_flight) = c.status.in_flight_synthesis.as_mut() else { return false };
                if in_flight.uuid != uuid || in_flight.pod_creation.is_some() {
                    return false;
                }
                in_flight.pod_creation = Some(now);
                true
            })
            .await?;
        }
        Ok(())
    }
}
