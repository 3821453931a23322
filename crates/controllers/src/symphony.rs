//! Symphony: fan a set of synthesizer variations out into one composition
//! each, and roll member statuses back up.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use eno_core::api::{
    self, Composition, NamespacedName, OwnerReference, Symphony, SymphonyStatus, SynthesizerRef,
    CLEANUP_FINALIZER,
};
use eno_store::{get_as, keys, meta, update_status_with_retry, ObjectStore, Selector, StoreEvent, Workqueue};
use tracing::{info, warn};

/// Label tying a member composition back to its symphony.
pub const SYMPHONY_NAME_LABEL: &str = "eno.azure.io/symphony-name";

pub struct SymphonyController {
    store: Arc<dyn ObjectStore>,
}

impl SymphonyController {
    pub fn new(store: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let queue = Arc::new(Workqueue::<NamespacedName>::new());
        let mut symphony_events = self.store.watch(keys::SYMPHONY).await?;
        let mut comp_events = self.store.watch(keys::COMPOSITION).await?;

        {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(ev) = symphony_events.recv().await {
                    queue.add(meta::nsn(ev.object()));
                }
                queue.close();
            });
        }
        {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(ev) = comp_events.recv().await {
                    let obj = match &ev {
                        StoreEvent::Applied(v) | StoreEvent::Deleted(v) => v,
                    };
                    if let Some(owner) = meta::label(obj, SYMPHONY_NAME_LABEL) {
                        queue.add(NamespacedName::new(meta::namespace(obj), owner));
                    }
                }
            });
        }

        while let Some(nsn) = queue.next().await {
            if let Err(err) = self.reconcile(&nsn).await {
                warn!(symphony = %nsn, error = %err, "symphony pass failed; requeueing");
                queue.add_after(nsn.clone(), Duration::from_millis(500));
            }
            queue.done(&nsn);
        }
        Ok(())
    }

    pub async fn reconcile(&self, nsn: &NamespacedName) -> Result<()> {
        let store = self.store.as_ref();
        let Some(symphony) =
            get_as::<Symphony>(store, keys::SYMPHONY, Some(&nsn.namespace), &nsn.name).await?
        else {
            return Ok(());
        };

        let members = self.members(&symphony).await?;

        if self.sync_status(&symphony, &members).await? {
            return Ok(());
        }

        if symphony.metadata.deletion_timestamp.is_none()
            && !symphony.metadata.has_finalizer(CLEANUP_FINALIZER)
        {
            let mut updated = symphony.clone();
            updated.metadata.add_finalizer(CLEANUP_FINALIZER);
            store.update(keys::SYMPHONY, api::to_value(&updated)).await?;
            return Ok(());
        }

        // Reverse first (deletes), then forward (creates/updates); any
        // change returns early and rides the next watch event.
        if self.reconcile_reverse(&symphony, &members).await? {
            return Ok(());
        }
        if symphony.metadata.deletion_timestamp.is_none()
            && self.reconcile_forward(&symphony, &members).await?
        {
            return Ok(());
        }

        if symphony.metadata.deletion_timestamp.is_some() {
            if !members.is_empty() {
                return Ok(()); // wait for member deletion
            }
            let mut updated = symphony.clone();
            if updated.metadata.remove_finalizer(CLEANUP_FINALIZER) {
                store.update(keys::SYMPHONY, api::to_value(&updated)).await?;
            }
        }
        Ok(())
    }

    async fn members(&self, symphony: &Symphony) -> Result<Vec<Composition>> {
        let selector = Selector::new().with(SYMPHONY_NAME_LABEL, &symphony.metadata.name);
        let mut members = Vec::new();
        for value in self
            .store
            .list(keys::COMPOSITION, Some(&symphony.metadata.namespace), &selector)
            .await?
        {
            members.push(api::from_value::<Composition>(value)?);
        }
        Ok(members)
    }

    /// Deletes members whose variation is gone (or whose symphony is
    /// deleting), and prunes duplicate members keeping the oldest.
    async fn reconcile_reverse(&self, symphony: &Symphony, members: &[Composition]) -> Result<bool> {
        let store = self.store.as_ref();
        let expected: Vec<&str> =
            symphony.spec.variations.iter().map(|v| v.synthesizer.name.as_str()).collect();

        let mut by_synth: BTreeMap<&str, Vec<&Composition>> = BTreeMap::new();
        for comp in members {
            by_synth.entry(comp.spec.synthesizer.name.as_str()).or_default().push(comp);
        }

        for comp in members {
            let wanted = expected.contains(&comp.spec.synthesizer.name.as_str())
                && symphony.metadata.deletion_timestamp.is_none();
            if wanted || comp.deleting() {
                continue;
            }
            store
                .delete(
                    keys::COMPOSITION,
                    Some(&comp.metadata.namespace),
                    &comp.metadata.name,
                    comp.metadata.resource_version.as_deref(),
                )
                .await?;
            info!(comp = %comp.nsn(), "deleted composition because its synthesizer left the set");
            return Ok(true);
        }

        // Duplicates keep the oldest member.
        for comps in by_synth.values_mut() {
            if comps.len() < 2 {
                continue;
            }
            comps.sort_by_key(|c| c.metadata.creation_timestamp);
            for comp in &comps[1..] {
                if comp.deleting() {
                    continue;
                }
                store
                    .delete(
                        keys::COMPOSITION,
                        Some(&comp.metadata.namespace),
                        &comp.metadata.name,
                        comp.metadata.resource_version.as_deref(),
                    )
                    .await?;
                info!(comp = %comp.nsn(), "deleted duplicate composition");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Creates or converges one member per variation.
    async fn reconcile_forward(&self, symphony: &Symphony, members: &[Composition]) -> Result<bool> {
        let store = self.store.as_ref();
        for variation in &symphony.spec.variations {
            let mut desired = Composition::new(
                symphony.metadata.namespace.clone(),
                format!("{}-{}", symphony.metadata.name, variation.synthesizer.name),
            );
            desired.spec.bindings = symphony.spec.bindings.clone();
            desired.spec.synthesizer = variation.synthesizer.clone();
            desired.metadata.labels = variation.labels.clone();
            desired
                .metadata
                .labels
                .insert(SYMPHONY_NAME_LABEL.into(), symphony.metadata.name.clone());
            desired.metadata.owner_references.push(OwnerReference {
                api_version: api::API_VERSION.into(),
                kind: Symphony::KIND.into(),
                name: symphony.metadata.name.clone(),
                uid: symphony.metadata.uid.clone(),
                controller: true,
            });

            if let Some(existing) =
                members.iter().find(|c| c.spec.synthesizer.name == variation.synthesizer.name)
            {
                if existing.spec == desired.spec && existing.metadata.labels == desired.metadata.labels {
                    continue; // already matches
                }
                let mut updated = existing.clone();
                updated.spec = desired.spec;
                updated.metadata.labels = desired.metadata.labels;
                store.update(keys::COMPOSITION, api::to_value(&updated)).await?;
                info!(comp = %existing.nsn(), "updated composition because its variation changed");
                return Ok(true);
            }

            store.create(keys::COMPOSITION, api::to_value(&desired)).await?;
            info!(comp = %desired.nsn(), "created composition for the set");
            return Ok(true);
        }
        Ok(false)
    }

    /// Keeps the synthesizer index sorted in status and aggregates member
    /// synthesis timestamps, filtered to nil unless every member reached
    /// the corresponding state.
    async fn sync_status(&self, symphony: &Symphony, members: &[Composition]) -> Result<bool> {
        let mut refs: Vec<SynthesizerRef> = members
            .iter()
            .map(|c| SynthesizerRef { name: c.spec.synthesizer.name.clone() })
            .collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        refs.dedup();

        let mut next = SymphonyStatus {
            observed_generation: symphony.metadata.generation,
            synthesizers: refs,
            ..Default::default()
        };

        let mut complete = !members.is_empty() || symphony.spec.variations.is_empty();
        for comp in members {
            let Some(current) = &comp.status.current_synthesis else {
                complete = false;
                break;
            };
            if current.observed_composition_generation != comp.metadata.generation || comp.deleting() {
                complete = false;
                break;
            }
            next.synthesized = later(next.synthesized, current.synthesized);
            next.reconciled = later(next.reconciled, current.reconciled);
            next.ready = later(next.ready, current.ready);
        }
        // Every variation must be represented before the rollup is honest.
        for variation in &symphony.spec.variations {
            if !members.iter().any(|c| c.spec.synthesizer.name == variation.synthesizer.name) {
                complete = false;
            }
        }
        if !complete {
            next.synthesized = None;
            next.reconciled = None;
            next.ready = None;
        } else {
            for comp in members {
                let current = comp.status.current_synthesis.as_ref().unwrap();
                if current.synthesized.is_none() {
                    next.synthesized = None;
                }
                if current.reconciled.is_none() {
                    next.reconciled = None;
                }
                if current.ready.is_none() {
                    next.ready = None;
                }
            }
        }

        if next == symphony.status {
            return Ok(false);
        }
        let changed = update_status_with_retry(
            self.store.as_ref(),
            keys::SYMPHONY,
            Some(&symphony.metadata.namespace),
            &symphony.metadata.name,
            move |value| {
                let Ok(mut sym) = serde_json::from_value::<Symphony>(value.clone()) else {
                    return false;
                };
                if sym.status == next {
                    return false;
                }
                sym.status = next.clone();
                *value = api::to_value(&sym);
                true
            },
        )
        .await?;
        Ok(changed)
    }
}

fn later(
    a: Option<chrono::DateTime<chrono::Utc>>,
    b: Option<chrono::DateTime<chrono::Utc>>,
) -> Option<chrono::DateTime<chrono::Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (x, None) | (None, x) => x,
    }
}
