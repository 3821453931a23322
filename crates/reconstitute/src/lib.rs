//! The reconstitution cache: slices expanded back into individual
//! [`Resource`]s, held per (composition, synthesis UUID).
//!
//! Similar to an informer cache, plus the slice-expansion logic. A
//! synthesis is published atomically — subscribers never observe a
//! partially parsed synthesis — and every parsed ref is fanned out as a
//! work item to the registered subscriber queues.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use eno_core::api::{self, Composition, NamespacedName, ResourceSlice, Synthesis};
use eno_core::resource::{Ref, Resource};
use eno_store::{keys, meta, ObjectStore, Selector, StoreEvent, Workqueue};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// Work item handed to subscribers: one resource of one composition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub composition: NamespacedName,
    pub reference: Ref,
}

/// All resources of one synthesis, immutable once published.
pub struct SynthesisView {
    pub uuid: String,
    resources: FxHashMap<Ref, Arc<Resource>>,
}

impl SynthesisView {
    pub fn get(&self, reference: &Ref) -> Option<&Arc<Resource>> {
        self.resources.get(reference)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Arc<Resource>> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[derive(Default)]
struct CompEntry {
    syntheses: FxHashMap<String, Arc<SynthesisView>>,
}

#[derive(Default)]
pub struct Cache {
    inner: RwLock<FxHashMap<NamespacedName, CompEntry>>,
    queues: Mutex<Vec<Arc<Workqueue<ResourceKey>>>>,
    started: AtomicBool,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribers must register before the first fill; anything later
    /// would miss syntheses already published.
    pub fn add_queue(&self, queue: Arc<Workqueue<ResourceKey>>) {
        if self.started.load(Ordering::Acquire) {
            panic!("add_queue must be called before any synthesis is cached");
        }
        self.queues.lock().unwrap().push(queue);
    }

    pub fn has_synthesis(&self, composition: &NamespacedName, uuid: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .get(composition)
            .map(|e| e.syntheses.contains_key(uuid))
            .unwrap_or(false)
    }

    pub fn get(&self, composition: &NamespacedName, uuid: &str, reference: &Ref) -> Option<Arc<Resource>> {
        self.inner
            .read()
            .unwrap()
            .get(composition)?
            .syntheses
            .get(uuid)?
            .get(reference)
            .cloned()
    }

    pub fn synthesis(&self, composition: &NamespacedName, uuid: &str) -> Option<Arc<SynthesisView>> {
        self.inner.read().unwrap().get(composition)?.syntheses.get(uuid).cloned()
    }

    /// Parses every manifest of every slice and publishes the synthesis in
    /// one step, then fans out one work item per ref. Manifests that fail
    /// to parse are skipped; duplicate refs keep the smaller manifest hash.
    pub fn fill(
        &self,
        composition: &NamespacedName,
        uuid: &str,
        slices: &[ResourceSlice],
    ) -> Result<usize> {
        self.started.store(true, Ordering::Release);

        let mut resources: FxHashMap<Ref, Arc<Resource>> = FxHashMap::default();
        for slice in slices {
            for index in 0..slice.spec.resources.len() {
                let res = match Resource::from_slice(slice, index) {
                    Ok(res) => Arc::new(res),
                    Err(err) => {
                        counter!("reconstitute_parse_errors_total", 1u64);
                        warn!(slice = %slice.metadata.nsn(), index, error = %err, "skipping unparseable manifest");
                        continue;
                    }
                };
                match resources.get(&res.reference) {
                    Some(existing) if existing.less(&res) => {}
                    _ => {
                        resources.insert(res.reference.clone(), res);
                    }
                }
            }
        }

        let count = resources.len();
        let refs: Vec<Ref> = resources.keys().cloned().collect();
        let view = Arc::new(SynthesisView { uuid: uuid.to_string(), resources });
        self.inner
            .write()
            .unwrap()
            .entry(composition.clone())
            .or_default()
            .syntheses
            .insert(uuid.to_string(), view);

        let queues = self.queues.lock().unwrap();
        for reference in refs {
            let key = ResourceKey { composition: composition.clone(), reference };
            for queue in queues.iter() {
                queue.add(key.clone());
            }
        }
        counter!("reconstitute_fills_total", 1u64);
        Ok(count)
    }

    /// Drops cached syntheses the composition no longer references, or
    /// everything for the composition when it is gone.
    pub fn purge(&self, composition: &NamespacedName, comp: Option<&Composition>) {
        let mut inner = self.inner.write().unwrap();
        let Some(comp) = comp else {
            inner.remove(composition);
            return;
        };
        if let Some(entry) = inner.get_mut(composition) {
            entry.syntheses.retain(|uuid, _| comp.synthesis_by_uuid(uuid).is_some());
            if entry.syntheses.is_empty() {
                inner.remove(composition);
            }
        }
    }
}

/// Watches compositions and keeps the cache in sync with their previous
/// and current syntheses.
pub struct Reconstituter {
    store: Arc<dyn ObjectStore>,
    cache: Arc<Cache>,
}

impl Reconstituter {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<Cache>) -> Self {
        Self { store, cache }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut events = self
            .store
            .watch(keys::COMPOSITION)
            .await
            .context("watching compositions")?;
        // Slice status updates also nudge the composition so late slice
        // writes are not missed between watch events.
        let mut slice_events = self.store.watch(keys::RESOURCE_SLICE).await?;

        loop {
            let nsn = tokio::select! {
                ev = events.recv() => match ev {
                    Some(StoreEvent::Applied(v)) => meta::nsn(&v),
                    Some(StoreEvent::Deleted(v)) => {
                        self.cache.purge(&meta::nsn(&v), None);
                        continue;
                    }
                    None => return Ok(()),
                },
                ev = slice_events.recv() => match ev {
                    Some(ev) => match meta::controller_owner(ev.object()) {
                        Some((Composition::KIND, owner)) => {
                            NamespacedName::new(meta::namespace(ev.object()), owner)
                        }
                        _ => continue,
                    },
                    None => return Ok(()),
                },
            };
            if let Err(err) = self.reconcile(&nsn).await {
                warn!(comp = %nsn, error = %err, "reconstitution failed; waiting for the next event");
            }
        }
    }

    pub async fn reconcile(&self, nsn: &NamespacedName) -> Result<()> {
        let Some(comp) = eno_store::get_as::<Composition>(
            self.store.as_ref(),
            keys::COMPOSITION,
            Some(&nsn.namespace),
            &nsn.name,
        )
        .await?
        else {
            self.cache.purge(nsn, None);
            return Ok(());
        };

        // Both the previous and current syntheses are served to subscribers.
        self.populate(&comp, comp.status.previous_synthesis.as_ref()).await?;
        self.populate(&comp, comp.status.current_synthesis.as_ref()).await?;
        self.cache.purge(nsn, Some(&comp));
        Ok(())
    }

    async fn populate(&self, comp: &Composition, synthesis: Option<&Synthesis>) -> Result<()> {
        let Some(synthesis) = synthesis else { return Ok(()) };
        let Some(expected) = synthesis.resource_slice_count else {
            debug!(comp = %comp.nsn(), "synthesis is not complete - waiting to fill cache");
            return Ok(());
        };
        let nsn = comp.nsn();
        if self.cache.has_synthesis(&nsn, &synthesis.uuid) {
            return Ok(());
        }

        let selector = Selector::new()
            .with(api::COMPOSITION_NAME_LABEL, &comp.metadata.name)
            .with(api::SYNTHESIS_UUID_LABEL, &synthesis.uuid);
        let listed = self
            .store
            .list(keys::RESOURCE_SLICE, Some(&comp.metadata.namespace), &selector)
            .await
            .context("listing resource slices")?;

        if listed.len() as i64 != expected {
            // The informer has not caught up with every slice yet; the next
            // watch event retries.
            debug!(comp = %nsn, found = listed.len(), expected, "stale informer - waiting for sync");
            return Ok(());
        }

        let mut slices = Vec::with_capacity(listed.len());
        for v in listed {
            let slice: ResourceSlice = api::from_value(v).context("decoding resource slice")?;
            slices.push(slice);
        }
        let count = self.cache.fill(&nsn, &synthesis.uuid, &slices)?;
        debug!(comp = %nsn, uuid = %synthesis.uuid, resources = count, "cached synthesis");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_core::api::{Manifest, ResourceSliceRef};

    fn slice(name: &str, manifests: &[&str]) -> ResourceSlice {
        let mut s = ResourceSlice::new("default", name);
        s.spec.resources = manifests
            .iter()
            .map(|m| Manifest { manifest: m.to_string(), deleted: false })
            .collect();
        s
    }

    fn configmap(name: &str) -> String {
        format!(r#"{{"apiVersion":"v1","kind":"ConfigMap","metadata":{{"name":"{name}","namespace":"default"}}}}"#)
    }

    #[tokio::test]
    async fn fill_publishes_and_fans_out() {
        let cache = Cache::new();
        let queue = Arc::new(Workqueue::new());
        cache.add_queue(Arc::clone(&queue));

        let nsn = NamespacedName::new("default", "comp");
        let slices = vec![slice("s1", &[&configmap("a"), &configmap("b")])];
        let count = cache.fill(&nsn, "uuid-1", &slices).unwrap();
        assert_eq!(count, 2);
        assert_eq!(queue.len(), 2);

        let key = queue.next().await.unwrap();
        assert_eq!(key.composition, nsn);
        assert!(cache.get(&nsn, "uuid-1", &key.reference).is_some());
        assert!(cache.has_synthesis(&nsn, "uuid-1"));
        assert!(!cache.has_synthesis(&nsn, "uuid-2"));
    }

    #[tokio::test]
    async fn parse_errors_skip_only_the_bad_manifest() {
        let cache = Cache::new();
        let nsn = NamespacedName::new("default", "comp");
        let slices = vec![slice("s1", &["not json", &configmap("ok")])];
        let count = cache.fill(&nsn, "uuid-1", &slices).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn duplicate_refs_resolve_by_hash() {
        let cache = Cache::new();
        let nsn = NamespacedName::new("default", "comp");
        // Same ref, two manifests that differ in content only.
        let a = r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"x"},"data":{"v":"1"}}"#;
        let b = r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"x"},"data":{"v":"2"}}"#;
        cache.fill(&nsn, "u1", &[slice("s1", &[a, b])]).unwrap();
        cache.fill(&nsn, "u2", &[slice("s2", &[b, a])]).unwrap();

        let reference = Ref { group: "".into(), kind: "ConfigMap".into(), namespace: "".into(), name: "x".into() };
        let first = cache.get(&nsn, "u1", &reference).unwrap();
        let second = cache.get(&nsn, "u2", &reference).unwrap();
        assert_eq!(
            first.manifest_hash, second.manifest_hash,
            "winner is insertion-order independent"
        );
    }

    #[tokio::test]
    async fn purge_retains_referenced_syntheses() {
        let cache = Cache::new();
        let nsn = NamespacedName::new("default", "comp");
        cache.fill(&nsn, "old", &[slice("s1", &[&configmap("a")])]).unwrap();
        cache.fill(&nsn, "cur", &[slice("s2", &[&configmap("a")])]).unwrap();

        let mut comp = Composition::new("default", "comp");
        comp.status.current_synthesis = Some(Synthesis {
            uuid: "cur".into(),
            resource_slices: vec![ResourceSliceRef { name: "s2".into() }],
            ..Default::default()
        });
        cache.purge(&nsn, Some(&comp));
        assert!(cache.has_synthesis(&nsn, "cur"));
        assert!(!cache.has_synthesis(&nsn, "old"));

        cache.purge(&nsn, None);
        assert!(!cache.has_synthesis(&nsn, "cur"));
    }

    #[test]
    #[should_panic(expected = "add_queue")]
    fn late_queue_registration_panics() {
        let cache = Cache::new();
        let nsn = NamespacedName::new("default", "comp");
        cache.fill(&nsn, "u", &[]).unwrap();
        cache.add_queue(Arc::new(Workqueue::new()));
    }
}
