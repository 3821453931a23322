//! In-memory [`ObjectStore`] with apiserver-shaped semantics: monotonic
//! resourceVersions, generation bumps on spec changes, a status
//! subresource, finalizer-gated deletion, and watch replay. Tests and
//! local development run entirely against this.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{meta, queue_cap, ObjectStore, Selector, StoreError, StoreEvent, StoreResult};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    // gvk key -> (namespace, name) -> object
    objects: FxHashMap<String, BTreeMap<(String, String), Value>>,
    watchers: FxHashMap<String, Vec<mpsc::Sender<StoreEvent>>>,
    next_rv: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn notify(&mut self, gvk_key: &str, event: StoreEvent) {
        let Some(senders) = self.watchers.get_mut(gvk_key) else { return };
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("store_watch_events_dropped_total", 1u64);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn remove(&mut self, gvk_key: &str, key: &(String, String)) {
        if let Some(obj) = self.objects.get_mut(gvk_key).and_then(|m| m.remove(key)) {
            self.notify(gvk_key, StoreEvent::Deleted(obj));
        }
    }
}

fn object_key(obj: &Value) -> StoreResult<(String, String)> {
    let name = meta::name(obj);
    if name.is_empty() {
        return Err(StoreError::Invalid("metadata.name is required".into()));
    }
    Ok((meta::namespace(obj).to_string(), name.to_string()))
}

fn specs_differ(a: &Value, b: &Value) -> bool {
    a.get("spec") != b.get("spec")
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, gvk_key: &str, namespace: Option<&str>, name: &str) -> StoreResult<Option<Value>> {
        let inner = self.inner.lock().unwrap();
        let key = (namespace.unwrap_or("").to_string(), name.to_string());
        Ok(inner.objects.get(gvk_key).and_then(|m| m.get(&key)).cloned())
    }

    async fn list(&self, gvk_key: &str, namespace: Option<&str>, selector: &Selector) -> StoreResult<Vec<Value>> {
        let inner = self.inner.lock().unwrap();
        let Some(objs) = inner.objects.get(gvk_key) else { return Ok(Vec::new()) };
        Ok(objs
            .iter()
            .filter(|((ns, _), _)| namespace.map(|want| ns == want).unwrap_or(true))
            .map(|(_, obj)| obj)
            .filter(|obj| selector.matches(obj))
            .cloned()
            .collect())
    }

    async fn create(&self, gvk_key: &str, mut obj: Value) -> StoreResult<Value> {
        let key = object_key(&obj)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.objects.get(gvk_key).map(|m| m.contains_key(&key)).unwrap_or(false) {
            return Err(StoreError::AlreadyExists(format!("{}/{}", gvk_key, key.1)));
        }
        let rv = inner.next_rv();
        {
            let m = obj
                .get_mut("metadata")
                .and_then(|m| m.as_object_mut())
                .ok_or_else(|| StoreError::Invalid("metadata is required".into()))?;
            m.insert("uid".into(), Value::String(uuid::Uuid::new_v4().to_string()));
            m.insert("resourceVersion".into(), Value::String(rv));
            m.insert(
                "creationTimestamp".into(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
            m.remove("deletionTimestamp");
        }
        // generation is only meaningful for objects with a spec
        if obj.get("spec").is_some() {
            obj["metadata"]["generation"] = Value::from(1);
        }
        debug!(gvk = %gvk_key, name = %key.1, "store: created");
        inner.objects.entry(gvk_key.to_string()).or_default().insert(key, obj.clone());
        inner.notify(gvk_key, StoreEvent::Applied(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, gvk_key: &str, mut obj: Value) -> StoreResult<Value> {
        let key = object_key(&obj)?;
        let mut inner = self.inner.lock().unwrap();
        let existing = inner
            .objects
            .get(gvk_key)
            .and_then(|m| m.get(&key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", gvk_key, key.1)))?;

        let rv = meta::resource_version(&obj)
            .ok_or_else(|| StoreError::Invalid("metadata.resourceVersion is required on update".into()))?;
        if Some(rv) != meta::resource_version(&existing) {
            return Err(StoreError::Conflict(format!("{}/{}", gvk_key, key.1)));
        }

        let generation = if specs_differ(&obj, &existing) {
            meta::generation(&existing) + 1
        } else {
            meta::generation(&existing)
        };

        // Server-owned fields and the status subresource survive updates.
        obj["metadata"]["uid"] = existing["metadata"]["uid"].clone();
        obj["metadata"]["creationTimestamp"] = existing["metadata"]["creationTimestamp"].clone();
        if generation != 0 {
            obj["metadata"]["generation"] = Value::from(generation);
        }
        if let Some(dt) = existing.pointer("/metadata/deletionTimestamp").cloned() {
            obj["metadata"]["deletionTimestamp"] = dt;
        }
        match existing.get("status").cloned() {
            Some(status) => obj["status"] = status,
            None => {
                obj.as_object_mut().unwrap().remove("status");
            }
        }

        // Clearing the last finalizer of a deleting object removes it.
        if meta::deletion_timestamp(&obj).is_some() && meta::finalizers(&obj).is_empty() {
            inner.remove(gvk_key, &key);
            return Ok(obj);
        }

        let rv = inner.next_rv();
        meta::set_resource_version(&mut obj, &rv);
        inner.objects.entry(gvk_key.to_string()).or_default().insert(key, obj.clone());
        inner.notify(gvk_key, StoreEvent::Applied(obj.clone()));
        Ok(obj)
    }

    async fn update_status(&self, gvk_key: &str, obj: Value) -> StoreResult<Value> {
        let key = object_key(&obj)?;
        let mut inner = self.inner.lock().unwrap();
        let mut existing = inner
            .objects
            .get(gvk_key)
            .and_then(|m| m.get(&key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", gvk_key, key.1)))?;

        let rv = meta::resource_version(&obj)
            .ok_or_else(|| StoreError::Invalid("metadata.resourceVersion is required on update".into()))?;
        if Some(rv) != meta::resource_version(&existing) {
            return Err(StoreError::Conflict(format!("{}/{}", gvk_key, key.1)));
        }

        match obj.get("status").cloned() {
            Some(status) => existing["status"] = status,
            None => {
                existing.as_object_mut().unwrap().remove("status");
            }
        }
        let rv = inner.next_rv();
        meta::set_resource_version(&mut existing, &rv);
        inner.objects.entry(gvk_key.to_string()).or_default().insert(key, existing.clone());
        inner.notify(gvk_key, StoreEvent::Applied(existing.clone()));
        Ok(existing)
    }

    async fn delete(
        &self,
        gvk_key: &str,
        namespace: Option<&str>,
        name: &str,
        resource_version: Option<&str>,
    ) -> StoreResult<()> {
        let key = (namespace.unwrap_or("").to_string(), name.to_string());
        let mut inner = self.inner.lock().unwrap();
        let Some(existing) = inner.objects.get(gvk_key).and_then(|m| m.get(&key)).cloned() else {
            return Ok(()); // not found is success
        };
        if let Some(rv) = resource_version {
            if Some(rv) != meta::resource_version(&existing) {
                return Err(StoreError::Conflict(format!("{}/{}", gvk_key, name)));
            }
        }
        if meta::finalizers(&existing).is_empty() {
            inner.remove(gvk_key, &key);
            return Ok(());
        }
        // Finalizers present: mark deleting and wait for them to clear.
        if meta::deletion_timestamp(&existing).is_none() {
            let mut obj = existing;
            obj["metadata"]["deletionTimestamp"] =
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
            let rv = inner.next_rv();
            meta::set_resource_version(&mut obj, &rv);
            inner.objects.entry(gvk_key.to_string()).or_default().insert(key, obj.clone());
            inner.notify(gvk_key, StoreEvent::Applied(obj));
        }
        Ok(())
    }

    async fn watch(&self, gvk_key: &str) -> StoreResult<mpsc::Receiver<StoreEvent>> {
        let (tx, rx) = mpsc::channel(queue_cap());
        let mut inner = self.inner.lock().unwrap();
        // Replay current contents so late watchers converge without a list.
        if let Some(objs) = inner.objects.get(gvk_key) {
            for obj in objs.values() {
                let _ = tx.try_send(StoreEvent::Applied(obj.clone()));
            }
        }
        inner.watchers.entry(gvk_key.to_string()).or_default().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(name: &str) -> Value {
        json!({
            "apiVersion": "eno.azure.io/v1",
            "kind": "Composition",
            "metadata": { "name": name, "namespace": "default" },
            "spec": { "replicas": 1 }
        })
    }

    #[tokio::test]
    async fn create_assigns_server_fields() {
        let store = MemoryStore::new();
        let created = store.create("k", obj("a")).await.unwrap();
        assert!(meta::uid(&created).is_some());
        assert_eq!(meta::resource_version(&created), Some("1"));
        assert_eq!(meta::generation(&created), 1);
        assert!(matches!(
            store.create("k", obj("a")).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn update_requires_fresh_resource_version() {
        let store = MemoryStore::new();
        let created = store.create("k", obj("a")).await.unwrap();

        let mut stale = created.clone();
        stale["spec"]["replicas"] = json!(2);
        let updated = store.update("k", stale.clone()).await.unwrap();
        assert_eq!(meta::generation(&updated), 2, "spec change bumps generation");

        // Writing through the old version must conflict.
        let err = store.update("k", stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn status_subresource_is_isolated() {
        let store = MemoryStore::new();
        let mut created = store.create("k", obj("a")).await.unwrap();

        // Status writes do not touch spec or generation.
        created["status"] = json!({ "phase": "running" });
        let after = store.update_status("k", created.clone()).await.unwrap();
        assert_eq!(after["status"]["phase"], "running");
        assert_eq!(meta::generation(&after), 1);

        // Spec updates do not clobber status.
        let mut next = after.clone();
        next["spec"]["replicas"] = json!(3);
        next["status"] = json!({ "phase": "bogus" });
        let after = store.update("k", next).await.unwrap();
        assert_eq!(after["status"]["phase"], "running");
    }

    #[tokio::test]
    async fn finalizers_gate_deletion() {
        let store = MemoryStore::new();
        let mut o = obj("a");
        o["metadata"]["finalizers"] = json!(["eno.azure.io/cleanup"]);
        let created = store.create("k", o).await.unwrap();

        store.delete("k", Some("default"), "a", None).await.unwrap();
        let live = store.get("k", Some("default"), "a").await.unwrap().unwrap();
        assert!(meta::deletion_timestamp(&live).is_some(), "held by finalizer");
        assert_ne!(meta::resource_version(&live), meta::resource_version(&created));

        let mut cleared = live.clone();
        cleared["metadata"]["finalizers"] = json!([]);
        store.update("k", cleared).await.unwrap();
        assert!(store.get("k", Some("default"), "a").await.unwrap().is_none());

        // Deleting something that is gone is fine.
        store.delete("k", Some("default"), "a", None).await.unwrap();
    }

    #[tokio::test]
    async fn delete_honors_resource_version_precondition() {
        let store = MemoryStore::new();
        store.create("k", obj("a")).await.unwrap();
        let err = store.delete("k", Some("default"), "a", Some("999")).await.unwrap_err();
        assert!(err.is_conflict());
        store.delete("k", Some("default"), "a", Some("1")).await.unwrap();
        assert!(store.get("k", Some("default"), "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_replays_then_streams() {
        let store = MemoryStore::new();
        store.create("k", obj("a")).await.unwrap();
        let mut rx = store.watch("k").await.unwrap();
        match rx.recv().await.unwrap() {
            StoreEvent::Applied(v) => assert_eq!(meta::name(&v), "a"),
            other => panic!("unexpected event: {:?}", other),
        }

        store.create("k", obj("b")).await.unwrap();
        match rx.recv().await.unwrap() {
            StoreEvent::Applied(v) => assert_eq!(meta::name(&v), "b"),
            other => panic!("unexpected event: {:?}", other),
        }

        store.delete("k", Some("default"), "b", None).await.unwrap();
        match rx.recv().await.unwrap() {
            StoreEvent::Deleted(v) => assert_eq!(meta::name(&v), "b"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_labels() {
        let store = MemoryStore::new();
        let mut a = obj("a");
        a["metadata"]["labels"] = json!({ "team": "x" });
        store.create("k", a).await.unwrap();
        let mut b = obj("b");
        b["metadata"]["namespace"] = json!("other");
        store.create("k", b).await.unwrap();

        assert_eq!(store.list("k", None, &Selector::new()).await.unwrap().len(), 2);
        assert_eq!(store.list("k", Some("default"), &Selector::new()).await.unwrap().len(), 1);
        let sel = Selector::new().with("team", "x");
        assert_eq!(store.list("k", None, &sel).await.unwrap().len(), 1);
    }
}
