//! Kubernetes adapter: discovery and watcher wiring behind the
//! [`ObjectStore`] trait.
//!
//! All objects cross this boundary as dynamic JSON; discovery results are
//! cached per GVK key so the hot paths never re-run discovery.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, Preconditions},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use eno_store::{meta, queue_cap, ObjectStore, Selector, StoreError, StoreEvent, StoreResult};

// Reuse a single kube client; TLS/config setup is costly.
static KUBE_CLIENT: OnceCell<Client> = OnceCell::const_new();

pub async fn get_kube_client() -> Result<Client> {
    KUBE_CLIENT
        .get_or_try_init(|| async { Client::try_default().await.map_err(anyhow::Error::from) })
        .await
        .map(|c| c.clone())
}

// Discovery cache: GVK key -> (ApiResource, namespaced)
static DISCOVERY_CACHE: Lazy<RwLock<HashMap<String, (kube::core::ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

// Keys look like "v1/Kind" for core kinds and "group/v1/Kind" otherwise.
fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let malformed = || anyhow!("malformed GVK key {:?}", key);
    let (rest, kind) = key.rsplit_once('/').ok_or_else(malformed)?;
    let (group, version) = match rest.rsplit_once('/') {
        None => ("", rest),
        Some((group, version)) if !group.contains('/') => (group, version),
        Some(_) => return Err(malformed()),
    };
    if version.is_empty() || kind.is_empty() {
        return Err(malformed());
    }
    Ok(GroupVersionKind {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind.to_string(),
    })
}

async fn find_api_resource(client: Client, key: &str) -> Result<(kube::core::ApiResource, bool)> {
    if let Some(hit) = DISCOVERY_CACHE.read().unwrap().get(key).cloned() {
        return Ok(hit);
    }
    let gvk = parse_gvk_key(key)?;
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                DISCOVERY_CACHE.write().unwrap().insert(key.to_string(), (ar.clone(), namespaced));
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}", key))
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(obj) = v.pointer_mut("/metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

fn to_store_value(obj: &DynamicObject) -> StoreResult<Value> {
    let mut v = serde_json::to_value(obj)
        .map_err(|e| StoreError::Internal(format!("serializing object: {}", e)))?;
    strip_managed_fields(&mut v);
    Ok(v)
}

fn from_store_value(v: &Value) -> StoreResult<DynamicObject> {
    serde_json::from_value(v.clone())
        .map_err(|e| StoreError::Internal(format!("decoding object: {}", e)))
}

fn map_kube_err(e: kube::Error, what: &str) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(what.to_string())
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(what.to_string()),
        kube::Error::Api(ae) if ae.code == 422 => StoreError::Invalid(ae.message),
        other => StoreError::Internal(format!("{}: {}", what, other)),
    }
}

/// [`ObjectStore`] backed by a live cluster.
pub struct KubeStore;

impl KubeStore {
    pub fn new() -> Self {
        Self
    }

    async fn api(&self, gvk_key: &str, namespace: Option<&str>) -> StoreResult<Api<DynamicObject>> {
        let client = get_kube_client().await.map_err(|e| StoreError::Internal(e.to_string()))?;
        let (ar, namespaced) = find_api_resource(client.clone(), gvk_key)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        })
    }
}

impl Default for KubeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, gvk_key: &str, namespace: Option<&str>, name: &str) -> StoreResult<Option<Value>> {
        let api = self.api(gvk_key, namespace).await?;
        let obj = api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err(e, &format!("get {}/{}", gvk_key, name)))?;
        obj.as_ref().map(to_store_value).transpose()
    }

    async fn list(&self, gvk_key: &str, namespace: Option<&str>, selector: &Selector) -> StoreResult<Vec<Value>> {
        let api = self.api(gvk_key, namespace).await?;
        let mut params = ListParams::default();
        if !selector.0.is_empty() {
            params = params.labels(&selector.to_query());
        }
        let listed = api
            .list(&params)
            .await
            .map_err(|e| map_kube_err(e, &format!("list {}", gvk_key)))?;
        listed.items.iter().map(to_store_value).collect()
    }

    async fn create(&self, gvk_key: &str, obj: Value) -> StoreResult<Value> {
        let api = self.api(gvk_key, non_empty(meta::namespace(&obj))).await?;
        let dynamic = from_store_value(&obj)?;
        let created = api
            .create(&PostParams::default(), &dynamic)
            .await
            .map_err(|e| map_kube_err(e, &format!("create {}/{}", gvk_key, meta::name(&obj))))?;
        to_store_value(&created)
    }

    async fn update(&self, gvk_key: &str, obj: Value) -> StoreResult<Value> {
        let name = meta::name(&obj).to_string();
        let api = self.api(gvk_key, non_empty(meta::namespace(&obj))).await?;
        let dynamic = from_store_value(&obj)?;
        let updated = api
            .replace(&name, &PostParams::default(), &dynamic)
            .await
            .map_err(|e| map_kube_err(e, &format!("update {}/{}", gvk_key, name)))?;
        to_store_value(&updated)
    }

    async fn update_status(&self, gvk_key: &str, obj: Value) -> StoreResult<Value> {
        let name = meta::name(&obj).to_string();
        let api = self.api(gvk_key, non_empty(meta::namespace(&obj))).await?;
        let data = serde_json::to_vec(&obj)
            .map_err(|e| StoreError::Internal(format!("serializing status: {}", e)))?;
        let updated = api
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| map_kube_err(e, &format!("update status {}/{}", gvk_key, name)))?;
        to_store_value(&updated)
    }

    async fn delete(
        &self,
        gvk_key: &str,
        namespace: Option<&str>,
        name: &str,
        resource_version: Option<&str>,
    ) -> StoreResult<()> {
        let api = self.api(gvk_key, namespace).await?;
        let mut params = DeleteParams::default();
        if let Some(rv) = resource_version {
            params.preconditions = Some(Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            });
        }
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            // Not-found deletes are success by contract.
            Err(e) => match map_kube_err(e, &format!("delete {}/{}", gvk_key, name)) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn watch(&self, gvk_key: &str) -> StoreResult<mpsc::Receiver<StoreEvent>> {
        let (tx, rx) = mpsc::channel(queue_cap());
        let key = gvk_key.to_string();
        tokio::spawn(async move {
            if let Err(err) = run_watcher(&key, tx).await {
                warn!(gvk = %key, error = %err, "watcher terminated");
            }
        });
        Ok(rx)
    }
}

/// List+watch loop with jittered relist and backoff, restarted on errors.
async fn run_watcher(gvk_key: &str, tx: mpsc::Sender<StoreEvent>) -> Result<()> {
    let client = get_kube_client().await?;
    let (ar, _) = find_api_resource(client.clone(), gvk_key).await?;

    let relist_secs: u64 = std::env::var("ENO_RELIST_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300);
    let backoff_max: u64 = std::env::var("ENO_WATCH_BACKOFF_MAX_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);

    info!(gvk = %gvk_key, relist_secs, "watcher starting");

    let mut backoff: u64 = 1;
    loop {
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);

        // Relists are jittered so watchers do not all hit the apiserver on
        // the same tick.
        let relist = eno_store::jittered(std::time::Duration::from_secs(relist_secs.max(1)));
        let relist_timer = tokio::time::sleep(relist);
        tokio::pin!(relist_timer);
        debug!(gvk = %gvk_key, relist_secs = relist.as_secs(), "watch stream opened");

        let errored = loop {
            tokio::select! {
                maybe_ev = stream.try_next() => {
                    match maybe_ev {
                        Ok(Some(Event::Applied(o))) => {
                            if forward(&tx, StoreEvent::Applied(to_store_value(&o)?)).await.is_err() {
                                return Ok(());
                            }
                            backoff = 1;
                        }
                        Ok(Some(Event::Deleted(o))) => {
                            if forward(&tx, StoreEvent::Deleted(to_store_value(&o)?)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Ok(Some(Event::Restarted(list))) => {
                            debug!(gvk = %gvk_key, count = list.len(), "watch restarted");
                            for o in &list {
                                if forward(&tx, StoreEvent::Applied(to_store_value(o)?)).await.is_err() {
                                    return Ok(());
                                }
                            }
                            backoff = 1;
                        }
                        Ok(None) => break false,
                        Err(e) => {
                            warn!(gvk = %gvk_key, error = %e, "watch stream error; restarting");
                            counter!("watch_errors_total", 1u64);
                            break true;
                        }
                    }
                }
                _ = &mut relist_timer => {
                    debug!(gvk = %gvk_key, "relist interval elapsed; restarting watch");
                    counter!("relist_total", 1u64);
                    break false;
                }
            }
        };

        if errored {
            tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(backoff_max);
        }
    }
}

async fn forward(tx: &mpsc::Sender<StoreEvent>, ev: StoreEvent) -> Result<(), ()> {
    tx.send(ev).await.map_err(|_| ())
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_parsing() {
        let gvk = parse_gvk_key("v1/Pod").unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Pod");

        let gvk = parse_gvk_key("eno.azure.io/v1/Composition").unwrap();
        assert_eq!(gvk.group, "eno.azure.io");
        assert_eq!(gvk.kind, "Composition");

        assert!(parse_gvk_key("Pod").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }

    #[test]
    fn managed_fields_are_stripped() {
        let mut v = serde_json::json!({
            "metadata": { "name": "x", "managedFields": [{"manager": "kubectl"}] }
        });
        strip_managed_fields(&mut v);
        assert!(v.pointer("/metadata/managedFields").is_none());
    }
}
