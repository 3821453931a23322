//! Schema resolution against the store: structural schemas are read from
//! CustomResourceDefinitions, including CRDs the synthesizers themselves
//! materialize.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use eno_schema::{SchemaResolver, StructuralSchema};
use eno_store::{ObjectStore, Selector};
use kube::core::GroupVersionKind;
use tracing::debug;

const CRD_KEY: &str = "apiextensions.k8s.io/v1/CustomResourceDefinition";

pub struct StoreSchemaResolver {
    store: Arc<dyn ObjectStore>,
    // Positive cache only: a CRD may appear at any time.
    cache: RwLock<HashMap<String, Arc<StructuralSchema>>>,
}

impl StoreSchemaResolver {
    pub fn new(store: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self { store, cache: RwLock::new(HashMap::new()) })
    }
}

#[async_trait::async_trait]
impl SchemaResolver for StoreSchemaResolver {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<Arc<StructuralSchema>>> {
        if gvk.group.is_empty() {
            return Ok(None); // builtins have no CRD
        }
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if let Some(hit) = self.cache.read().unwrap().get(&key).cloned() {
            return Ok(Some(hit));
        }

        let crds = self.store.list(CRD_KEY, None, &Selector::new()).await?;
        let found = crds.iter().find(|crd| {
            crd.pointer("/spec/group").and_then(|v| v.as_str()) == Some(gvk.group.as_str())
                && crd.pointer("/spec/names/kind").and_then(|v| v.as_str()) == Some(gvk.kind.as_str())
        });
        let Some(crd) = found else {
            debug!(gvk = %key, "no CRD found; schema-free merge");
            return Ok(None);
        };
        let Some(schema) = StructuralSchema::from_crd(crd, &gvk.version)? else {
            return Ok(None);
        };
        let schema = Arc::new(schema);
        self.cache.write().unwrap().insert(key, Arc::clone(&schema));
        Ok(Some(schema))
    }
}
