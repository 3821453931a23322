//! Structural schemas for the merge engine.
//!
//! A [`StructuralSchema`] tells the three-way merge how each field combines:
//! objects merge field-wise, `x-kubernetes-list-type: map` lists merge by
//! their key fields, everything else replaces atomically. Schemas are parsed
//! from CRD `openAPIV3Schema` documents; a [`SchemaResolver`] supplies them
//! per GVK and may always return `None`, in which case the merge engine
//! falls back to a schema-free merge patch.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use kube::core::GroupVersionKind;
use serde_json::Value;

/// How a field merges. `Granular` objects recurse; `Map` applies the value
/// node to every key; `ListMap` merges array items matched on key fields;
/// `ListSet` unions scalars; `Atomic` replaces wholesale.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    Atomic,
    Granular { fields: BTreeMap<String, SchemaNode> },
    Map { value: Box<SchemaNode> },
    ListMap { keys: Vec<String>, item: Box<SchemaNode> },
    ListSet,
}

impl SchemaNode {
    pub fn field(&self, name: &str) -> Option<&SchemaNode> {
        match self {
            SchemaNode::Granular { fields } => fields.get(name),
            SchemaNode::Map { value } => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuralSchema {
    pub root: SchemaNode,
}

impl StructuralSchema {
    /// Parses the schema served for `version` out of a CRD object. Returns
    /// `Ok(None)` when the CRD declares no schema for that version.
    pub fn from_crd(crd: &Value, version: &str) -> Result<Option<Self>> {
        let versions = crd
            .pointer("/spec/versions")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("CRD has no spec.versions"))?;

        // Prefer the requested version; else storage=true; else first served.
        let chosen = versions
            .iter()
            .find(|v| v.get("name").and_then(|n| n.as_str()) == Some(version))
            .or_else(|| versions.iter().find(|v| v.get("storage").and_then(|b| b.as_bool()).unwrap_or(false)))
            .or_else(|| versions.iter().find(|v| v.get("served").and_then(|b| b.as_bool()).unwrap_or(false)));

        let Some(chosen) = chosen else { return Ok(None) };
        let Some(openapi) = chosen.pointer("/schema/openAPIV3Schema") else {
            return Ok(None);
        };
        Ok(Some(Self { root: parse_node(openapi) }))
    }
}

fn parse_node(schema: &Value) -> SchemaNode {
    let ty = schema.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match ty {
        "object" => {
            if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
                let fields = props.iter().map(|(k, v)| (k.clone(), parse_node(v))).collect();
                SchemaNode::Granular { fields }
            } else if let Some(ap) = schema.get("additionalProperties") {
                SchemaNode::Map { value: Box::new(parse_node(ap)) }
            } else {
                // preserve-unknown objects still merge field-wise
                SchemaNode::Granular { fields: BTreeMap::new() }
            }
        }
        "array" => {
            let list_type = schema.get("x-kubernetes-list-type").and_then(|t| t.as_str());
            match list_type {
                Some("map") => {
                    let keys = schema
                        .get("x-kubernetes-list-map-keys")
                        .and_then(|k| k.as_array())
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                        .unwrap_or_default();
                    let item = schema.get("items").map(parse_node).unwrap_or(SchemaNode::Atomic);
                    SchemaNode::ListMap { keys, item: Box::new(item) }
                }
                Some("set") => SchemaNode::ListSet,
                _ => SchemaNode::Atomic,
            }
        }
        _ => SchemaNode::Atomic,
    }
}

/// Supplies structural schemas per GVK. `None` means "no schema known";
/// errors are treated the same way by the merge engine, with a log line.
#[async_trait::async_trait]
pub trait SchemaResolver: Send + Sync {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<Arc<StructuralSchema>>>;
}

/// Resolver that knows nothing; every merge takes the schema-free path.
pub struct NoSchema;

#[async_trait::async_trait]
impl SchemaResolver for NoSchema {
    async fn resolve(&self, _gvk: &GroupVersionKind) -> Result<Option<Arc<StructuralSchema>>> {
        Ok(None)
    }
}

/// Fixed map of schemas, keyed by `group/Kind`. Used in tests and for
/// registering schemas extracted from synthesized CRDs.
#[derive(Default)]
pub struct StaticResolver {
    schemas: std::sync::RwLock<BTreeMap<String, Arc<StructuralSchema>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, group: &str, kind: &str, schema: StructuralSchema) {
        self.schemas
            .write()
            .unwrap()
            .insert(format!("{}/{}", group, kind), Arc::new(schema));
    }
}

#[async_trait::async_trait]
impl SchemaResolver for StaticResolver {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<Arc<StructuralSchema>>> {
        let key = format!("{}/{}", gvk.group, gvk.kind);
        Ok(self.schemas.read().unwrap().get(&key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crd() -> Value {
        json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": "widgets.example.com" },
            "spec": {
                "group": "example.com",
                "names": { "kind": "Widget" },
                "versions": [{
                    "name": "v1",
                    "served": true,
                    "storage": true,
                    "schema": { "openAPIV3Schema": {
                        "type": "object",
                        "properties": {
                            "spec": {
                                "type": "object",
                                "properties": {
                                    "replicas": { "type": "integer" },
                                    "tags": { "type": "array", "x-kubernetes-list-type": "set",
                                              "items": { "type": "string" } },
                                    "containers": {
                                        "type": "array",
                                        "x-kubernetes-list-type": "map",
                                        "x-kubernetes-list-map-keys": ["name"],
                                        "items": {
                                            "type": "object",
                                            "properties": {
                                                "name": { "type": "string" },
                                                "image": { "type": "string" }
                                            }
                                        }
                                    },
                                    "env": { "type": "array", "items": { "type": "string" } },
                                    "limits": {
                                        "type": "object",
                                        "additionalProperties": { "type": "string" }
                                    }
                                }
                            }
                        }
                    }}
                }]
            }
        })
    }

    #[test]
    fn parses_merge_strategies() {
        let schema = StructuralSchema::from_crd(&crd(), "v1").unwrap().unwrap();
        let spec = schema.root.field("spec").unwrap();
        assert_eq!(spec.field("replicas"), Some(&SchemaNode::Atomic));
        assert_eq!(spec.field("tags"), Some(&SchemaNode::ListSet));
        assert!(matches!(spec.field("containers"), Some(SchemaNode::ListMap { keys, .. }) if keys == &["name"]));
        // untyped arrays are atomic
        assert_eq!(spec.field("env"), Some(&SchemaNode::Atomic));
        assert!(matches!(spec.field("limits"), Some(SchemaNode::Map { .. })));
    }

    #[test]
    fn missing_version_falls_back_to_storage() {
        let schema = StructuralSchema::from_crd(&crd(), "v2").unwrap();
        assert!(schema.is_some(), "storage version used when requested one is absent");
    }

    #[test]
    fn crd_without_schema_resolves_to_none() {
        let crd = json!({
            "spec": { "versions": [{ "name": "v1", "served": true }] }
        });
        assert!(StructuralSchema::from_crd(&crd, "v1").unwrap().is_none());
    }

    #[tokio::test]
    async fn static_resolver_lookup() {
        let resolver = StaticResolver::new();
        resolver.insert("example.com", "Widget", StructuralSchema { root: SchemaNode::Atomic });
        let gvk = GroupVersionKind { group: "example.com".into(), version: "v1".into(), kind: "Widget".into() };
        assert!(resolver.resolve(&gvk).await.unwrap().is_some());
        let other = GroupVersionKind { group: "other".into(), version: "v1".into(), kind: "Widget".into() };
        assert!(resolver.resolve(&other).await.unwrap().is_none());
    }
}
