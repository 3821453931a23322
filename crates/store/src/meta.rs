//! Metadata accessors for dynamic store objects.

use eno_core::api::NamespacedName;
use serde_json::Value;

pub fn name(obj: &Value) -> &str {
    obj.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or("")
}

pub fn namespace(obj: &Value) -> &str {
    obj.pointer("/metadata/namespace").and_then(|v| v.as_str()).unwrap_or("")
}

pub fn nsn(obj: &Value) -> NamespacedName {
    NamespacedName::new(namespace(obj), name(obj))
}

pub fn uid(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/uid").and_then(|v| v.as_str())
}

pub fn resource_version(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion").and_then(|v| v.as_str())
}

pub fn generation(obj: &Value) -> i64 {
    obj.pointer("/metadata/generation").and_then(|v| v.as_i64()).unwrap_or(0)
}

pub fn deletion_timestamp(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/deletionTimestamp").and_then(|v| v.as_str())
}

pub fn label<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.pointer("/metadata/labels").and_then(|l| l.get(key)).and_then(|v| v.as_str())
}

pub fn annotation<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.pointer("/metadata/annotations").and_then(|a| a.get(key)).and_then(|v| v.as_str())
}

pub fn finalizers(obj: &Value) -> Vec<&str> {
    obj.pointer("/metadata/finalizers")
        .and_then(|f| f.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default()
}

/// The controller owner reference, if any: (kind, name).
pub fn controller_owner(obj: &Value) -> Option<(&str, &str)> {
    let refs = obj.pointer("/metadata/ownerReferences")?.as_array()?;
    refs.iter()
        .find(|r| r.get("controller").and_then(|c| c.as_bool()).unwrap_or(false))
        .and_then(|r| Some((r.get("kind")?.as_str()?, r.get("name")?.as_str()?)))
}

/// Store key of an object, derived from its own apiVersion/kind.
pub fn gvk_key(obj: &Value) -> String {
    let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
    let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    format!("{}/{}", api_version, kind)
}

pub fn set_resource_version(obj: &mut Value, rv: &str) {
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("resourceVersion".into(), Value::String(rv.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accessors() {
        let obj = json!({
            "apiVersion": "eno.azure.io/v1",
            "kind": "Composition",
            "metadata": {
                "name": "c",
                "namespace": "ns",
                "resourceVersion": "5",
                "generation": 2,
                "labels": { "k": "v" },
                "finalizers": ["eno.azure.io/cleanup"],
                "ownerReferences": [
                    { "kind": "Symphony", "name": "s", "controller": true }
                ]
            }
        });
        assert_eq!(name(&obj), "c");
        assert_eq!(namespace(&obj), "ns");
        assert_eq!(nsn(&obj), NamespacedName::new("ns", "c"));
        assert_eq!(resource_version(&obj), Some("5"));
        assert_eq!(generation(&obj), 2);
        assert_eq!(label(&obj, "k"), Some("v"));
        assert_eq!(finalizers(&obj), vec!["eno.azure.io/cleanup"]);
        assert_eq!(controller_owner(&obj), Some(("Symphony", "s")));
        assert_eq!(gvk_key(&obj), "eno.azure.io/v1/Composition");
        assert!(deletion_timestamp(&obj).is_none());
    }
}
