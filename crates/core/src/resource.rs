//! The manifest parser: one entry of a ResourceSlice becomes a [`Resource`],
//! the in-memory representation everything downstream (cache, merge,
//! reconciliation) works against.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use fnv::FnvHasher;
use kube::core::GroupVersionKind;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::api::{Composition, NamespacedName, ResourceSlice, ResourceState};
use crate::readiness;

const ANNOTATION_PREFIX: &str = "eno.azure.io/";
const RECONCILE_INTERVAL_KEY: &str = "eno.azure.io/reconcile-interval";
const DISABLE_UPDATES_KEY: &str = "eno.azure.io/disable-updates";
const READINESS_GROUP_KEY: &str = "eno.azure.io/readiness-group";
const READINESS_PREFIX: &str = "eno.azure.io/readiness";

const PATCH_GROUP: &str = "eno.azure.io";
const PATCH_KIND: &str = "Patch";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("manifest is not a JSON object")]
    NotAnObject,
    #[error("missing name, kind, or apiVersion")]
    MissingIdentity,
    #[error("parsing patch envelope: {0}")]
    PatchEnvelope(String),
}

/// Identity of a synthesized resource. Two resources are the same resource
/// iff their refs are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}.{})/{}/{}", self.group, self.kind, self.namespace, self.name)
    }
}

/// Position of a manifest within a slice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ManifestRef {
    pub slice: NamespacedName,
    pub index: usize,
}

/// A CRD's defined type, used to register schemas for dynamic kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

pub struct Resource {
    pub reference: Ref,
    pub gvk: GroupVersionKind,
    pub manifest_ref: ManifestRef,
    pub manifest_deleted: bool,
    /// FNV-64 of the raw manifest bytes; stable ordering for conflicts.
    pub manifest_hash: u64,
    pub reconcile_interval: Option<Duration>,
    pub readiness_checks: Vec<readiness::Check>,
    pub readiness_group: i64,
    pub disable_updates: bool,
    /// RFC 6902 ops applied in lieu of a merge, from a Patch envelope.
    pub patch: Option<json_patch::Patch>,
    /// Set on CRDs: the group/kind they define.
    pub defined_group_kind: Option<GroupKind>,
    /// Labels as emitted by the synthesizer, before pruning.
    pub labels: BTreeMap<String, String>,

    parsed: Value,
    latest_state: ArcSwapOption<ResourceState>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("ref", &self.reference)
            .field("manifest_ref", &self.manifest_ref)
            .field("hash", &self.manifest_hash)
            .field("group", &self.readiness_group)
            .finish()
    }
}

#[derive(Deserialize)]
struct PatchEnvelope {
    patch: PatchMeta,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchMeta {
    api_version: String,
    kind: String,
    ops: json_patch::Patch,
}

impl Resource {
    /// Parses the manifest at `index` of `slice`.
    pub fn from_slice(slice: &ResourceSlice, index: usize) -> Result<Self, ParseError> {
        let entry = &slice.spec.resources[index];

        let mut hasher = FnvHasher::default();
        hasher.write(entry.manifest.as_bytes());
        let manifest_hash = hasher.finish();

        let mut parsed: Value = serde_json::from_str(&entry.manifest)?;
        let obj = parsed.as_object_mut().ok_or(ParseError::NotAnObject)?;

        // Synthesizers written against client structs routinely emit
        // status={} and creationTimestamp=null; neither may perturb merges.
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            if meta.get("creationTimestamp").map(is_zero_timestamp).unwrap_or(false) {
                meta.remove("creationTimestamp");
            }
        }

        let api_version = str_at(&parsed, &["apiVersion"]).unwrap_or_default();
        let kind = str_at(&parsed, &["kind"]).unwrap_or_default();
        let name = str_at(&parsed, &["metadata", "name"]).unwrap_or_default();
        let namespace = str_at(&parsed, &["metadata", "namespace"]).unwrap_or_default();
        if api_version.is_empty() || kind.is_empty() || name.is_empty() {
            return Err(ParseError::MissingIdentity);
        }

        let (group, version) = split_api_version(&api_version);
        let mut gvk = GroupVersionKind { group: group.clone(), version, kind: kind.clone() };

        let mut res = Resource {
            reference: Ref { group, kind, namespace, name },
            gvk: GroupVersionKind { group: String::new(), version: String::new(), kind: String::new() },
            manifest_ref: ManifestRef { slice: slice.metadata.nsn(), index },
            manifest_deleted: entry.deleted,
            manifest_hash,
            reconcile_interval: None,
            readiness_checks: Vec::new(),
            readiness_group: 0,
            disable_updates: false,
            patch: None,
            defined_group_kind: None,
            labels: BTreeMap::new(),
            parsed: Value::Null,
            latest_state: ArcSwapOption::empty(),
        };

        if gvk.group == PATCH_GROUP && gvk.kind == PATCH_KIND {
            let envelope: PatchEnvelope = serde_json::from_str(&entry.manifest)
                .map_err(|e| ParseError::PatchEnvelope(e.to_string()))?;
            let (group, version) = split_api_version(&envelope.patch.api_version);
            gvk = GroupVersionKind { group, version, kind: envelope.patch.kind };
            res.reference.group = gvk.group.clone();
            res.reference.kind = gvk.kind.clone();
            res.patch = Some(envelope.patch.ops);
        }

        if gvk.group == "apiextensions.k8s.io" && gvk.kind == "CustomResourceDefinition" {
            res.defined_group_kind = Some(GroupKind {
                group: str_at(&parsed, &["spec", "group"]).unwrap_or_default(),
                kind: str_at(&parsed, &["spec", "names", "kind"]).unwrap_or_default(),
            });
        }

        res.labels = string_map_at(&parsed, &["metadata", "labels"]);
        let annotations = string_map_at(&parsed, &["metadata", "annotations"]);

        if let Some(raw) = annotations.get(RECONCILE_INTERVAL_KEY) {
            match humantime::parse_duration(raw) {
                Ok(d) => res.reconcile_interval = Some(d),
                Err(_) => warn!(value = %raw, "invalid reconcile interval - ignoring"),
            }
        }

        res.disable_updates = annotations.get(DISABLE_UPDATES_KEY).map(|v| v == "true").unwrap_or(false);

        if let Some(raw) = annotations.get(READINESS_GROUP_KEY) {
            match raw.parse::<i64>() {
                Ok(g) => res.readiness_group = g,
                Err(_) => warn!(value = %raw, "invalid readiness group - ignoring"),
            }
        }

        for (key, value) in &annotations {
            if !key.starts_with(READINESS_PREFIX) || key == READINESS_GROUP_KEY {
                continue;
            }
            let check_name = if key == READINESS_PREFIX {
                "default"
            } else {
                key.trim_start_matches("eno.azure.io/readiness-")
            };
            match readiness::Check::parse(value) {
                Ok(mut check) => {
                    check.name = check_name.to_string();
                    res.readiness_checks.push(check);
                }
                Err(err) => warn!(check = %check_name, error = %err, "invalid readiness expression"),
            }
        }
        res.readiness_checks.sort_by(|a, b| a.name.cmp(&b.name));

        prune_metadata(&mut parsed, "annotations");
        prune_metadata(&mut parsed, "labels");

        res.gvk = gvk;
        res.parsed = parsed;
        Ok(res)
    }

    /// The pruned object to be created or merged into the cluster.
    pub fn parsed(&self) -> &Value {
        &self.parsed
    }

    /// Store key in `group/version/Kind` (or `version/Kind`) form.
    pub fn gvk_key(&self) -> String {
        if self.gvk.group.is_empty() {
            format!("{}/{}", self.gvk.version, self.gvk.kind)
        } else {
            format!("{}/{}/{}", self.gvk.group, self.gvk.version, self.gvk.kind)
        }
    }

    /// The deletion predicate: true when the live object should be removed.
    pub fn deleted(&self, comp: &Composition) -> bool {
        (comp.deleting() && !comp.should_orphan_resources())
            || self.manifest_deleted
            || self.patch_sets_deletion_timestamp()
    }

    /// Whether the stored patch would actually change `current`.
    pub fn needs_to_be_patched(&self, current: &Value) -> bool {
        let Some(patch) = &self.patch else { return false };
        let mut patched = current.clone();
        if json_patch::patch(&mut patched, patch).is_err() {
            return false;
        }
        patched != *current
    }

    pub fn patch_sets_deletion_timestamp(&self) -> bool {
        let Some(patch) = &self.patch else { return false };
        // Apply to a minimally-viable placeholder; only the metadata
        // outcome matters here.
        let mut placeholder = serde_json::json!({
            "apiVersion": "eno.azure.io/v1",
            "kind": "PatchPlaceholder",
            "metadata": {},
        });
        if json_patch::patch(&mut placeholder, patch).is_err() {
            return false;
        }
        placeholder
            .pointer("/metadata/deletionTimestamp")
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }

    /// Deterministic ordering for conflicting resources.
    pub fn less(&self, other: &Resource) -> bool {
        self.manifest_hash < other.manifest_hash
    }

    /// Latest state observed by the reconciler. Single writer, many readers.
    pub fn state(&self) -> Option<Arc<ResourceState>> {
        self.latest_state.load_full()
    }

    pub fn set_state(&self, state: ResourceState) {
        self.latest_state.store(Some(Arc::new(state)));
    }
}

/// Builds an input revision snapshot entry from a bound object.
pub fn new_input_revisions(obj: &Value, key: &str) -> crate::api::InputRevisions {
    let annotations = string_map_at(obj, &["metadata", "annotations"]);
    crate::api::InputRevisions {
        key: key.to_string(),
        resource_version: str_at(obj, &["metadata", "resourceVersion"]).unwrap_or_default(),
        revision: annotations
            .get(crate::api::REVISION_ANNOTATION)
            .and_then(|v| v.parse().ok()),
        synthesizer_generation: annotations
            .get(crate::api::SYNTHESIZER_GENERATION_ANNOTATION)
            .and_then(|v| v.parse().ok()),
    }
}

pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

fn is_zero_timestamp(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn str_at(v: &Value, path: &[&str]) -> Option<String> {
    let mut cur = v;
    for seg in path {
        cur = cur.get(seg)?;
    }
    cur.as_str().map(|s| s.to_string())
}

fn string_map_at(v: &Value, path: &[&str]) -> BTreeMap<String, String> {
    let mut cur = v;
    for seg in path {
        match cur.get(seg) {
            Some(next) => cur = next,
            None => return BTreeMap::new(),
        }
    }
    cur.as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

// Drops every eno.azure.io/* key from metadata.<field>, removing the map
// entirely when it ends up empty.
fn prune_metadata(v: &mut Value, field: &str) {
    let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) else {
        return;
    };
    let emptied = match meta.get_mut(field).and_then(|m| m.as_object_mut()) {
        Some(map) => {
            map.retain(|k, _| !k.starts_with(ANNOTATION_PREFIX));
            map.is_empty()
        }
        None => false,
    };
    if emptied {
        meta.remove(field);
    }
}
