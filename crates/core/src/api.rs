//! The `eno.azure.io/v1` object model plus the status helpers the
//! controllers rely on (eligibility, rotation, finalizers, input drift).
//!
//! Objects cross the store boundary as plain JSON; these types are the
//! serde shapes of that JSON. Metadata follows the apimachinery field
//! names so the same objects round-trip through a real apiserver.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_VERSION: &str = "eno.azure.io/v1";

/// Finalizer held on Compositions and Symphonies until teardown completes.
pub const CLEANUP_FINALIZER: &str = "eno.azure.io/cleanup";

/// Annotation that opts a composition out of resource teardown on deletion.
pub const DELETION_STRATEGY_KEY: &str = "eno.azure.io/deletion-strategy";
pub const DELETION_STRATEGY_ORPHAN: &str = "orphan";

// Worker pod labels/annotations. Consumed by the pruning logic and by
// whatever executes the synthesizer program.
pub const COMPOSITION_NAME_LABEL: &str = "eno.azure.io/composition-name";
pub const COMPOSITION_NAMESPACE_LABEL: &str = "eno.azure.io/composition-namespace";
pub const SYNTHESIS_UUID_LABEL: &str = "eno.azure.io/synthesis-uuid";
pub const COMPOSITION_GENERATION_ANNOTATION: &str = "eno.azure.io/composition-generation";

// Binding revision annotations, read off bound input objects.
pub const REVISION_ANNOTATION: &str = "eno.azure.io/revision";
pub const SYNTHESIZER_GENERATION_ANNOTATION: &str = "eno.azure.io/synthesizer-generation";

/// Namespace + name, the store key for namespaced objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub controller: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub generation: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl ObjectMeta {
    pub fn nsn(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.iter().any(|f| f == name)
    }

    /// Returns true when the finalizer was actually added.
    pub fn add_finalizer(&mut self, name: &str) -> bool {
        if self.has_finalizer(name) {
            return false;
        }
        self.finalizers.push(name.to_string());
        true
    }

    /// Returns true when the finalizer was actually removed.
    pub fn remove_finalizer(&mut self, name: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != name);
        self.finalizers.len() != before
    }

    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

// ---------------------------------------------------------------- Composition

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Composition {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CompositionSpec,
    pub status: CompositionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompositionSpec {
    pub synthesizer: SynthesizerRef,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub synthesis_env: Vec<EnvVar>,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub reconcile_interval: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SynthesizerRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Binding {
    /// Logical input key the synthesizer declared in its refs.
    pub key: String,
    pub resource: BoundRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BoundRef {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompositionStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight_synthesis: Option<Synthesis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_synthesis: Option<Synthesis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_synthesis: Option<Synthesis>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub input_revisions: Vec<InputRevisions>,
    /// Stamped (solely) by slice cleanup when a still-referenced slice has
    /// gone missing; consumed by the lifecycle controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_resynthesis: Option<DateTime<Utc>>,
}

impl Composition {
    pub const KIND: &'static str = "Composition";

    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn nsn(&self) -> NamespacedName {
        self.metadata.nsn()
    }

    pub fn deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn should_orphan_resources(&self) -> bool {
        self.metadata
            .annotations
            .get(DELETION_STRATEGY_KEY)
            .map(|v| v == DELETION_STRATEGY_ORPHAN)
            .unwrap_or(false)
    }

    pub fn current_synthesis_uuid(&self) -> Option<&str> {
        self.status.current_synthesis.as_ref().map(|s| s.uuid.as_str())
    }

    pub fn synthesis_by_uuid(&self, uuid: &str) -> Option<&Synthesis> {
        [
            self.status.in_flight_synthesis.as_ref(),
            self.status.current_synthesis.as_ref(),
            self.status.previous_synthesis.as_ref(),
        ]
        .into_iter()
        .flatten()
        .find(|s| s.uuid == uuid)
    }

    /// Every slice name referenced by any of the three synthesis records.
    pub fn referenced_slice_names(&self) -> Vec<&str> {
        [
            self.status.in_flight_synthesis.as_ref(),
            self.status.current_synthesis.as_ref(),
            self.status.previous_synthesis.as_ref(),
        ]
        .into_iter()
        .flatten()
        .flat_map(|s| s.resource_slices.iter().map(|r| r.name.as_str()))
        .collect()
    }

    /// True when an in-flight synthesis exists and has not been canceled.
    pub fn synthesis_in_flight(&self) -> bool {
        self.status
            .in_flight_synthesis
            .as_ref()
            .map(|s| s.canceled.is_none())
            .unwrap_or(false)
    }

    /// The (re)synthesis eligibility predicate. The caller supplies a
    /// freshly recomputed input revision snapshot.
    pub fn needs_synthesis(&self, synthesizer: &Synthesizer, observed: &[InputRevisions]) -> bool {
        if self.synthesis_in_flight() {
            return false;
        }
        // A synthesis canceled at the retry ceiling suppresses resynthesis
        // until the composition or synthesizer generation advances.
        if let Some(canceled) = &self.status.in_flight_synthesis {
            return canceled.observed_composition_generation < self.metadata.generation
                || canceled.observed_synthesizer_generation < synthesizer.metadata.generation;
        }
        let current = match &self.status.current_synthesis {
            None => return true,
            Some(s) => s,
        };
        current.observed_composition_generation < self.metadata.generation
            || current.observed_synthesizer_generation < synthesizer.metadata.generation
            || self.status.pending_resynthesis.is_some()
            || input_revisions_drifted(&current.input_revisions, observed)
    }
}

/// Compares a stored input revision snapshot against a recomputed one.
/// Per binding: when both sides carry a revision annotation only revisions
/// are compared, otherwise resourceVersion decides. A changed key set is
/// always drift.
pub fn input_revisions_drifted(stored: &[InputRevisions], observed: &[InputRevisions]) -> bool {
    if stored.len() != observed.len() {
        return true;
    }
    for obs in observed {
        let Some(prev) = stored.iter().find(|s| s.key == obs.key) else {
            return true;
        };
        match (prev.revision, obs.revision) {
            (Some(a), Some(b)) => {
                if a != b {
                    return true;
                }
            }
            _ => {
                if prev.resource_version != obs.resource_version {
                    return true;
                }
            }
        }
    }
    false
}

// ------------------------------------------------------------------ Synthesis

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Synthesis {
    pub uuid: String,
    pub observed_composition_generation: i64,
    pub observed_synthesizer_generation: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub input_revisions: Vec<InputRevisions>,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialized: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_creation: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesized: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resource_slices: Vec<ResourceSliceRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_slice_count: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<SynthesisResult>,
}

impl Synthesis {
    pub fn new(comp: &Composition, synthesizer: &Synthesizer, revisions: Vec<InputRevisions>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            observed_composition_generation: comp.metadata.generation,
            observed_synthesizer_generation: synthesizer.metadata.generation,
            input_revisions: revisions,
            initialized: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn synthesized(&self) -> bool {
        self.synthesized.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSliceRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SynthesisResult {
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub severity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputRevisions {
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesizer_generation: Option<i64>,
}

// ---------------------------------------------------------------- Synthesizer

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Synthesizer {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: SynthesizerSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SynthesizerSpec {
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Bounds synthesizer runtime once its container has started.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub exec_timeout: Option<Duration>,
    /// Bounds total worker pod lifetime, scheduling included.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub pod_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<InputRef>,
    pub pod_overrides: PodOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputRef {
    pub key: String,
    pub resource: InputResourceRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputResourceRef {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodOverrides {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_account: String,
}

impl Synthesizer {
    pub const KIND: &'static str = "Synthesizer";

    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

// -------------------------------------------------------------- ResourceSlice

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSlice {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ResourceSliceSpec,
    pub status: ResourceSliceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSliceSpec {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Manifest>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manifest {
    /// The resource manifest as an opaque JSON string.
    pub manifest: String,
    /// Marks the resource for removal from the cluster.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSliceStatus {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reconciled: bool,
}

impl ResourceSlice {
    pub const KIND: &'static str = "ResourceSlice";

    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// A slice is fully reconciled when every manifest has a matching,
    /// reconciled status entry.
    pub fn fully_reconciled(&self) -> bool {
        self.status.resources.len() == self.spec.resources.len()
            && self.status.resources.iter().all(|s| s.reconciled)
    }

    /// Latest ready time across all resources, or None if any is not ready.
    pub fn all_ready_at(&self) -> Option<DateTime<Utc>> {
        if self.status.resources.len() != self.spec.resources.len() {
            return None;
        }
        let mut max: Option<DateTime<Utc>> = None;
        for state in &self.status.resources {
            let t = state.ready?;
            max = Some(max.map_or(t, |m| m.max(t)));
        }
        max
    }
}

// ------------------------------------------------------------------- Symphony

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Symphony {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: SymphonySpec,
    pub status: SymphonyStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SymphonySpec {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variations: Vec<Variation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Variation {
    pub synthesizer: SynthesizerRef,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SymphonyStatus {
    pub observed_generation: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub synthesizers: Vec<SynthesizerRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesized: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<DateTime<Utc>>,
}

impl Symphony {
    pub const KIND: &'static str = "Symphony";
}

// ----------------------------------------------------------------- conversion

/// Deserialize a typed object from its store JSON.
pub fn from_value<T: serde::de::DeserializeOwned>(v: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(v)
}

/// Serialize a typed object into store JSON.
pub fn to_value<T: Serialize>(t: &T) -> Value {
    serde_json::to_value(t).expect("object model serializes infallibly")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesizer_with_generation(generation: i64) -> Synthesizer {
        let mut syn = Synthesizer::new("default", "test-syn");
        syn.metadata.generation = generation;
        syn
    }

    #[test]
    fn needs_synthesis_when_no_current() {
        let comp = Composition::new("default", "test");
        assert!(comp.needs_synthesis(&synthesizer_with_generation(1), &[]));
    }

    #[test]
    fn needs_synthesis_on_generation_bump() {
        let mut comp = Composition::new("default", "test");
        comp.metadata.generation = 2;
        comp.status.current_synthesis = Some(Synthesis {
            observed_composition_generation: 1,
            observed_synthesizer_generation: 1,
            ..Default::default()
        });
        assert!(comp.needs_synthesis(&synthesizer_with_generation(1), &[]));

        comp.status.current_synthesis.as_mut().unwrap().observed_composition_generation = 2;
        assert!(!comp.needs_synthesis(&synthesizer_with_generation(1), &[]));
    }

    #[test]
    fn needs_synthesis_on_synthesizer_bump() {
        let mut comp = Composition::new("default", "test");
        comp.metadata.generation = 1;
        comp.status.current_synthesis = Some(Synthesis {
            observed_composition_generation: 1,
            observed_synthesizer_generation: 1,
            ..Default::default()
        });
        assert!(comp.needs_synthesis(&synthesizer_with_generation(2), &[]));
    }

    #[test]
    fn in_flight_blocks_resynthesis() {
        let mut comp = Composition::new("default", "test");
        comp.metadata.generation = 5;
        comp.status.in_flight_synthesis = Some(Synthesis {
            observed_composition_generation: 1,
            ..Default::default()
        });
        assert!(!comp.needs_synthesis(&synthesizer_with_generation(1), &[]));
    }

    #[test]
    fn canceled_in_flight_blocks_until_generation_advances() {
        let mut comp = Composition::new("default", "test");
        comp.metadata.generation = 1;
        comp.status.in_flight_synthesis = Some(Synthesis {
            observed_composition_generation: 1,
            observed_synthesizer_generation: 1,
            canceled: Some(Utc::now()),
            ..Default::default()
        });
        assert!(!comp.needs_synthesis(&synthesizer_with_generation(1), &[]));

        comp.metadata.generation = 2;
        assert!(comp.needs_synthesis(&synthesizer_with_generation(1), &[]));
    }

    #[test]
    fn pending_resynthesis_forces_eligibility() {
        let mut comp = Composition::new("default", "test");
        comp.metadata.generation = 1;
        comp.status.current_synthesis = Some(Synthesis {
            observed_composition_generation: 1,
            observed_synthesizer_generation: 1,
            ..Default::default()
        });
        assert!(!comp.needs_synthesis(&synthesizer_with_generation(1), &[]));
        comp.status.pending_resynthesis = Some(Utc::now());
        assert!(comp.needs_synthesis(&synthesizer_with_generation(1), &[]));
    }

    #[test]
    fn input_drift_prefers_revisions_over_resource_versions() {
        let stored = vec![InputRevisions {
            key: "a".into(),
            resource_version: "1".into(),
            revision: Some(3),
            ..Default::default()
        }];
        // resourceVersion changed but the revision annotation did not.
        let observed = vec![InputRevisions {
            key: "a".into(),
            resource_version: "9".into(),
            revision: Some(3),
            ..Default::default()
        }];
        assert!(!input_revisions_drifted(&stored, &observed));

        let observed = vec![InputRevisions {
            key: "a".into(),
            resource_version: "9".into(),
            revision: Some(4),
            ..Default::default()
        }];
        assert!(input_revisions_drifted(&stored, &observed));
    }

    #[test]
    fn input_drift_on_key_set_change() {
        let stored = vec![InputRevisions { key: "a".into(), resource_version: "1".into(), ..Default::default() }];
        let observed = vec![InputRevisions { key: "b".into(), resource_version: "1".into(), ..Default::default() }];
        assert!(input_revisions_drifted(&stored, &observed));
        assert!(input_revisions_drifted(&stored, &[]));
    }

    #[test]
    fn metadata_roundtrips_through_json() {
        let mut comp = Composition::new("default", "test");
        comp.metadata.generation = 3;
        comp.spec.reconcile_interval = Some(Duration::from_secs(30));
        comp.spec.synthesizer.name = "syn".into();
        let v = to_value(&comp);
        assert_eq!(v["spec"]["reconcileInterval"], "30s");
        assert_eq!(v["metadata"]["generation"], 3);
        let back: Composition = from_value(v).unwrap();
        assert_eq!(back, comp);
    }

    #[test]
    fn slice_rollups() {
        let mut slice = ResourceSlice::new("default", "s");
        slice.spec.resources = vec![Manifest::default(), Manifest::default()];
        assert!(!slice.fully_reconciled());

        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);
        slice.status.resources = vec![
            ResourceState { ready: Some(t1), reconciled: true },
            ResourceState { ready: Some(t0), reconciled: true },
        ];
        assert!(slice.fully_reconciled());
        assert_eq!(slice.all_ready_at(), Some(t1));

        slice.status.resources[1].ready = None;
        assert_eq!(slice.all_ready_at(), None);
    }
}
