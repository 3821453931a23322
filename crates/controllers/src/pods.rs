//! Worker pod construction and pruning.
//!
//! Pruning is deliberately a pure function from observed state to a
//! decision: crash recovery is re-derivation, not replay. At most one pod
//! is deleted per pass; the watch event for that deletion drives the next
//! decision.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eno_core::api::{
    Composition, Synthesis, Synthesizer, COMPOSITION_GENERATION_ANNOTATION,
    COMPOSITION_NAMESPACE_LABEL, COMPOSITION_NAME_LABEL, SYNTHESIS_UUID_LABEL,
};
use serde_json::{json, Value};

use crate::Config;

/// The slice of pod state pruning cares about.
#[derive(Debug, Clone, Default)]
pub struct PodView {
    pub name: String,
    pub resource_version: Option<String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// PodScheduled=True transition time.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Whether any container has been created.
    pub container_started: bool,
}

impl PodView {
    pub fn from_value(v: &Value) -> Self {
        let ts = |p: &str| {
            v.pointer(p)
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        let string_map = |p: &str| {
            v.pointer(p)
                .and_then(|m| m.as_object())
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default()
        };
        let scheduled_at = v
            .pointer("/status/conditions")
            .and_then(|c| c.as_array())
            .and_then(|conds| {
                conds.iter().find(|c| {
                    c.get("type").and_then(|t| t.as_str()) == Some("PodScheduled")
                        && c.get("status").and_then(|s| s.as_str()) == Some("True")
                })
            })
            .and_then(|c| c.get("lastTransitionTime"))
            .and_then(|t| t.as_str())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        let container_started = v
            .pointer("/status/containerStatuses")
            .and_then(|c| c.as_array())
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        Self {
            name: eno_store::meta::name(v).to_string(),
            resource_version: eno_store::meta::resource_version(v).map(String::from),
            creation_timestamp: ts("/metadata/creationTimestamp"),
            deletion_timestamp: ts("/metadata/deletionTimestamp"),
            labels: string_map("/metadata/labels"),
            annotations: string_map("/metadata/annotations"),
            scheduled_at,
            container_started,
        }
    }

    pub fn deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn synthesis_uuid(&self) -> Option<&str> {
        self.labels.get(SYNTHESIS_UUID_LABEL).map(|s| s.as_str())
    }

    pub fn composition_generation(&self) -> Option<i64> {
        self.annotations.get(COMPOSITION_GENERATION_ANNOTATION).and_then(|v| v.parse().ok())
    }
}

/// The pruning decision: which pod (if any) to delete this pass, and
/// whether a usable worker pod currently exists.
pub fn should_delete_pod<'a>(
    comp: &Composition,
    synthesizer: Option<&Synthesizer>,
    pods: &'a [PodView],
    cfg: &Config,
    now: DateTime<Utc>,
) -> (Option<&'a PodView>, bool) {
    let deleting = pods.iter().filter(|p| p.deleting()).count();
    // More than one pod already terminating means replacements are
    // outpacing teardown; touch nothing until the dust settles.
    if deleting > 1 {
        return (None, true);
    }
    let exists = pods.iter().any(|p| !p.deleting());

    let pod_timeout = synthesizer
        .and_then(|s| s.spec.pod_timeout)
        .unwrap_or(cfg.default_pod_timeout);
    let exec_timeout = synthesizer
        .and_then(|s| s.spec.exec_timeout)
        .unwrap_or(cfg.default_exec_timeout);

    for pod in pods.iter().filter(|p| !p.deleting()) {
        if comp.deleting() || synthesizer.is_none() {
            return (Some(pod), exists);
        }
        if pod.composition_generation().map(|g| g != comp.metadata.generation).unwrap_or(false) {
            return (Some(pod), exists);
        }
        let synthesis = pod
            .synthesis_uuid()
            .and_then(|u| comp.synthesis_by_uuid(u))
            .or(comp.status.in_flight_synthesis.as_ref())
            .or(comp.status.current_synthesis.as_ref());
        if synthesis.map(Synthesis::synthesized).unwrap_or(false) {
            return (Some(pod), exists); // worker already delivered
        }
        if let Some(created) = pod.creation_timestamp {
            if age(now, created) > pod_timeout {
                return (Some(pod), exists);
            }
        }
        // Retry path: the container never came up within the exec timeout.
        // Suppressed while any pod is still terminating, and once the
        // retry budget is spent.
        let attempts = synthesis.map(|s| s.attempts).unwrap_or(0);
        if deleting == 0
            && !pod.container_started
            && attempts < cfg.max_synthesis_attempts
            && pod.scheduled_at.map(|t| age(now, t) > exec_timeout).unwrap_or(false)
        {
            return (Some(pod), exists);
        }
    }
    (None, exists)
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or_default()
}

/// Builds the worker pod for an in-flight synthesis. The name includes the
/// attempt counter so retries never collide with a terminating predecessor.
pub fn build_worker_pod(comp: &Composition, synthesizer: &Synthesizer, synthesis: &Synthesis) -> Value {
    let short = synthesis.uuid.get(..8).unwrap_or(&synthesis.uuid);
    let mut labels = synthesizer.spec.pod_overrides.labels.clone();
    labels.insert(COMPOSITION_NAME_LABEL.into(), comp.metadata.name.clone());
    labels.insert(COMPOSITION_NAMESPACE_LABEL.into(), comp.metadata.namespace.clone());
    labels.insert(SYNTHESIS_UUID_LABEL.into(), synthesis.uuid.clone());
    let mut annotations = synthesizer.spec.pod_overrides.annotations.clone();
    annotations.insert(
        COMPOSITION_GENERATION_ANNOTATION.into(),
        comp.metadata.generation.to_string(),
    );

    let env: Vec<Value> = comp
        .spec
        .synthesis_env
        .iter()
        .map(|e| json!({ "name": e.name, "value": e.value }))
        .collect();

    let mut pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": format!("synth-{}-{}", short, synthesis.attempts),
            "namespace": comp.metadata.namespace,
            "labels": labels,
            "annotations": annotations,
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": "synthesizer",
                "image": synthesizer.spec.image,
                "command": synthesizer.spec.command,
                "env": env,
            }],
        }
    });
    if !synthesizer.spec.pod_overrides.service_account.is_empty() {
        pod["spec"]["serviceAccountName"] =
            Value::String(synthesizer.spec.pod_overrides.service_account.clone());
    }
    pod
}
