//! Three-way merge between the previous synthesis, the current synthesis,
//! and the live object.
//!
//! Two paths share one contract: merge what the new synthesis sets onto the
//! live object, retract exactly what disappeared between the old and new
//! syntheses, and leave every other live field alone. With a structural
//! schema the merge walks fields (and keyed lists) individually; without
//! one it degrades to an RFC 7396 three-way merge patch, which treats
//! arrays atomically.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use eno_schema::{SchemaNode, StructuralSchema};
use metrics::counter;
use serde_json::{Map, Value};

/// Computes the object to write back, or `None` when the live object
/// already matches the desired state.
pub fn merge(
    old: Option<&Value>,
    new: &Value,
    current: &Value,
    schema: Option<&StructuralSchema>,
) -> Result<Option<Value>> {
    let merged = match schema {
        Some(schema) => {
            counter!("merge_typed_total", 1u64);
            let mut merged = structural_merge(Some(&schema.root), current, new);
            if let Some(old) = old {
                prune_removed(Some(&schema.root), &mut merged, old, new);
            }
            merged
        }
        None => {
            counter!("merge_untyped_total", 1u64);
            let patch = three_way_merge_patch(old, new, current);
            let mut merged = current.clone();
            json_patch::merge(&mut merged, &patch);
            merged
        }
    };

    if merged == *current {
        return Ok(None);
    }
    Ok(Some(merged))
}

/// Applies a Patch resource's RFC 6902 ops to the live object. Returns
/// `None` when the ops are a no-op.
pub fn apply_ops(ops: &json_patch::Patch, current: &Value) -> Result<Option<Value>> {
    let mut patched = current.clone();
    json_patch::patch(&mut patched, ops).context("applying json patch")?;
    if patched == *current {
        return Ok(None);
    }
    Ok(Some(patched))
}

/// Builds the RFC 7396 three-way merge patch: fields set by `new` that
/// differ from `current`, plus nulls for fields `old` set but `new` no
/// longer does.
pub fn three_way_merge_patch(old: Option<&Value>, new: &Value, current: &Value) -> Value {
    let mut patch = update_patch(new, current).unwrap_or_else(|| Value::Object(Map::new()));
    if let Some(old) = old {
        overlay_deletions(&mut patch, old, new);
    }
    patch
}

// Patch fragment setting everything `new` specifies that `current` does not
// already have. Keys `current` owns but `new` does not mention are left
// untouched here; deletions are the old-vs-new overlay's job.
fn update_patch(new: &Value, current: &Value) -> Option<Value> {
    match (new, current) {
        (Value::Object(new_map), Value::Object(cur_map)) => {
            let mut out = Map::new();
            for (k, nv) in new_map {
                match cur_map.get(k) {
                    Some(cv) if cv == nv => {}
                    Some(cv) => {
                        if let Some(sub) = update_patch(nv, cv) {
                            out.insert(k.clone(), sub);
                        }
                    }
                    None => {
                        out.insert(k.clone(), nv.clone());
                    }
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        _ if new == current => None,
        _ => Some(new.clone()),
    }
}

// Adds `null` entries for keys `old` set that `new` dropped.
fn overlay_deletions(patch: &mut Value, old: &Value, new: &Value) {
    let (Value::Object(old_map), Value::Object(new_map)) = (old, new) else {
        return;
    };
    if !patch.is_object() {
        return;
    }
    for (k, ov) in old_map {
        match new_map.get(k) {
            None => {
                patch[k.as_str()] = Value::Null;
            }
            Some(nv) if ov.is_object() && nv.is_object() => {
                if patch.get(k).is_none() {
                    patch[k.as_str()] = Value::Object(Map::new());
                }
                overlay_deletions(&mut patch[k.as_str()], ov, nv);
                if patch[k.as_str()].as_object().map(|m| m.is_empty()).unwrap_or(false) {
                    patch.as_object_mut().unwrap().remove(k);
                }
            }
            Some(_) => {}
        }
    }
}

// ------------------------------------------------------------ schema-aware

fn structural_merge(node: Option<&SchemaNode>, current: &Value, new: &Value) -> Value {
    match (current, new) {
        (Value::Object(cur), Value::Object(nw)) => {
            if matches!(node, Some(SchemaNode::Atomic)) {
                return new.clone();
            }
            let mut out = cur.clone();
            for (k, nv) in nw {
                let child = node.and_then(|n| n.field(k));
                match cur.get(k) {
                    Some(cv) => {
                        out.insert(k.clone(), structural_merge(child, cv, nv));
                    }
                    None => {
                        out.insert(k.clone(), nv.clone());
                    }
                }
            }
            Value::Object(out)
        }
        (Value::Array(cur), Value::Array(nw)) => match node {
            Some(SchemaNode::ListMap { keys, item }) if !keys.is_empty() => {
                let mut out = cur.clone();
                for nv in nw {
                    let Some(nkey) = item_key(nv, keys) else {
                        if !out.contains(nv) {
                            out.push(nv.clone());
                        }
                        continue;
                    };
                    match out.iter().position(|cv| item_key(cv, keys).as_ref() == Some(&nkey)) {
                        Some(i) => out[i] = structural_merge(Some(item), &out[i], nv),
                        None => out.push(nv.clone()),
                    }
                }
                Value::Array(out)
            }
            Some(SchemaNode::ListSet) => {
                let mut out = cur.clone();
                for nv in nw {
                    if !out.contains(nv) {
                        out.push(nv.clone());
                    }
                }
                Value::Array(out)
            }
            _ => new.clone(),
        },
        _ => new.clone(),
    }
}

// Deletes from `merged` exactly the paths present in `old` but absent from
// `new`, honoring keyed-list identity.
fn prune_removed(node: Option<&SchemaNode>, merged: &mut Value, old: &Value, new: &Value) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let Some(out) = merged.as_object_mut() else { return };
            for (k, ov) in old_map {
                match new_map.get(k) {
                    None => {
                        out.remove(k);
                    }
                    Some(nv) => {
                        if let Some(mv) = out.get_mut(k) {
                            prune_removed(node.and_then(|n| n.field(k)), mv, ov, nv);
                        }
                    }
                }
            }
        }
        (Value::Array(old_arr), Value::Array(new_arr)) => match node {
            Some(SchemaNode::ListMap { keys, item }) if !keys.is_empty() => {
                let Some(out) = merged.as_array_mut() else { return };
                for ov in old_arr {
                    let Some(okey) = item_key(ov, keys) else { continue };
                    let in_new = new_arr.iter().any(|nv| item_key(nv, keys).as_ref() == Some(&okey));
                    if !in_new {
                        out.retain(|mv| item_key(mv, keys).as_ref() != Some(&okey));
                    } else if let Some(nv) = new_arr.iter().find(|nv| item_key(nv, keys).as_ref() == Some(&okey)) {
                        if let Some(mv) = out.iter_mut().find(|mv| item_key(mv, keys).as_ref() == Some(&okey)) {
                            prune_removed(Some(item), mv, ov, nv);
                        }
                    }
                }
            }
            Some(SchemaNode::ListSet) => {
                let Some(out) = merged.as_array_mut() else { return };
                out.retain(|mv| new_arr.contains(mv) || !old_arr.contains(mv));
            }
            _ => {}
        },
        _ => {}
    }
}

fn item_key(item: &Value, keys: &[String]) -> Option<Vec<Value>> {
    keys.iter().map(|k| item.get(k).cloned()).collect()
}
