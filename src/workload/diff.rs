//! Semantic comparison of a stored object against a desired one.
//!
//! The desired object is compared as a subset of the stored one: fields the
//! server defaults (and the desired object omits) never count as a change.
//! Fields removed since the last applied configuration are detected
//! separately, from the last-applied annotation.

use serde_json::{Map, Value};

use super::LAST_APPLIED_ANNOTATION;

/// Metadata the server owns.
const SERVER_METADATA: &[&str] = &[
    "resourceVersion",
    "creationTimestamp",
    "managedFields",
    "uid",
    "generation",
    "selfLink",
];

/// Strip everything that must not take part in the comparison.
pub fn normalize(mut object: Value) -> Value {
    if let Value::Object(map) = &mut object {
        map.remove("status");
        map.remove("apiVersion");
        map.remove("kind");

        if let Some(Value::Object(meta)) = map.get_mut("metadata") {
            for field in SERVER_METADATA {
                meta.remove(*field);
            }
            if let Some(Value::Object(annotations)) = meta.get_mut("annotations") {
                annotations.remove(LAST_APPLIED_ANNOTATION);
            }
        }

        if let Some(Value::Array(templates)) = map
            .get_mut("spec")
            .and_then(|s| s.get_mut("volumeClaimTemplates"))
        {
            for template in templates.iter_mut() {
                if let Value::Object(t) = template {
                    t.remove("status");
                    t.remove("apiVersion");
                    t.remove("kind");
                }
            }
        }
    }
    object
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn child(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Paths where `desired` is not contained in `stored`.
fn subset_diff(desired: &Value, stored: Option<&Value>, path: &str, out: &mut Vec<String>) {
    let Some(stored) = stored else {
        if !is_empty(desired) {
            out.push(path.to_string());
        }
        return;
    };

    match (desired, stored) {
        (Value::Object(d), Value::Object(s)) => {
            for (key, value) in d {
                subset_diff(value, s.get(key), &child(path, key), out);
            }
        }
        (Value::Array(d), Value::Array(s)) => {
            if d.len() != s.len() {
                out.push(path.to_string());
                return;
            }
            for (i, (dv, sv)) in d.iter().zip(s).enumerate() {
                subset_diff(dv, Some(sv), &format!("{path}[{i}]"), out);
            }
        }
        (d, s) if is_empty(d) && is_empty(s) => {}
        (d, s) if d != s => out.push(path.to_string()),
        _ => {}
    }
}

/// Paths present in `last_applied` but dropped from `desired`.
fn removed_fields(last_applied: &Map<String, Value>, desired: &Map<String, Value>, path: &str, out: &mut Vec<String>) {
    for (key, previous) in last_applied {
        let p = child(path, key);
        match desired.get(key) {
            None if !is_empty(previous) => out.push(p),
            Some(Value::Object(now)) => {
                if let Value::Object(before) = previous {
                    removed_fields(before, now, &p, out);
                }
            }
            _ => {}
        }
    }
}

/// Differences between `stored` and `desired`, as dotted paths. Empty means
/// no update is needed.
pub fn diff(stored: &Value, desired: &Value) -> Vec<String> {
    let last_applied = stored
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str::<Value>(s).ok())
        .map(normalize);

    let stored = normalize(stored.clone());
    let desired = normalize(desired.clone());

    let mut out = Vec::new();
    subset_diff(&desired, Some(&stored), "", &mut out);
    if let (Some(Value::Object(before)), Value::Object(now)) = (&last_applied, &desired) {
        removed_fields(before, now, "", &mut out);
    }
    out.sort();
    out.dedup();
    out
}
