//! Field-level JSON squash and property synchronization.
//!
//! `merge` keeps the representative dominant: it is overlaid onto a clone of
//! the other object, so the representative wins every key collision while
//! fields only the other object carries survive. Folding a batch
//! oldest-to-newest through `merge` therefore yields last-writer-wins at
//! field granularity, not whole-record granularity.
use serde_json::{Map, Value};

/// Squash `other` under `representative`. The result carries the union of
/// both key sets; `representative` wins collisions. Nested objects merge by
/// the same rule; arrays and scalars are replaced whole.
pub fn merge(representative: &Value, other: &Value) -> Value {
    match (representative, other) {
        (Value::Object(rep), Value::Object(base)) => {
            let mut merged = base.clone();
            overlay(&mut merged, rep);
            Value::Object(merged)
        }
        // A non-object representative has final say over everything.
        _ => representative.clone(),
    }
}

fn overlay(base: &mut Map<String, Value>, over: &Map<String, Value>) {
    for (key, value) in over {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                overlay(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Restrict `target`'s fields to the key set of `template`. Values come from
/// `target`; the result's key set is the intersection of the two.
pub fn synchronize(template: &Value, target: &Value) -> Value {
    let (Some(template), Some(target)) = (template.as_object(), target.as_object()) else {
        return target.clone();
    };
    let restricted: Map<String, Value> = target
        .iter()
        .filter(|(key, _)| template.contains_key(*key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Value::Object(restricted)
}
