//! Merge Algebra
//!
//! Deep merge of partial trees plus identity helpers for arrays of records.
//!
//! Merge rules:
//! - object into object: merged key by key, recursively
//! - anything else (arrays included): the incoming value replaces the old one

use serde_json::{Map, Value};

/// Deep-merge `incoming` into `target`.
pub fn deep_merge(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(dst), Value::Object(src)) => merge_maps(dst, src),
        (slot, value) => *slot = value,
    }
}

/// Deep-merge two object maps.
pub fn merge_maps(dst: &mut Map<String, Value>, src: Map<String, Value>) {
    for (key, value) in src {
        match dst.get_mut(&key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                dst.insert(key, value);
            }
        }
    }
}

/// Merge `incoming` over a clone of `base`.
pub fn merged(base: &Value, incoming: &Value) -> Value {
    let mut out = base.clone();
    deep_merge(&mut out, incoming.clone());
    out
}

/// Wrap `value` under a chain of object keys: `["a", "b"]` gives `{a: {b: value}}`.
pub fn nest(keys: &[String], value: Value) -> Value {
    keys.iter().rev().fold(value, |acc, key| {
        let mut map = Map::new();
        map.insert(key.clone(), acc);
        Value::Object(map)
    })
}

/// `null` and `{}` carry nothing to merge.
pub fn is_noop(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

// =============================================================================
// RECORD IDENTITY
// =============================================================================

/// Does `record` match `pattern`?
///
/// Object patterns match when every pattern field is present and equal in the
/// record. Any other pattern matches by equality.
pub fn matches_pattern(record: &Value, pattern: &Value) -> bool {
    match (record, pattern) {
        (Value::Object(r), Value::Object(p)) => p
            .iter()
            .all(|(key, expected)| r.get(key).is_some_and(|actual| matches_pattern(actual, expected))),
        _ => record == pattern,
    }
}

/// Append `value` to `entries`; arrays are spliced in element by element.
pub fn push_entries(entries: &mut Vec<Value>, value: Value) {
    match value {
        Value::Array(items) => entries.extend(items),
        other => entries.push(other),
    }
}

/// Drop every entry matching `pattern`. An array pattern removes entries
/// matching any of its elements. Returns the number removed.
pub fn remove_matching(entries: &mut Vec<Value>, pattern: &Value) -> usize {
    let before = entries.len();
    match pattern {
        Value::Array(patterns) => {
            entries.retain(|e| !patterns.iter().any(|p| matches_pattern(e, p)));
        }
        single => entries.retain(|e| !matches_pattern(e, single)),
    }
    before - entries.len()
}

/// Replace the entry sharing `record`'s `id`. Returns false if `record` has no
/// `id` or no entry carries it.
pub fn replace_by_id(entries: &mut [Value], record: Value) -> bool {
    let Some(id) = record.get("id").cloned() else {
        return false;
    };
    match entries.iter_mut().find(|e| e.get("id") == Some(&id)) {
        Some(slot) => {
            *slot = record;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_objects_merge_deeply() {
        let mut state = json!({ "a": { "b": 1 } });
        deep_merge(&mut state, json!({ "a": { "c": 2 } }));
        assert_eq!(state, json!({ "a": { "b": 1, "c": 2 } }));
    }

    #[test]
    fn test_arrays_replace() {
        let mut state = json!({ "list": [1, 2] });
        deep_merge(&mut state, json!({ "list": [3] }));
        assert_eq!(state, json!({ "list": [3] }));
    }

    #[test]
    fn test_scalar_replaces_object() {
        let mut state = json!({ "a": { "b": 1 } });
        deep_merge(&mut state, json!({ "a": 5 }));
        assert_eq!(state, json!({ "a": 5 }));
    }

    #[test]
    fn test_nest() {
        let keys = vec!["a".to_string(), "b".to_string()];
        assert_eq!(nest(&keys, json!(1)), json!({ "a": { "b": 1 } }));
        assert_eq!(nest(&[], json!(1)), json!(1));
    }

    #[test]
    fn test_noop_values() {
        assert!(is_noop(&Value::Null));
        assert!(is_noop(&json!({})));
        assert!(!is_noop(&json!(0)));
        assert!(!is_noop(&json!([])));
    }

    #[test]
    fn test_remove_partial_match() {
        let mut entries = vec![json!({ "id": 4, "t": "a" }), json!({ "id": 3, "t": "b" })];
        assert_eq!(remove_matching(&mut entries, &json!({ "id": 3 })), 1);
        assert_eq!(entries, vec![json!({ "id": 4, "t": "a" })]);
    }

    #[test]
    fn test_remove_scalars_and_lists() {
        let mut entries = vec![json!(1), json!(2), json!(1), json!(3)];
        remove_matching(&mut entries, &json!(1));
        assert_eq!(entries, vec![json!(2), json!(3)]);
        remove_matching(&mut entries, &json!([2, 3]));
        assert!(entries.is_empty());
    }

    #[test]
    fn test_push_splices_arrays() {
        let mut entries = vec![json!(4)];
        push_entries(&mut entries, json!(5));
        push_entries(&mut entries, json!([6, 7]));
        assert_eq!(entries, vec![json!(4), json!(5), json!(6), json!(7)]);
    }

    #[test]
    fn test_replace_by_id() {
        let mut entries = vec![json!({ "id": 1, "v": 0 }), json!({ "id": 2, "v": 0 })];
        assert!(replace_by_id(&mut entries, json!({ "id": 2, "v": 9 })));
        assert_eq!(entries[1], json!({ "id": 2, "v": 9 }));
        assert_eq!(entries[0], json!({ "id": 1, "v": 0 }));
        assert!(!replace_by_id(&mut entries, json!({ "id": 7 })));
        assert!(!replace_by_id(&mut entries, json!({ "v": 1 })));
    }
}
