use audit_pipeline::audit::truncate::{Truncator, MIN_MAX_OBJECT_BYTES};
use proptest::prelude::*;
use serde_json::{json, Value};

fn json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z0-9 \"\\\\\n\u{1}\u{e9}\u{4e2d}\u{1F600}]{0,400}".prop_map(Value::String),
    ];

    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            proptest::collection::btree_map("[a-z_]{1,8}", inner, 0..8)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

fn ceiling_strategy() -> impl Strategy<Value = usize> {
    MIN_MAX_OBJECT_BYTES..4096usize
}

/// Every leaf as (reported path, JSON pointer, value).
fn leaves(value: &Value, path: String, pointer: String, out: &mut Vec<(String, String, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                leaves(child, child_path, format!("{}/{}", pointer, key), out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                leaves(child, format!("{}[{}]", path, i), format!("{}/{}", pointer, i), out);
            }
        }
        _ => {
            let path = if path.is_empty() { "$".to_string() } else { path };
            out.push((path, pointer, value.clone()));
        }
    }
}

/// Whether `path` is a listed path or lies beneath one.
fn listed(path: &str, fields: &[String]) -> bool {
    fields.iter().any(|field| {
        field == "$"
            || path == field
            || path.starts_with(&format!("{}.", field))
            || path.starts_with(&format!("{}[", field))
    })
}

proptest! {
    #[test]
    fn output_never_exceeds_ceiling(value in json_strategy(), max in ceiling_strategy()) {
        let input = serde_json::to_vec(&value).unwrap();
        let outcome = Truncator::new(max).truncate(&input).unwrap();
        prop_assert!(outcome.json.len() <= max, "{} > {}", outcome.json.len(), max);
    }

    #[test]
    fn output_is_valid_json_matching_value(value in json_strategy(), max in ceiling_strategy()) {
        let input = serde_json::to_vec(&value).unwrap();
        let outcome = Truncator::new(max).truncate(&input).unwrap();
        let reparsed: Value = serde_json::from_slice(&outcome.json).unwrap();
        prop_assert_eq!(reparsed, outcome.value);
    }

    #[test]
    fn fitting_input_is_returned_unchanged(value in json_strategy()) {
        let input = serde_json::to_vec(&value).unwrap();
        let outcome = Truncator::new(input.len().max(MIN_MAX_OBJECT_BYTES)).truncate(&input).unwrap();
        prop_assert!(!outcome.was_truncated);
        prop_assert!(outcome.truncated_fields.is_empty());
        prop_assert_eq!(outcome.json, input);
    }

    #[test]
    fn truncation_is_idempotent(value in json_strategy(), max in ceiling_strategy()) {
        let truncator = Truncator::new(max);
        let input = serde_json::to_vec(&value).unwrap();
        let first = truncator.truncate(&input).unwrap();
        let second = truncator.truncate(&first.json).unwrap();
        prop_assert!(!second.was_truncated);
        prop_assert_eq!(second.json, first.json);
    }

    #[test]
    fn truncation_is_deterministic(value in json_strategy(), max in ceiling_strategy()) {
        let truncator = Truncator::new(max);
        let input = serde_json::to_vec(&value).unwrap();
        let a = truncator.truncate(&input).unwrap();
        let b = truncator.truncate(&input).unwrap();
        prop_assert_eq!(a.json, b.json);
        prop_assert_eq!(a.truncated_fields, b.truncated_fields);
    }

    #[test]
    fn truncated_flag_matches_fields(value in json_strategy(), max in ceiling_strategy()) {
        let input = serde_json::to_vec(&value).unwrap();
        let outcome = Truncator::new(max).truncate(&input).unwrap();
        prop_assert_eq!(outcome.was_truncated, input.len() > max);
        prop_assert_eq!(outcome.was_truncated, !outcome.truncated_fields.is_empty());
    }

    #[test]
    fn unlisted_leaves_are_preserved(value in json_strategy(), max in ceiling_strategy()) {
        let input = serde_json::to_vec(&value).unwrap();
        let outcome = Truncator::new(max).truncate(&input).unwrap();

        let mut all = Vec::new();
        leaves(&value, String::new(), String::new(), &mut all);
        for (path, pointer, original) in all {
            if listed(&path, &outcome.truncated_fields) {
                continue;
            }
            prop_assert_eq!(
                outcome.value.pointer(&pointer),
                Some(&original),
                "{} changed without being listed in {:?}",
                path,
                outcome.truncated_fields
            );
        }
    }
}
