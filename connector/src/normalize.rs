use crate::model::{Envelope, NormalizedPulse};
use serde_json::{Map, Value};
use tracing::warn;

const PATH_SEPARATOR: char = '.';
const SEPARATOR_REPLACEMENT: &str = "_";
const OPERATOR_SENTINEL: char = '$';
/// JSONB cannot hold U+0000 in any string.
const NUL: char = '\0';

/// `.` would be read as a path separator and a leading `$` as an operator.
pub fn sanitize_key(key: &str) -> String {
    strip_nul(key)
        .replace(PATH_SEPARATOR, SEPARATOR_REPLACEMENT)
        .trim_start_matches(OPERATOR_SENTINEL)
        .to_string()
}

fn strip_nul(s: &str) -> String {
    s.replace(NUL, "")
}

/// Rewrites every mapping key, at any depth, and drops NUL characters from
/// strings. Other scalars pass through untouched.
pub fn make_storage_safe(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_map(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(make_storage_safe).collect()),
        Value::String(s) if s.contains(NUL) => Value::String(strip_nul(&s)),
        other => other,
    }
}

fn sanitize_map(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| (sanitize_key(&key), make_storage_safe(value)))
        .collect()
}

/// Sanitizes one raw record and pairs it with its envelope. Records that are
/// not mappings cannot carry an envelope and are dropped.
pub fn normalize(record: Value, envelope: Envelope) -> Option<NormalizedPulse> {
    match make_storage_safe(record) {
        Value::Object(body) => Some(NormalizedPulse { body, envelope }),
        other => {
            warn!(
                page = envelope.page_no,
                kind = value_kind(&other),
                "Skipping record that is not an object"
            );
            None
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunContext;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn rewrites_separators_and_operator_prefixes() {
        assert_eq!(sanitize_key("a.b.c"), "a_b_c");
        assert_eq!(sanitize_key("$where"), "where");
        assert_eq!(sanitize_key("$$x.y"), "x_y");
        assert_eq!(sanitize_key("price$"), "price$");
        assert_eq!(sanitize_key("plain"), "plain");
    }

    #[test]
    fn recurses_through_nested_mappings_and_sequences() {
        let raw = json!({
            "id": "p1",
            "$meta": {"a.b": 1},
            "indicators": [
                {"indicator": "1.2.3.4", "$type": "IPv4"},
                "already.a.string",
                [ {"x.y": null} ]
            ]
        });

        let expected = json!({
            "id": "p1",
            "meta": {"a_b": 1},
            "indicators": [
                {"indicator": "1.2.3.4", "type": "IPv4"},
                "already.a.string",
                [ {"x_y": null} ]
            ]
        });

        assert_eq!(make_storage_safe(raw), expected);
    }

    #[test]
    fn nul_characters_are_dropped_from_keys_and_strings() {
        let raw = json!({
            "id": "p-nul",
            "description": "bad\u{0}byte",
            "na\u{0}me": ["x\u{0}", {"$\u{0}$k.v": "\u{0}"}]
        });

        let expected = json!({
            "id": "p-nul",
            "description": "badbyte",
            "name": ["x", {"k_v": ""}]
        });

        assert_eq!(make_storage_safe(raw), expected);
    }

    #[test]
    fn scalars_are_returned_unchanged() {
        assert_eq!(make_storage_safe(json!("a.b")), json!("a.b"));
        assert_eq!(make_storage_safe(json!(3)), json!(3));
        assert_eq!(make_storage_safe(Value::Null), Value::Null);
    }

    #[test]
    fn normalize_keeps_envelope_separate_from_body() {
        let ctx = RunContext::new("otx_pulses_subscribed");
        let pulse = normalize(json!({"id": "p1", "a.b": 2}), ctx.envelope(2)).unwrap();

        assert_eq!(pulse.body, json!({"id": "p1", "a_b": 2}).as_object().cloned().unwrap());
        assert_eq!(pulse.envelope.page_no, 2);
        assert_eq!(pulse.envelope.run_id, ctx.run_id);
    }

    #[test]
    fn non_object_records_are_skipped() {
        let ctx = RunContext::new("src");
        assert!(normalize(json!(["not", "a", "pulse"]), ctx.envelope(1)).is_none());
        assert!(normalize(json!("x"), ctx.envelope(1)).is_none());
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-z.$\\x00]{0,6}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                proptest::collection::btree_map("[a-z.$\\x00]{0,6}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn keys_are_safe(value: &Value) -> bool {
        match value {
            Value::Object(map) => map.iter().all(|(k, v)| {
                !k.contains(PATH_SEPARATOR)
                    && !k.contains(NUL)
                    && !k.starts_with(OPERATOR_SENTINEL)
                    && keys_are_safe(v)
            }),
            Value::String(s) => !s.contains(NUL),
            Value::Array(items) => items.iter().all(keys_are_safe),
            _ => true,
        }
    }

    proptest! {
        #[test]
        fn sanitizing_is_idempotent(value in arb_json()) {
            let once = make_storage_safe(value);
            let twice = make_storage_safe(once.clone());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn no_unsafe_key_survives(value in arb_json()) {
            prop_assert!(keys_are_safe(&make_storage_safe(value)));
        }
    }
}
