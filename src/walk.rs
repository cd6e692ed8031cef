//! Safe property walking over JSON values.
//!
//! Every dynamic property access in the engine funnels through this module:
//! reference path walking, pseudo-node reads, and dynamic key resolution.
//! Keys that could reach prototype machinery in a template layer are
//! rejected outright; the walker itself never fails, it just stops.

use serde_json::Value;

/// Keys that are never valid dynamic property names.
const FORBIDDEN_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// A single walk step: object key or array index.
#[derive(Debug, Clone, PartialEq)]
pub enum WalkSegment {
    Key(String),
    Index(usize),
}

/// Check a dynamic property name against the forbidden-key list.
pub fn is_safe_key(key: &str) -> bool {
    !FORBIDDEN_KEYS.contains(&key)
}

/// Walk `segments` into `value`. A missing key/index or a scalar in the
/// middle of the path yields `None`; forbidden keys yield `Err` with the
/// offending key so the caller can record a security violation.
pub fn walk_path<'a>(value: &'a Value, segments: &[WalkSegment]) -> Result<Option<&'a Value>, String> {
    let mut current = value;

    for segment in segments {
        current = match segment {
            WalkSegment::Key(key) => {
                if !is_safe_key(key) {
                    return Err(key.clone());
                }
                match current.get(key.as_str()) {
                    Some(v) => v,
                    None => return Ok(None),
                }
            }
            WalkSegment::Index(idx) => match current.get(*idx) {
                Some(v) => v,
                None => return Ok(None),
            },
        };
    }

    Ok(Some(current))
}

/// Split a dotted key (`"address.line1"`) into walk segments, numeric
/// segments becoming array indices.
pub fn split_dotted(path: &str) -> Vec<WalkSegment> {
    path.split('.')
        .filter(|part| !part.is_empty())
        .map(|part| match part.parse::<usize>() {
            Ok(idx) => WalkSegment::Index(idx),
            Err(_) => WalkSegment::Key(part.to_string()),
        })
        .collect()
}

/// JS-style truthiness, the coercion rule used by predicates, conditionals,
/// and transition gating.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Whether a value counts as "defined" for waterfall resolution. Null plays
/// the role of undefined throughout the engine.
pub fn is_defined(value: &Value) -> bool {
    !value.is_null()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn walks_objects_and_arrays() {
        let value = json!({"items": [{"name": "first"}, {"name": "second"}]});
        let segments = split_dotted("items.1.name");

        let found = walk_path(&value, &segments).unwrap();
        assert_eq!(found, Some(&json!("second")));
    }

    #[test]
    fn missing_path_is_none_not_error() {
        let value = json!({"a": 1});
        assert_eq!(walk_path(&value, &split_dotted("a.b.c")).unwrap(), None);
        assert_eq!(walk_path(&value, &split_dotted("missing")).unwrap(), None);
    }

    #[test]
    fn forbidden_keys_are_rejected() {
        let value = json!({"__proto__": {"polluted": true}});

        for key in ["__proto__", "constructor", "prototype"] {
            assert!(!is_safe_key(key));
            let err = walk_path(&value, &[WalkSegment::Key(key.to_string())]);
            assert_eq!(err, Err(key.to_string()));
        }
    }

    #[test]
    fn truthiness_follows_js_coercion() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("no")));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn dotted_split_handles_indices() {
        assert_eq!(
            split_dotted("items.0.name"),
            vec![
                WalkSegment::Key("items".into()),
                WalkSegment::Index(0),
                WalkSegment::Key("name".into()),
            ]
        );
    }
}
