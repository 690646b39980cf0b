//! Key derivation: canonical serialization and hashing.
//!
//! Two events are duplicates iff their selected subtrees serialize to the
//! same canonical form. Canonical means object keys sorted, no
//! whitespace, and `serde_json`'s stable number formatting, so the digest
//! does not depend on map ordering or formatting choices upstream.

use md5::Md5;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::HashAlgorithm;

/// Serializes a JSON subtree into its canonical textual form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        // serde_json handles escaping; a bare string always serializes.
        Value::String(s) => out.push_str(&serde_json::to_string(s).unwrap_or_default()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// Hex digest of a JSON subtree's canonical form.
pub fn hash_subtree(value: &Value, algorithm: HashAlgorithm) -> String {
    let canonical = canonical_json(value);
    match algorithm {
        HashAlgorithm::Md5 => hex::encode(Md5::digest(canonical.as_bytes())),
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(canonical.as_bytes())),
    }
}

/// Formats the stored key: `"{function_name}#{hex_digest}"`.
///
/// The function name salts the digest so two functions sharing a table
/// never observe each other's records.
pub fn format_key(function_name: &str, digest: &str) -> String {
    format!("{function_name}#{digest}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_sorts_object_keys() {
        let value = json!({"b": 1, "a": {"d": true, "c": null}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":null,"d":true},"b":1}"#);
    }

    #[test]
    fn test_canonical_preserves_array_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(canonical_json(&value), "[3,1,2]");
    }

    #[test]
    fn test_canonical_escapes_strings() {
        let value = json!({"k": "a\"b\nc"});
        assert_eq!(canonical_json(&value), r#"{"k":"a\"b\nc"}"#);
    }

    #[test]
    fn test_canonical_primitives() {
        assert_eq!(canonical_json(&json!(null)), "null");
        assert_eq!(canonical_json(&json!(true)), "true");
        assert_eq!(canonical_json(&json!(42)), "42");
        assert_eq!(canonical_json(&json!(-1.5)), "-1.5");
        assert_eq!(canonical_json(&json!("x")), r#""x""#);
    }

    #[test]
    fn test_digest_is_hex_of_expected_width() {
        let value = json!({"address": "https://x"});
        let md5 = hash_subtree(&value, HashAlgorithm::Md5);
        let sha = hash_subtree(&value, HashAlgorithm::Sha256);
        assert_eq!(md5.len(), 32);
        assert_eq!(sha.len(), 64);
        assert!(md5.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_digest_differs_across_algorithms_and_inputs() {
        let a = json!({"id": 1});
        let b = json!({"id": 2});
        assert_ne!(
            hash_subtree(&a, HashAlgorithm::Md5),
            hash_subtree(&b, HashAlgorithm::Md5)
        );
        assert_ne!(
            hash_subtree(&a, HashAlgorithm::Md5),
            hash_subtree(&a, HashAlgorithm::Sha256)
        );
    }

    #[test]
    fn test_format_key() {
        assert_eq!(format_key("orders", "abc123"), "orders#abc123");
        assert_eq!(format_key("", "abc123"), "#abc123");
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    /// Strategy producing arbitrary JSON trees of bounded depth.
    fn arb_json() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-zA-Z0-9 _\\-\"\\\\]{0,12}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4)
                    .prop_map(serde_json::Value::Array),
                proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(|m| {
                    serde_json::Value::Object(m.into_iter().collect())
                }),
            ]
        })
    }

    proptest! {
        /// Canonicalization is deterministic: same tree, same bytes.
        #[test]
        fn prop_canonical_is_deterministic(value in arb_json()) {
            prop_assert_eq!(canonical_json(&value), canonical_json(&value));
        }

        /// The canonical form is valid JSON that parses back to the
        /// same tree.
        #[test]
        fn prop_canonical_roundtrips(value in arb_json()) {
            let canonical = canonical_json(&value);
            let reparsed: serde_json::Value =
                serde_json::from_str(&canonical).expect("canonical form must parse");
            prop_assert_eq!(reparsed, value);
        }

        /// Object key insertion order never affects the digest.
        #[test]
        fn prop_key_order_does_not_matter(
            a in any::<i64>(),
            b in "[a-z]{0,8}",
        ) {
            let forward = json!({"first": a, "second": b.clone()});
            let mut reversed = serde_json::Map::new();
            reversed.insert("second".to_string(), json!(b));
            reversed.insert("first".to_string(), json!(a));
            let reversed = serde_json::Value::Object(reversed);

            prop_assert_eq!(
                hash_subtree(&forward, HashAlgorithm::Md5),
                hash_subtree(&reversed, HashAlgorithm::Md5)
            );
        }
    }
}
