//! Domain-prefixed canonical JSON serialization.
//!
//! Every byte string that gets signed or verified in this system is
//! produced here: `canonicalize(domain, value)` yields the ASCII domain
//! prefix followed by a stable JSON rendering (keys sorted bytewise at
//! every level, arrays in order, no whitespace, UTF-8).
//!
//! The canonicalizer fails loudly instead of coercing: numbers outside
//! the safe-integer range and values that do not serialize to plain
//! JSON are rejected, so a signature can never be computed over
//! ambiguous data.

use serde::Serialize;
use serde_json::Value;

/// Largest integer magnitude representable exactly across JSON
/// implementations (2^53 - 1).
pub const MAX_SAFE_INT: u64 = 9_007_199_254_740_991;

/// Signing domains. The prefix makes signatures of different artifact
/// classes non-substitutable: a receipt signature can never verify as a
/// capability signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    CapDoc,
    Receipt,
    ActionRequest,
}

impl Domain {
    pub fn prefix(self) -> &'static str {
        match self {
            Domain::CapDoc => "capnet:capdoc/0.1:",
            Domain::Receipt => "capnet:receipt/0.1:",
            Domain::ActionRequest => "capnet:actionrequest/0.1:",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    #[error("value does not serialize to plain JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("number outside safe integer range: {0}")]
    UnsafeNumber(String),
}

/// Canonical signing bytes: `domain prefix || stable JSON`.
pub fn canonicalize<T: Serialize>(domain: Domain, value: &T) -> Result<Vec<u8>, CanonicalError> {
    let mut out = String::from(domain.prefix());
    out.push_str(&stable_json(value)?);
    Ok(out.into_bytes())
}

/// Stable JSON rendering without the domain prefix.
pub fn stable_json<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let v = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&v, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), CanonicalError> {
    match value {
        Value::Object(map) => {
            // Keys sorted bytewise (String's lexicographic order),
            // recursed into children.
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);

            out.push('{');
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k)?);
                out.push(':');
                write_canonical(v, out)?;
            }
            out.push('}');
            Ok(())
        }
        Value::Array(arr) => {
            out.push('[');
            for (i, v) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out)?;
            }
            out.push(']');
            Ok(())
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i.unsigned_abs() > MAX_SAFE_INT {
                    return Err(CanonicalError::UnsafeNumber(n.to_string()));
                }
            } else if let Some(u) = n.as_u64() {
                if u > MAX_SAFE_INT {
                    return Err(CanonicalError::UnsafeNumber(n.to_string()));
                }
            } else if n.as_f64().is_none() {
                // Arbitrary-precision numbers have no interoperable form.
                return Err(CanonicalError::UnsafeNumber(n.to_string()));
            }
            out.push_str(&serde_json::to_string(n)?);
            Ok(())
        }
        // Strings, booleans, null: serde_json's rendering is already exact.
        _ => {
            out.push_str(&serde_json::to_string(value)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sorts_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(stable_json(&v).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_sorts_nested() {
        let v = json!({"z": {"b": 1, "a": 2}, "a": []});
        assert_eq!(stable_json(&v).unwrap(), r#"{"a":[],"z":{"a":2,"b":1}}"#);
    }

    #[test]
    fn test_arrays_preserve_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(stable_json(&v).unwrap(), "[3,1,2]");
    }

    #[test]
    fn test_domain_prefix() {
        let bytes = canonicalize(Domain::CapDoc, &json!({"x": 1})).unwrap();
        assert_eq!(bytes, br#"capnet:capdoc/0.1:{"x":1}"#);

        let bytes = canonicalize(Domain::Receipt, &json!({"x": 1})).unwrap();
        assert!(bytes.starts_with(b"capnet:receipt/0.1:"));

        let bytes = canonicalize(Domain::ActionRequest, &json!({"x": 1})).unwrap();
        assert!(bytes.starts_with(b"capnet:actionrequest/0.1:"));
    }

    #[test]
    fn test_domains_disjoint() {
        let v = json!({"cap_id": "cap_1"});
        assert_ne!(
            canonicalize(Domain::CapDoc, &v).unwrap(),
            canonicalize(Domain::Receipt, &v).unwrap()
        );
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":{"b":2,"a":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":{"a":3,"b":2},"x":1}"#).unwrap();
        assert_eq!(stable_json(&a).unwrap(), stable_json(&b).unwrap());
    }

    #[test]
    fn test_string_escapes() {
        let v = json!({"msg": "hello \"world\""});
        assert_eq!(stable_json(&v).unwrap(), r#"{"msg":"hello \"world\""}"#);
    }

    #[test]
    fn test_safe_integer_boundary() {
        assert!(stable_json(&json!(9_007_199_254_740_991_u64)).is_ok());
        assert!(matches!(
            stable_json(&json!(9_007_199_254_740_992_u64)),
            Err(CanonicalError::UnsafeNumber(_))
        ));
        assert!(matches!(
            stable_json(&json!(-9_007_199_254_740_992_i64)),
            Err(CanonicalError::UnsafeNumber(_))
        ));
    }

    #[test]
    fn test_unsafe_number_nested_in_object() {
        let v = json!({"amount": u64::MAX});
        assert!(stable_json(&v).is_err());
    }
}
