//! HMAC-SHA256 signing of webhook events.
//!
//! The signature covers the canonical JSON of `{"event": .., "payload": ..}`:
//! object keys sorted at every depth, no insignificant whitespace. It is a pure
//! function of `(event, payload, secret)` and independent of the transport.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Length of generated secrets in bytes (hex encoded to twice that).
pub const SECRET_BYTES: usize = 32;

/// Serialize `value` with object keys sorted recursively.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;

    match value {
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
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// The exact bytes that get signed.
pub fn signing_input(event: &str, payload: &serde_json::Value) -> String {
    canonical_json(&serde_json::json!({ "event": event, "payload": payload }))
}

/// Hex-encoded HMAC-SHA256 of the canonical `{event, payload}` under `secret`.
pub fn compute_signature(event: &str, payload: &serde_json::Value, secret: &str) -> String {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(signing_input(event, payload).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Recompute the signature and compare in constant time.
pub fn verify_signature(
    signature: &str,
    event: &str,
    payload: &serde_json::Value,
    secret: &str,
) -> bool {
    let expected = compute_signature(event, payload, secret);
    signature.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Fresh random secret from the OS CSPRNG, hex encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": null, "x": "q"}], "c": true}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":true,"z":[3,{"x":"q","y":null}]},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_escapes_strings() {
        let value = json!({"quote\"key": "line\nbreak"});
        assert_eq!(canonical_json(&value), r#"{"quote\"key":"line\nbreak"}"#);
    }

    #[test]
    fn test_signature_independent_of_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"id": 1, "total": 9.5}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"total": 9.5, "id": 1}"#).unwrap();
        assert_eq!(
            compute_signature("order.created", &a, "secret"),
            compute_signature("order.created", &b, "secret")
        );
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let sig = compute_signature("e", &json!({}), "k");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_verify_accepts_own_signature() {
        let payload = json!({"order": 42, "items": ["a", "b"]});
        let sig = compute_signature("order.created", &payload, "s3cret");
        assert!(verify_signature(&sig, "order.created", &payload, "s3cret"));
    }

    #[test]
    fn test_verify_rejects_mutations() {
        let payload = json!({"order": 42});
        let sig = compute_signature("order.created", &payload, "s3cret");

        assert!(!verify_signature(&sig, "order.created", &json!({"order": 43}), "s3cret"));
        assert!(!verify_signature(&sig, "order.createe", &payload, "s3cret"));
        assert!(!verify_signature(&sig, "order.created", &payload, "s3creu"));
        assert!(!verify_signature(&sig[..63], "order.created", &payload, "s3cret"));
    }

    #[test]
    fn test_verify_rejects_every_single_byte_signature_flip() {
        let payload = json!({"n": 1});
        let sig = compute_signature("e", &payload, "k");
        for i in 0..sig.len() {
            let mut bytes = sig.clone().into_bytes();
            bytes[i] = if bytes[i] == b'0' { b'1' } else { b'0' };
            let mutated = String::from_utf8(bytes).unwrap();
            assert!(!verify_signature(&mutated, "e", &payload, "k"), "flip at {} accepted", i);
        }
    }

    #[test]
    fn test_generated_secrets_are_unique_hex() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), SECRET_BYTES * 2);
        assert_ne!(a, b);
        assert!(hex::decode(&a).is_ok());
    }
}
