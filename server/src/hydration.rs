//! Hydration & Identity. Covers id generation/validation, fingerprint computation,
//! and `onX` / `on-x` event-name canonicalization, accepting either inbound and emitting
//! the canonical kebab-case form outbound.

use serde_json::Value as Json;
use sha2::{Digest, Sha256};

/// `^[A-Za-z0-9_-]{8,64}$`.
pub fn is_valid_client_id(id: &str) -> bool {
    (8..=64).contains(&id.len())
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A fresh server-generated 128-bit id, hex-encoded. `Uuid::new_v4().simple()` yields
/// exactly 32 lowercase hex characters, which also satisfies the client-id regex above.
pub fn generate_server_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Canonical JSON serialization used as fingerprint input. Relies on
/// `serde_json`'s default (non-`preserve_order`) `Value::Object`, which
/// is a `BTreeMap` and therefore serializes keys in sorted order —
/// this is what makes the same props produce the same fingerprint
/// regardless of the order a client assembled them in.
pub fn canonical_json(value: &Json) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// SHA-256 over `(typeName, canonicalJSON(props), schemaVersion)`,
/// truncated to 16 bytes and hex-encoded.
pub fn fingerprint(type_name: &str, props: &Json, schema_version: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(type_name.as_bytes());
    hasher.update(0u8.to_be_bytes()); // separator, avoids "ab"+"c" == "a"+"bc" collisions
    hasher.update(canonical_json(props).as_bytes());
    hasher.update(schema_version.to_be_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Canonicalize an inbound event-handler name. Both `onX` and `on-x`
/// inbound spellings are accepted; the canonical outbound form is
/// always kebab-case.
pub fn canonical_event_name(raw: &str) -> String {
    if raw.contains('-') {
        return raw.to_ascii_lowercase();
    }
    camel_to_kebab(raw)
}

fn camel_to_kebab(s: &str) -> String {
    let mut out = String::new();
    for (i, ch) in s.chars().enumerate() {
        if ch.is_uppercase() {
            if i != 0 {
                out.push('-');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validates_client_id_length_and_charset() {
        assert!(is_valid_client_id("abcdefgh"));
        assert!(is_valid_client_id("abc_DEF-123"));
        assert!(!is_valid_client_id("short"));
        assert!(!is_valid_client_id("has spaces here"));
        assert!(!is_valid_client_id(&"a".repeat(65)));
    }

    #[test]
    fn server_id_is_valid_and_unique() {
        let a = generate_server_id();
        let b = generate_server_id();
        assert!(is_valid_client_id(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_stable_across_key_order() {
        let props_a = json!({"initial": 5, "label": "x"});
        let props_b = json!({"label": "x", "initial": 5});
        assert_eq!(
            fingerprint("Counter", &props_a, 1),
            fingerprint("Counter", &props_b, 1)
        );
    }

    #[test]
    fn fingerprint_changes_with_schema_version() {
        let props = json!({"initial": 5});
        assert_ne!(
            fingerprint("Counter", &props, 1),
            fingerprint("Counter", &props, 2)
        );
    }

    #[test]
    fn canonicalizes_onx_and_on_dash_x_to_same_name() {
        assert_eq!(canonical_event_name("onUploadComplete"), "on-upload-complete");
        assert_eq!(canonical_event_name("on-upload-complete"), "on-upload-complete");
        assert_eq!(canonical_event_name("On-Upload-Complete"), "on-upload-complete");
    }
}
