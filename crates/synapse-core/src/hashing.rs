//! # Hashing
//!
//! Deterministic identifiers and content hashes.
//!
//! - [`derive_unique_id`] turns `(app, domain, name)` into a UUID-shaped id so
//!   an entity keeps its row across restarts without the application having
//!   to pick ids by hand.
//! - [`content_hash`] fingerprints the full entity dump; the hub compares it
//!   against its cached copy to detect configuration drift.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::Domain;

/// Derives a stable unique id for an entity that did not supply one.
///
/// The id is the first 16 bytes of `SHA-256("{app}|{domain}|{discriminator}")`
/// formatted as a UUID. `discriminator` is the suggested object id when
/// given, otherwise the entity name.
pub fn derive_unique_id(application: &str, domain: Domain, discriminator: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}|{}", application, domain, discriminator));
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// Hex SHA-256 of the canonical JSON encoding of `value`.
///
/// `serde_json` object maps are ordered by key, so equal dumps always encode
/// to the same bytes.
pub fn content_hash(value: &Value) -> String {
    format!("{:x}", Sha256::digest(value.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_derived_id_is_stable() {
        let a = derive_unique_id("home", Domain::Switch, "Kitchen Light");
        let b = derive_unique_id("home", Domain::Switch, "Kitchen Light");
        assert_eq!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_derived_id_depends_on_domain_and_app() {
        let switch = derive_unique_id("home", Domain::Switch, "Porch");
        let sensor = derive_unique_id("home", Domain::Sensor, "Porch");
        let other_app = derive_unique_id("garage", Domain::Switch, "Porch");
        assert_ne!(switch, sensor);
        assert_ne!(switch, other_app);
    }

    #[test]
    fn test_content_hash_ignores_insertion_order() {
        let mut first = serde_json::Map::new();
        first.insert("b".into(), json!(1));
        first.insert("a".into(), json!(2));
        let second = json!({ "a": 2, "b": 1 });

        assert_eq!(content_hash(&Value::Object(first)), content_hash(&second));
        assert_eq!(content_hash(&second).len(), 64);
    }

    #[test]
    fn test_content_hash_changes_with_content() {
        assert_ne!(content_hash(&json!({"is_on": true})), content_hash(&json!({"is_on": false})));
    }
}
