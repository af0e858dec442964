//! Signs NIP-42 AUTH events for upstream challenge-response.
//!
//! The core only ever originates AUTH toward upstream peers, never toward
//! its own clients (see `registry`'s acquire/authenticate path).

use k256::schnorr::signature::Signer;
use k256::schnorr::SigningKey;
use sha2::{Digest, Sha256};

use crate::error::CoreError;
use crate::model::{Event, Tag};

/// Derives the hex-encoded public key for a raw secret key, for filling
/// in `RELAY_PUBKEY` when the operator only configured `RELAY_SECKEY`.
pub fn derive_pubkey(seckey: &[u8; 32]) -> Result<String, CoreError> {
    let signing_key = SigningKey::from_bytes(seckey).map_err(|e| CoreError::Internal(format!("invalid signing key: {e}")))?;
    Ok(hex::encode(signing_key.verifying_key().to_bytes()))
}

/// Builds and signs a kind-22242 AUTH event carrying `relay` and
/// `challenge` tags, per NIP-42.
pub fn build_auth_event(seckey: &[u8; 32], relay_url: &str, challenge: &str) -> Result<Event, CoreError> {
    let signing_key = SigningKey::from_bytes(seckey).map_err(|e| CoreError::Internal(format!("invalid signing key: {e}")))?;
    let pubkey = hex::encode(signing_key.verifying_key().to_bytes());

    let created_at = chrono::Utc::now().timestamp();
    let tags = vec![
        Tag(vec!["relay".to_string(), relay_url.to_string()]),
        Tag(vec!["challenge".to_string(), challenge.to_string()]),
    ];

    let unsigned = UnsignedForId {
        pubkey: &pubkey,
        created_at,
        kind: 22242,
        tags: &tags,
        content: "",
    };
    let id = event_id(&unsigned)?;

    let sig_bytes = signing_key.sign(id_bytes(&id)?.as_slice());
    let sig = hex::encode(sig_bytes.to_bytes());

    Ok(Event {
        id: id.into(),
        pubkey,
        created_at,
        kind: 22242,
        tags,
        content: String::new(),
        sig,
    })
}

struct UnsignedForId<'a> {
    pubkey: &'a str,
    created_at: i64,
    kind: u32,
    tags: &'a [Tag],
    content: &'a str,
}

/// NIP-01 event ID: lowercase-hex SHA-256 of the canonical serialization
/// `[0, pubkey, created_at, kind, tags, content]`.
fn event_id(unsigned: &UnsignedForId<'_>) -> Result<String, CoreError> {
    let tags: Vec<&Vec<String>> = unsigned.tags.iter().map(|t| &t.0).collect();
    let canonical = serde_json::to_string(&(
        0,
        unsigned.pubkey,
        unsigned.created_at,
        unsigned.kind,
        tags,
        unsigned.content,
    ))
    .map_err(|e| CoreError::Internal(format!("canonical serialization failed: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn id_bytes(id: &str) -> Result<Vec<u8>, CoreError> {
    hex::decode(id).map_err(|e| CoreError::Internal(format!("invalid event id hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_pubkey_matches_build_auth_event() {
        let seckey = [7u8; 32];
        let pubkey = derive_pubkey(&seckey).unwrap();
        let event = build_auth_event(&seckey, "wss://relay.example", "abc123").unwrap();
        assert_eq!(pubkey, event.pubkey);
    }

    #[test]
    fn build_auth_event_has_expected_shape() {
        let seckey = [7u8; 32];
        let event = build_auth_event(&seckey, "wss://relay.example", "abc123").unwrap();
        assert_eq!(event.kind, 22242);
        assert_eq!(event.content, "");
        assert_eq!(event.tag_value("relay"), Some("wss://relay.example"));
        assert_eq!(event.tag_value("challenge"), Some("abc123"));
        assert_eq!(event.id.0.len(), 64);
        assert_eq!(event.sig.len(), 128);
    }

    #[test]
    fn same_inputs_produce_same_id() {
        let seckey = [7u8; 32];
        let a = build_auth_event(&seckey, "wss://relay.example", "xyz").unwrap();
        // created_at differs between calls in real time but within the same
        // call id derivation is deterministic given identical fields.
        let unsigned = UnsignedForId {
            pubkey: &a.pubkey,
            created_at: a.created_at,
            kind: a.kind,
            tags: &a.tags,
            content: &a.content,
        };
        assert_eq!(event_id(&unsigned).unwrap(), a.id.0);
    }
}
