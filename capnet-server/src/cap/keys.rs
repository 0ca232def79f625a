//! Ed25519 signing and verification over canonicalized payloads, plus
//! the process-lifetime issuer keypair.
//!
//! Key and signature lengths are validated on entry: a wrong-length key
//! or signature is a structural failure, never a silent `false`.

use std::path::Path;

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use super::canonical::{self, CanonicalError, Domain};
use super::error::CapError;
use super::store;
use super::types::now_rfc3339;

pub const PUBKEY_LEN: usize = 32;
pub const SIG_LEN: usize = 64;
pub const KEYPAIR_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("{what} must be {expected} bytes, got {got}")]
    Length {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid key material: {0}")]
    Key(String),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

pub fn b64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn b64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(input)
}

/// Decode a base64 public key, insisting on exactly 32 bytes.
pub fn decode_pubkey(input: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = b64_decode(input)?;
    let arr: [u8; PUBKEY_LEN] = bytes.as_slice().try_into().map_err(|_| KeyError::Length {
        what: "public key",
        expected: PUBKEY_LEN,
        got: bytes.len(),
    })?;
    VerifyingKey::from_bytes(&arr).map_err(|e| KeyError::Key(e.to_string()))
}

/// Decode a base64 detached signature, insisting on exactly 64 bytes.
pub fn decode_signature(input: &str) -> Result<Signature, KeyError> {
    let bytes = b64_decode(input)?;
    let arr: [u8; SIG_LEN] = bytes.as_slice().try_into().map_err(|_| KeyError::Length {
        what: "signature",
        expected: SIG_LEN,
        got: bytes.len(),
    })?;
    Ok(Signature::from_bytes(&arr))
}

/// Detached signature over `canonicalize(domain, value)`, base64-encoded.
pub fn sign<T: Serialize>(
    value: &T,
    key: &SigningKey,
    domain: Domain,
) -> Result<String, KeyError> {
    let bytes = canonical::canonicalize(domain, value)?;
    Ok(b64_encode(&key.sign(&bytes).to_bytes()))
}

/// Verify a detached signature over `canonicalize(domain, value)`.
///
/// `Ok(false)` means the signature is well-formed but does not match;
/// malformed keys or signatures return `Err`.
pub fn verify<T: Serialize>(
    value: &T,
    sig_b64: &str,
    pubkey_b64: &str,
    domain: Domain,
) -> Result<bool, KeyError> {
    let verifying_key = decode_pubkey(pubkey_b64)?;
    let signature = decode_signature(sig_b64)?;
    let bytes = canonical::canonicalize(domain, value)?;
    Ok(verifying_key.verify(&bytes, &signature).is_ok())
}

// ─── Issuer keypair ──────────────────────────────────────────────────────────

/// On-disk record for the issuer keypair. Written once at generation.
#[derive(Debug, Serialize, Deserialize)]
struct IssuerKeyRecord {
    issuer_id: String,
    /// Base64 of the 64-byte Ed25519 keypair (seed plus public half).
    keypair: String,
    /// Base64 of the 32-byte public key, for convenience.
    pubkey: String,
    created_at: String,
}

/// The process's signing identity. Created on first start, loaded on
/// subsequent starts, never rotated by the core.
pub struct IssuerIdentity {
    pub issuer_id: String,
    pub signing_key: SigningKey,
}

impl IssuerIdentity {
    pub fn pubkey_b64(&self) -> String {
        b64_encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Load the keypair from `issuer_keys.json` under `dir`, generating
    /// and persisting a fresh one if the file does not exist yet.
    pub fn load_or_generate(dir: &Path) -> Result<Self, CapError> {
        let path = dir.join("issuer_keys.json");
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let record: IssuerKeyRecord = serde_json::from_str(&raw)
                .map_err(|e| CapError::StoreError(format!("issuer_keys.json: {e}")))?;
            let bytes = b64_decode(&record.keypair)
                .map_err(|e| CapError::StoreError(format!("issuer_keys.json keypair: {e}")))?;
            let arr: [u8; KEYPAIR_LEN] = bytes.as_slice().try_into().map_err(|_| {
                CapError::StoreError(format!(
                    "issuer_keys.json keypair must be {KEYPAIR_LEN} bytes, got {}",
                    bytes.len()
                ))
            })?;
            let signing_key = SigningKey::from_keypair_bytes(&arr)
                .map_err(|e| CapError::StoreError(format!("issuer_keys.json keypair: {e}")))?;
            tracing::debug!(issuer = %record.issuer_id, "loaded issuer keypair");
            return Ok(IssuerIdentity {
                issuer_id: record.issuer_id,
                signing_key,
            });
        }

        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let suffix: [u8; 4] = rand::random();
        let identity = IssuerIdentity {
            issuer_id: format!("issuer:capnet-{}", hex::encode(suffix)),
            signing_key,
        };
        let record = IssuerKeyRecord {
            issuer_id: identity.issuer_id.clone(),
            keypair: b64_encode(&identity.signing_key.to_keypair_bytes()),
            pubkey: identity.pubkey_b64(),
            created_at: now_rfc3339(),
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| CapError::StoreError(e.to_string()))?;
        store::write_atomic(&path, &json)?;
        tracing::info!(issuer = %record.issuer_id, "generated issuer keypair");
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_key() -> SigningKey {
        SigningKey::generate(&mut rand::rngs::OsRng)
    }

    #[test]
    fn test_sign_and_verify() {
        let key = test_key();
        let pubkey = b64_encode(key.verifying_key().as_bytes());
        let value = json!({"cap_id": "cap_1", "max": 5000});

        let sig = sign(&value, &key, Domain::CapDoc).unwrap();
        assert!(verify(&value, &sig, &pubkey, Domain::CapDoc).unwrap());
    }

    #[test]
    fn test_tampered_value_fails() {
        let key = test_key();
        let pubkey = b64_encode(key.verifying_key().as_bytes());
        let sig = sign(&json!({"max": 5000}), &key, Domain::CapDoc).unwrap();
        assert!(!verify(&json!({"max": 5001}), &sig, &pubkey, Domain::CapDoc).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = test_key();
        let other = b64_encode(test_key().verifying_key().as_bytes());
        let value = json!({"x": 1});
        let sig = sign(&value, &key, Domain::CapDoc).unwrap();
        assert!(!verify(&value, &sig, &other, Domain::CapDoc).unwrap());
    }

    #[test]
    fn test_cross_domain_signature_rejected() {
        let key = test_key();
        let pubkey = b64_encode(key.verifying_key().as_bytes());
        let value = json!({"receipt_id": "rcpt_1"});
        let sig = sign(&value, &key, Domain::Receipt).unwrap();
        assert!(!verify(&value, &sig, &pubkey, Domain::CapDoc).unwrap());
    }

    #[test]
    fn test_length_mismatch_is_error_not_false() {
        let key = test_key();
        let pubkey = b64_encode(key.verifying_key().as_bytes());
        let value = json!({"x": 1});

        let short_sig = b64_encode(&[0u8; 63]);
        assert!(matches!(
            verify(&value, &short_sig, &pubkey, Domain::CapDoc),
            Err(KeyError::Length { .. })
        ));

        let sig = sign(&value, &key, Domain::CapDoc).unwrap();
        let short_key = b64_encode(&[0u8; 31]);
        assert!(matches!(
            verify(&value, &sig, &short_key, Domain::CapDoc),
            Err(KeyError::Length { .. })
        ));
    }

    #[test]
    fn test_bad_base64_is_error() {
        let value = json!({"x": 1});
        let pubkey = b64_encode(&[0u8; 32]);
        assert!(verify(&value, "not-base64!!", &pubkey, Domain::CapDoc).is_err());
    }

    #[test]
    fn test_load_or_generate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let first = IssuerIdentity::load_or_generate(dir.path()).unwrap();
        let second = IssuerIdentity::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.issuer_id, second.issuer_id);
        assert_eq!(first.pubkey_b64(), second.pubkey_b64());
    }
}
