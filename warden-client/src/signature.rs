//! Response integrity verification.
//!
//! Server responses carry a detached RSA signature over a canonical byte
//! encoding of the payload. Verification is a pure function: the caller
//! decides whether to discard or apply a payload that fails.
//!
//! Canonical form: the payload object minus its `signature` field,
//! serialized with keys in sorted order and minimal separators, UTF-8
//! encoded. This must match the byte sequence the server signed.

use crate::config::TrustConfig;
use crate::error::{LicenseError, LicenseResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Verifies detached signatures on server response payloads.
pub struct ResponseVerifier {
    public_key: Option<RsaPublicKey>,
    require_signature: bool,
    replay_window_secs: u64,
}

impl ResponseVerifier {
    /// Builds a verifier from trust configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::InvalidPublicKey`] if a key is configured but
    /// does not parse — a construction-time configuration error.
    pub fn from_trust(trust: &TrustConfig) -> LicenseResult<Self> {
        let public_key = match &trust.public_key_pem {
            Some(pem) => Some(
                RsaPublicKey::from_public_key_pem(pem)
                    .map_err(|e| LicenseError::InvalidPublicKey(e.to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            public_key,
            require_signature: trust.require_signature,
            replay_window_secs: trust.replay_window_secs,
        })
    }

    /// Returns true if a key is configured and signatures are enforced.
    pub fn is_enforcing(&self) -> bool {
        self.public_key.is_some() && self.require_signature
    }

    /// Verifies a payload's detached signature against the current clock.
    pub fn verify(&self, payload: &Map<String, Value>) -> LicenseResult<()> {
        self.verify_at(payload, chrono::Utc::now().timestamp())
    }

    /// Verifies a payload's detached signature at an explicit time.
    pub fn verify_at(&self, payload: &Map<String, Value>, now_unix: i64) -> LicenseResult<()> {
        let Some(public_key) = &self.public_key else {
            if self.require_signature {
                return Err(LicenseError::PublicKeyMissing);
            }
            return Ok(());
        };

        let signature = payload
            .get("signature")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        let Some(signature) = signature else {
            if self.require_signature {
                return Err(LicenseError::SignatureMissing);
            }
            return Ok(());
        };

        // Replay window runs before the cryptographic check: it is cheap and
        // rejects stale or future-dated payloads outright.
        if self.replay_window_secs > 0 {
            if let Some(issued_at) = payload.get("timestamp").and_then(Value::as_i64) {
                if now_unix.abs_diff(issued_at) > self.replay_window_secs {
                    return Err(LicenseError::SignatureExpired);
                }
            }
        }

        let canonical = canonical_bytes(payload);
        let sig_bytes = BASE64
            .decode(signature)
            .map_err(|_| LicenseError::SignatureInvalid)?;
        let digest = Sha256::digest(&canonical);

        public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &sig_bytes)
            .map_err(|_| LicenseError::SignatureInvalid)
    }
}

/// Produces the canonical byte encoding of a payload: `signature` excluded,
/// keys sorted at every level, minimal separators.
pub fn canonical_bytes(payload: &Map<String, Value>) -> Vec<u8> {
    let mut keys: Vec<&String> = payload.keys().filter(|k| *k != "signature").collect();
    keys.sort();

    let mut ordered = Map::new();
    for key in keys {
        ordered.insert(key.clone(), canonical_value(&payload[key.as_str()]));
    }

    // Map keys insert in sorted order, so serialization is deterministic
    // regardless of the map's backing representation.
    serde_json::to_vec(&Value::Object(ordered)).unwrap_or_default()
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut ordered = Map::new();
            for key in keys {
                ordered.insert(key.clone(), canonical_value(&map[key.as_str()]));
            }
            Value::Object(ordered)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_excludes_signature_and_sorts_keys() {
        let payload = match json!({
            "zeta": 1,
            "alpha": {"b": 2, "a": 1},
            "signature": "ignored",
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let bytes = canonical_bytes(&payload);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":{"a":1,"b":2},"zeta":1}"#
        );
    }

    #[test]
    fn canonical_is_minimal() {
        let payload = match json!({"valid": true, "features": ["a", "b"]}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let text = String::from_utf8(canonical_bytes(&payload)).unwrap();
        assert!(!text.contains(' '));
        assert!(!text.contains('\n'));
    }
}
