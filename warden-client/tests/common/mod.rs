//! Shared test helpers for the license engine tests.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Mutex;
use warden_client::{
    canonical_bytes, AuthTransport, DeviceIdentity, EngineConfig, LicenseError, LicenseResult,
};

/// Generates an RSA keypair and the public half as PKCS#8 PEM.
pub fn test_rsa_keypair() -> (RsaPrivateKey, String) {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate RSA key");
    let pem = private
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .expect("encode public key");
    (private, pem)
}

/// Signs a payload's canonical bytes and returns the base64 signature.
pub fn sign_payload(private: &RsaPrivateKey, payload: &Map<String, Value>) -> String {
    let digest = Sha256::digest(canonical_bytes(payload));
    let signature = private
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .expect("sign payload");
    BASE64.encode(signature)
}

/// Builds a payload object from a JSON literal and signs it in place.
pub fn signed_payload(private: &RsaPrivateKey, value: Value) -> Map<String, Value> {
    let mut payload = as_object(value);
    let signature = sign_payload(private, &payload);
    payload.insert("signature".to_string(), Value::String(signature));
    payload
}

/// Unwraps a JSON literal into its object form.
pub fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected a JSON object"),
    }
}

/// In-memory transport with scripted responses. Records every call so tests
/// can assert that grace-period reads stay off the network.
pub struct FakeTransport {
    responses: Mutex<VecDeque<LicenseResult<Map<String, Value>>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Enqueues a successful response payload.
    pub fn push_ok(&self, value: Value) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(as_object(value)));
    }

    /// Enqueues a failure.
    pub fn push_err(&self, error: LicenseError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Endpoints hit so far, in order.
    pub fn endpoints(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// The body of the nth call.
    pub fn call_body(&self, index: usize) -> Value {
        self.calls.lock().unwrap()[index].1.clone()
    }
}

impl AuthTransport for FakeTransport {
    fn post(&self, endpoint: &str, body: &Value) -> LicenseResult<Map<String, Value>> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.to_string(), body.clone()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LicenseError::Network("no scripted response".to_string())))
    }
}

/// Engine config pointing at a throwaway cache dir. The server URL is inert
/// — tests use [`FakeTransport`].
pub fn test_config(cache_dir: &std::path::Path) -> EngineConfig {
    EngineConfig::new("https://127.0.0.1:9", "test_app_key").with_cache_dir(cache_dir)
}

/// A stable device identity for tests.
pub fn test_device() -> DeviceIdentity {
    DeviceIdentity::new("test-device-0001")
}
