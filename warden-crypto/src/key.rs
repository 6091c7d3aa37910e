//! Key derivation for the entitlement cache.
//!
//! The cache key is derived from the device identity (as password) and the
//! application key (as salt material) with PBKDF2-HMAC-SHA256. Deriving from
//! the device identity binds the blob to the machine that wrote it.

use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of encryption keys in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the KDF salt in bytes.
pub const SALT_SIZE: usize = 16;

/// PBKDF2 iteration count for cache key derivation.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// A derived encryption key with automatic zeroization on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    /// Creates a derived key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derives an encryption key from a password and salt using PBKDF2-HMAC-SHA256.
pub fn derive_key(password: &str, salt: &[u8; SALT_SIZE], iterations: u32) -> DerivedKey {
    let mut key_bytes = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key_bytes);
    DerivedKey::from_bytes(key_bytes)
}

/// Derives the cache encryption key for a device/application pair.
///
/// Salt is the first [`SALT_SIZE`] bytes of SHA-256 over the application key,
/// so each application gets its own key space without storing a salt.
pub fn derive_cache_key(device_identity: &str, app_key: &str) -> DerivedKey {
    let digest = Sha256::digest(app_key.as_bytes());
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&digest[..SALT_SIZE]);
    derive_key(device_identity, &salt, PBKDF2_ITERATIONS)
}

/// Derives the keystream key for the XOR fallback mode.
///
/// SHA-256 over `device_identity ‖ app_key`. Unlike [`derive_cache_key`]
/// this is cheap by design: the fallback mode is obfuscation, not
/// confidentiality, and runs on targets where PBKDF2 cost is unwelcome.
pub fn stream_key(device_identity: &str, app_key: &str) -> DerivedKey {
    let mut hasher = Sha256::new();
    hasher.update(device_identity.as_bytes());
    hasher.update(app_key.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&digest);
    DerivedKey::from_bytes(bytes)
}
