//! Cache encryption for Warden.
//!
//! This crate holds the cryptographic primitives used to protect the
//! entitlement cache at rest:
//! - Key derivation from device identity + application key (PBKDF2-SHA256)
//! - Authenticated encryption via ChaCha20-Poly1305
//! - A keyed XOR stream fallback for environments without AEAD support
//!
//! # Design Principles
//!
//! - **Device binding**: keys are derived from the device identity, so a
//!   copied cache blob does not decrypt on another machine
//! - **Tamper evidence**: the primary mode is authenticated; any bit flip
//!   fails decryption outright
//! - **Fallback is obfuscation only**: the XOR mode carries no integrity or
//!   confidentiality guarantee and exists solely for constrained targets
//!
//! Callers that need mixed-mode reads should attempt [`decrypt`] first and
//! fall back to [`deobfuscate`] on failure, so blobs written under either
//! mode remain readable.

mod cipher;
mod error;
mod key;

pub use cipher::{
    decrypt, decrypt_string, deobfuscate, encrypt, encrypt_string, obfuscate, EncryptedData,
    NONCE_SIZE, TAG_SIZE,
};
pub use error::{CryptoError, CryptoResult};
pub use key::{derive_cache_key, derive_key, stream_key, DerivedKey, KEY_SIZE, PBKDF2_ITERATIONS, SALT_SIZE};
