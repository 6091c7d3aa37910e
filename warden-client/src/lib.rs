//! Client-side license trust engine for Warden.
//!
//! This crate decides, under possibly hostile conditions — no network, a
//! tampered cache, an attached debugger, a proxied TLS connection — whether
//! a previously obtained entitlement is currently valid, and protects the
//! record and the channel that refreshes it.
//!
//! # Components
//!
//! - [`CertificateTrustVerifier`]: independent TLS leaf-fingerprint pinning,
//!   additive to standard chain validation
//! - [`ResponseVerifier`]: detached RSA signatures over canonical payloads,
//!   with replay-window enforcement
//! - [`CacheCryptoStore`]: encrypted-at-rest persistence of the record
//! - [`LicenseEngine`]: the validity state machine and its background
//!   reverification task
//! - [`SecureEngine`]: tamper/anti-analysis checks gating the engine's
//!   answer
//!
//! # Design Principles
//!
//! - **No hidden globals**: engines are explicit instances; construct one
//!   and inject it where needed
//! - **Boolean boundaries**: transport and crypto failures never escape the
//!   validity query path as errors; a denied license looks identical to
//!   callers regardless of cause
//! - **Defense in depth**: pinning, signatures and cache encryption each
//!   stand alone; disabling one never weakens another
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_client::{DeviceIdentity, EngineConfig, LicenseEngine, SecureEngine, TrustConfig};
//!
//! let config = EngineConfig::new("https://license.example.com", "app_key_123")
//!     .with_trust(TrustConfig::new().with_public_key(SERVER_PUBLIC_KEY_PEM));
//! let engine = LicenseEngine::new(config, DeviceIdentity::from_host())?;
//! engine.activate("XXXX-XXXX-XXXX-XXXX")?;
//!
//! let secure = SecureEngine::new(engine);
//! if secure.is_valid() {
//!     // unlock features
//! }
//! ```

mod cache;
mod config;
mod device;
mod engine;
mod error;
mod hardening;
mod pinning;
mod record;
mod signature;
mod transport;

pub use cache::{CacheCryptoStore, CacheMode};
pub use config::{EngineConfig, PinningMode, TrustConfig};
pub use device::{DeviceIdentity, DeviceInfo};
pub use engine::{LicenseEngine, LicenseState};
pub use error::{LicenseError, LicenseResult};
pub use hardening::{CheckRegistry, ClockWatermark, SecureEngine, SecurityCheckResult};
pub use pinning::{
    fetch_server_fingerprint, fingerprint_from_pem_file, normalize_fingerprint,
    CertificateTrustVerifier, PinCheck,
};
pub use record::EntitlementRecord;
pub use signature::{canonical_bytes, ResponseVerifier};
pub use transport::{AuthTransport, HttpTransport};
