//! Error types for the license engine.

use thiserror::Error;

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;

/// License engine errors.
///
/// Cryptographic and transport failures are recovered into boolean/optional
/// outcomes at the engine boundary; these variants are what the recovery
/// collapses from. Only [`LicenseError::InvalidPublicKey`] escapes a
/// constructor.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// The independent certificate check saw a different leaf than the pin.
    #[error("certificate fingerprint mismatch: expected {expected}, got {actual}")]
    CertificateTrust { expected: String, actual: String },

    /// Signature verification is required but no public key is configured.
    #[error("no public key configured to verify signature")]
    PublicKeyMissing,

    /// Signature verification is required but the response carries none.
    #[error("response is missing a signature")]
    SignatureMissing,

    /// The detached signature does not verify over the canonical payload.
    #[error("response signature invalid")]
    SignatureInvalid,

    /// The payload's issuance timestamp is outside the replay window.
    #[error("response signature outside replay window")]
    SignatureExpired,

    /// The configured public key PEM could not be parsed.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The server returned an application-level failure (`code != 0`).
    #[error("server rejected request: {0}")]
    Api(String),

    /// Transport-level failure (connect, TLS, read, decode).
    #[error("network error: {0}")]
    Network(String),

    /// Persisted cache could not be read or written.
    #[error("cache storage error: {0}")]
    Storage(String),

    /// A required request field is unavailable (e.g. email for a password
    /// change while logged out).
    #[error("missing account email")]
    MissingEmail,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
