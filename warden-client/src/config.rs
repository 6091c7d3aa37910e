//! Engine configuration.
//!
//! All configuration is immutable after construction. The pinning mode is an
//! enum so "exactly one of fingerprint / CA file / skip" holds by
//! construction rather than by runtime validation.

use std::path::PathBuf;
use std::time::Duration;

/// How the transport decides which server certificates to trust, beyond
/// standard chain validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PinningMode {
    /// No pinning. Standard chain validation only.
    #[default]
    Disabled,
    /// Pin to a SHA-256 fingerprint of the server's leaf certificate.
    /// Accepted formats: `"SHA256:AB:CD:..."`, `"AB:CD:..."` or bare hex.
    Fingerprint(String),
    /// Pin to the certificate(s) in a PEM file; the expected fingerprint is
    /// computed from the first certificate in the file.
    CaFile(PathBuf),
    /// Disable chain validation AND pinning. Test environments only — never
    /// ship a build that sets this.
    SkipVerification,
}

impl PinningMode {
    /// Returns true if this mode performs an independent fingerprint check.
    pub fn is_pinned(&self) -> bool {
        matches!(self, Self::Fingerprint(_) | Self::CaFile(_))
    }
}

/// Trust configuration: pinning and response-signature policy.
#[derive(Debug, Clone)]
pub struct TrustConfig {
    /// Certificate pinning mode.
    pub pinning: PinningMode,
    /// Server RSA public key (PEM) for response signature verification.
    pub public_key_pem: Option<String>,
    /// Reject responses without a valid signature. Implied by setting
    /// `public_key_pem` via [`TrustConfig::with_public_key`].
    pub require_signature: bool,
    /// Replay window in seconds for signed payload timestamps. 0 disables
    /// the check. Default 300.
    pub replay_window_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustConfig {
    /// Default trust config: no pinning, no signature requirement, 5 minute
    /// replay window.
    pub fn new() -> Self {
        Self {
            pinning: PinningMode::Disabled,
            public_key_pem: None,
            require_signature: false,
            replay_window_secs: 300,
        }
    }

    /// Sets the server public key and turns on signature enforcement.
    #[must_use]
    pub fn with_public_key(mut self, pem: impl Into<String>) -> Self {
        self.public_key_pem = Some(pem.into());
        self.require_signature = true;
        self
    }

    /// Sets the pinning mode.
    #[must_use]
    pub fn with_pinning(mut self, pinning: PinningMode) -> Self {
        self.pinning = pinning;
        self
    }

    /// Sets the replay window (seconds). 0 disables the timestamp check.
    #[must_use]
    pub fn with_replay_window(mut self, secs: u64) -> Self {
        self.replay_window_secs = secs;
        self
    }
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Server base URL, e.g. `https://license.example.com:8443`.
    pub server_url: String,
    /// Application key identifying this product.
    pub app_key: String,
    /// Cache directory. Defaults to `~/.warden_cache`.
    pub cache_dir: Option<PathBuf>,
    /// Encrypt the persisted entitlement record. Default true.
    pub encrypt_cache: bool,
    /// Heartbeat interval for the background reverification task.
    pub heartbeat_interval: Duration,
    /// Offline grace period in days.
    pub offline_grace_days: i64,
    /// Application version reported with heartbeats.
    pub app_version: String,
    /// Request timeout, also bounds the certificate probe.
    pub timeout: Duration,
    /// Trust settings.
    pub trust: TrustConfig,
}

impl EngineConfig {
    /// Creates a config with the defaults the server-side SDK documents:
    /// hourly heartbeat, 7 day grace, 30 second timeout, encrypted cache.
    pub fn new(server_url: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            app_key: app_key.into(),
            cache_dir: None,
            encrypt_cache: true,
            heartbeat_interval: Duration::from_secs(3600),
            offline_grace_days: 7,
            app_version: "1.0.0".to_string(),
            timeout: Duration::from_secs(30),
            trust: TrustConfig::new(),
        }
    }

    /// Resolved cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".warden_cache")
        })
    }

    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_trust(mut self, trust: TrustConfig) -> Self {
        self.trust = trust;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_offline_grace_days(mut self, days: i64) -> Self {
        self.offline_grace_days = days;
        self
    }

    #[must_use]
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }
}
