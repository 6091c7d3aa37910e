//! Encrypted-at-rest persistence for the entitlement record.
//!
//! One blob per application key, named to indicate the storage mode:
//! `<app_key>.enc` for encrypted records, `<app_key>.json` for plaintext.
//! The store never inspects record fields — it serializes, encrypts and
//! writes, and the reverse. Any failure on the read path is a cache miss,
//! never an error: a corrupt or tampered blob means "no record".

use crate::device::DeviceIdentity;
use crate::error::{LicenseError, LicenseResult};
use crate::record::EntitlementRecord;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use warden_crypto::{
    decrypt_string, deobfuscate, derive_cache_key, encrypt_string, obfuscate, stream_key,
    DerivedKey,
};

/// How records are protected on disk.
pub enum CacheMode {
    /// Plaintext JSON. Only for deployments that disable cache encryption.
    Plain,
    /// ChaCha20-Poly1305 under a PBKDF2-derived key. The read path also
    /// accepts XOR-mode blobs so mixed-mode histories stay readable.
    Encrypted,
    /// Keyed XOR stream. Obfuscation only, for targets without an AEAD
    /// primitive.
    Obfuscated,
}

enum Keys {
    None,
    Derived { aead: DerivedKey, xor: DerivedKey },
}

/// Stores the serialized entitlement record, scoped per application key.
pub struct CacheCryptoStore {
    dir: PathBuf,
    app_key: String,
    mode: CacheMode,
    keys: Keys,
}

impl CacheCryptoStore {
    /// Opens (and creates if needed) the store directory and derives the
    /// cache keys. Key derivation is deliberately slow (PBKDF2, 100k
    /// iterations) and happens once here.
    pub fn open(
        dir: impl Into<PathBuf>,
        app_key: &str,
        device: &DeviceIdentity,
        mode: CacheMode,
    ) -> LicenseResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| LicenseError::Storage(format!("cannot create cache dir: {}", e)))?;

        let keys = match mode {
            CacheMode::Plain => Keys::None,
            CacheMode::Encrypted | CacheMode::Obfuscated => Keys::Derived {
                aead: derive_cache_key(device.as_str(), app_key),
                xor: stream_key(device.as_str(), app_key),
            },
        };

        Ok(Self {
            dir,
            app_key: app_key.to_string(),
            mode,
            keys,
        })
    }

    /// Path of the current-mode blob.
    pub fn path(&self) -> PathBuf {
        let suffix = match self.mode {
            CacheMode::Plain => ".json",
            CacheMode::Encrypted | CacheMode::Obfuscated => ".enc",
        };
        self.dir.join(format!("{}{}", self.app_key, suffix))
    }

    /// Path a legacy plaintext blob would occupy.
    fn legacy_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.app_key))
    }

    /// Loads the persisted record, or `None` on any miss: absent file,
    /// undecryptable blob, unparsable JSON. A blob that fails to decode is
    /// deleted so the next load is a clean miss.
    pub fn load(&self) -> Option<EntitlementRecord> {
        let path = self.path();
        match fs::read_to_string(&path) {
            Ok(content) => match self.decode(&content) {
                Some(record) => Some(record),
                None => {
                    debug!(path = %path.display(), "cache blob unreadable; discarding");
                    let _ = fs::remove_file(&path);
                    None
                }
            },
            Err(_) => self.migrate_legacy(),
        }
    }

    fn decode(&self, content: &str) -> Option<EntitlementRecord> {
        let json = match (&self.mode, &self.keys) {
            (CacheMode::Plain, _) => content.to_string(),
            (_, Keys::Derived { aead, xor }) => decrypt_string(aead, content)
                .or_else(|_| deobfuscate(xor, content))
                .ok()?,
            (_, Keys::None) => return None,
        };
        serde_json::from_str(&json).ok()
    }

    /// Migrates a legacy plaintext record into the current mode, deleting
    /// the plaintext artifact afterwards.
    fn migrate_legacy(&self) -> Option<EntitlementRecord> {
        if matches!(self.mode, CacheMode::Plain) {
            return None;
        }
        let legacy = self.legacy_path();
        let content = fs::read_to_string(&legacy).ok()?;
        let record: EntitlementRecord = serde_json::from_str(&content).ok()?;
        if self.save(&record).is_ok() {
            let _ = fs::remove_file(&legacy);
            info!("migrated plaintext entitlement cache to encrypted storage");
            Some(record)
        } else {
            None
        }
    }

    /// Serializes and writes the record, replacing the blob atomically.
    pub fn save(&self, record: &EntitlementRecord) -> LicenseResult<()> {
        let json = serde_json::to_string(record)?;
        let content = match (&self.mode, &self.keys) {
            (CacheMode::Plain, _) => json,
            (CacheMode::Encrypted, Keys::Derived { aead, .. }) => encrypt_string(aead, &json)
                .map_err(|e| LicenseError::Storage(e.to_string()))?,
            (CacheMode::Obfuscated, Keys::Derived { xor, .. }) => obfuscate(xor, &json),
            _ => return Err(LicenseError::Storage("cache keys unavailable".to_string())),
        };
        write_atomic(&self.path(), content.as_bytes())
    }

    /// Removes the blob (and any legacy artifact).
    pub fn clear(&self) {
        let _ = fs::remove_file(self.path());
        let _ = fs::remove_file(self.legacy_path());
    }
}

/// Write-then-rename so a crash mid-write leaves either the old blob or a
/// stray temp file, never a half-written record at the load path.
fn write_atomic(path: &Path, data: &[u8]) -> LicenseResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).map_err(|e| LicenseError::Storage(format!("cache write: {}", e)))?;
    fs::rename(&tmp, path).map_err(|e| LicenseError::Storage(format!("cache rename: {}", e)))
}
