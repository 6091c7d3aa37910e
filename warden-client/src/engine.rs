//! The license state machine.
//!
//! Owns the entitlement record and its lifecycle: activation and login
//! create it, verify/heartbeat refresh it, deactivation destroys it. All
//! operations run synchronously on the caller's thread; one background task
//! per engine re-verifies periodically while a record exists.
//!
//! Failure policy: cryptographic and transport failures never escape the
//! validity query path as errors. `verify`, `heartbeat` and `is_valid`
//! answer with a plain bool; a denied license looks the same to callers
//! whether the cause was expiry, tampering or an unreachable server.

use crate::cache::{CacheCryptoStore, CacheMode};
use crate::config::EngineConfig;
use crate::device::{DeviceIdentity, DeviceInfo};
use crate::error::{LicenseError, LicenseResult};
use crate::record::EntitlementRecord;
use crate::signature::ResponseVerifier;
use crate::transport::{AuthTransport, HttpTransport};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sleep granularity of the background task; bounds shutdown latency.
const POLL_GRANULARITY: Duration = Duration::from_secs(1);

/// Lifecycle state of the entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseState {
    /// No persisted record (or the cache failed to decrypt).
    NoLicense,
    /// A record exists and the last check accepted it.
    Valid,
    /// Offline grace elapsed; a reverification round-trip is in flight.
    PendingReverify,
    /// The server rejected the entitlement or reverification failed.
    Invalid,
}

/// Cancellation signal shared with the background task. The wait is
/// condvar-based so shutdown interrupts a sleeping task immediately.
struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        *stopped = true;
        self.cv.notify_all();
    }

    fn is_signaled(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleeps up to `dur`; returns true if the stop signal fired.
    fn wait_timeout(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            stopped = self
                .cv
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }
}

struct EngineState {
    record: Option<EntitlementRecord>,
    lifecycle: LicenseState,
}

struct Inner {
    config: EngineConfig,
    device: DeviceIdentity,
    transport: Arc<dyn AuthTransport>,
    verifier: ResponseVerifier,
    cache: CacheCryptoStore,
    state: Mutex<EngineState>,
    stop: Arc<StopSignal>,
    reverify_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.signal();
    }
}

/// Handle to a license engine instance. Cheap to clone; all clones share
/// state. There is no process-wide default instance — construct one and
/// pass it to whoever needs it.
#[derive(Clone)]
pub struct LicenseEngine {
    inner: Arc<Inner>,
}

impl LicenseEngine {
    /// Constructs an engine with the production HTTPS transport.
    ///
    /// # Errors
    ///
    /// Construction fails on configuration errors only: an unparsable
    /// public key, an unreadable pinned certificate file, an unusable
    /// cache directory.
    pub fn new(config: EngineConfig, device: DeviceIdentity) -> LicenseResult<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, device, transport)
    }

    /// Constructs an engine over a caller-supplied transport. Used by tests
    /// and by hosts that tunnel requests through their own stack.
    pub fn with_transport(
        config: EngineConfig,
        device: DeviceIdentity,
        transport: Arc<dyn AuthTransport>,
    ) -> LicenseResult<Self> {
        let verifier = ResponseVerifier::from_trust(&config.trust)?;
        let mode = if config.encrypt_cache {
            CacheMode::Encrypted
        } else {
            CacheMode::Plain
        };
        let cache = CacheCryptoStore::open(config.cache_dir(), &config.app_key, &device, mode)?;

        let record = cache.load();
        let lifecycle = match &record {
            None => LicenseState::NoLicense,
            Some(r) if r.valid => LicenseState::Valid,
            Some(_) => LicenseState::Invalid,
        };
        let has_record = record.is_some();

        let engine = Self {
            inner: Arc::new(Inner {
                config,
                device,
                transport,
                verifier,
                cache,
                state: Mutex::new(EngineState { record, lifecycle }),
                stop: Arc::new(StopSignal::new()),
                reverify_task: Mutex::new(None),
            }),
        };

        if has_record {
            engine.spawn_reverify_task();
        }
        Ok(engine)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    // ── Activation lifecycle ─────────────────────────────────────

    /// Activates with a license key. On server acceptance the engine holds a
    /// fresh record with `last_verified_at = now`.
    pub fn activate(&self, license_key: &str) -> LicenseResult<EntitlementRecord> {
        let body = json!({
            "app_key": self.inner.config.app_key,
            "license_key": license_key,
            "machine_id": self.inner.device.as_str(),
            "device_info": DeviceInfo::collect(&self.inner.config.app_version),
        });
        let payload = self.inner.transport.post("/auth/activate", &body)?;
        self.inner.verifier.verify(&payload)?;

        let mut record = EntitlementRecord::from_fragment(&payload)?;
        record.license_key = Some(license_key.to_string());
        record.last_verified_at = Self::now();

        self.install_record(record.clone());
        Ok(record)
    }

    /// Logs in with account credentials. The password is pre-hashed client
    /// side so the cleartext never crosses the wire, even inside TLS.
    pub fn login(&self, email: &str, password: &str) -> LicenseResult<EntitlementRecord> {
        let body = json!({
            "app_key": self.inner.config.app_key,
            "email": email,
            "password": hash_password(password, email),
            "password_hashed": true,
            "machine_id": self.inner.device.as_str(),
            "device_info": DeviceInfo::collect(&self.inner.config.app_version),
        });
        let payload = self.inner.transport.post("/auth/login", &body)?;
        self.inner.verifier.verify(&payload)?;

        let mut record = EntitlementRecord::from_fragment(&payload)?;
        record.email = Some(email.to_string());
        record.last_verified_at = Self::now();

        self.install_record(record.clone());
        Ok(record)
    }

    fn install_record(&self, record: EntitlementRecord) {
        let mut state = self.lock();
        state.lifecycle = if record.valid {
            LicenseState::Valid
        } else {
            LicenseState::Invalid
        };
        state.record = Some(record);
        self.persist(&state);
        drop(state);
        self.spawn_reverify_task();
    }

    /// Registers a new account. No local state changes.
    pub fn register(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> LicenseResult<Map<String, Value>> {
        let body = json!({
            "app_key": self.inner.config.app_key,
            "email": email,
            "password": hash_password(password, email),
            "password_hashed": true,
            "name": name,
        });
        self.inner.transport.post("/auth/register", &body)
    }

    /// Changes the account password. Uses the logged-in email when none is
    /// given explicitly.
    pub fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
        email: Option<&str>,
    ) -> LicenseResult<Map<String, Value>> {
        let email = match email {
            Some(e) => e.to_string(),
            None => self
                .lock()
                .record
                .as_ref()
                .and_then(|r| r.email.clone())
                .ok_or(LicenseError::MissingEmail)?,
        };
        let body = json!({
            "app_key": self.inner.config.app_key,
            "old_password": hash_password(old_password, &email),
            "new_password": hash_password(new_password, &email),
            "password_hashed": true,
            "machine_id": self.inner.device.as_str(),
        });
        self.inner.transport.post("/auth/change-password", &body)
    }

    /// Releases this device's claim on the entitlement and clears all local
    /// state. Returns false if the server round-trip failed (local state is
    /// then left untouched).
    pub fn deactivate(&self) -> bool {
        let body = json!({
            "app_key": self.inner.config.app_key,
            "machine_id": self.inner.device.as_str(),
        });
        match self.inner.transport.post("/auth/deactivate", &body) {
            Ok(_) => {
                let mut state = self.lock();
                state.record = None;
                state.lifecycle = LicenseState::NoLicense;
                self.inner.cache.clear();
                true
            }
            Err(e) => {
                debug!(error = %e, "deactivation failed");
                false
            }
        }
    }

    // ── Reverification ───────────────────────────────────────────

    /// Round-trips to the server to re-verify the entitlement. Applies the
    /// returned record fragment and refreshes `last_verified_at`. Any
    /// failure — network, rejection, bad signature — yields false and moves
    /// the lifecycle to `Invalid`.
    pub fn verify(&self) -> bool {
        match self.verify_inner() {
            Ok(valid) => valid,
            Err(e) => {
                debug!(error = %e, "verification failed");
                let mut state = self.lock();
                if state.record.is_some() {
                    state.lifecycle = LicenseState::Invalid;
                }
                false
            }
        }
    }

    fn verify_inner(&self) -> LicenseResult<bool> {
        let body = json!({
            "app_key": self.inner.config.app_key,
            "machine_id": self.inner.device.as_str(),
        });
        let payload = self.inner.transport.post("/auth/verify", &body)?;
        self.inner.verifier.verify(&payload)?;

        let mut guard = self.lock();
        let state = &mut *guard;
        match &mut state.record {
            Some(record) => {
                record.apply_fragment(&payload)?;
                record.last_verified_at = Self::now();
                let valid = record.valid;
                state.lifecycle = if valid {
                    LicenseState::Valid
                } else {
                    LicenseState::Invalid
                };
                self.persist(state);
                Ok(valid)
            }
            None => Ok(payload
                .get("valid")
                .and_then(Value::as_bool)
                .unwrap_or(false)),
        }
    }

    /// Lightweight periodic check-in. Refreshes `last_verified_at` on
    /// success; failures are isolated and merely leave the record stale.
    pub fn heartbeat(&self) -> bool {
        let body = json!({
            "app_key": self.inner.config.app_key,
            "machine_id": self.inner.device.as_str(),
            "app_version": self.inner.config.app_version,
        });
        let payload = match self.inner.transport.post("/auth/heartbeat", &body) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "heartbeat failed");
                return false;
            }
        };
        if let Err(e) = self.inner.verifier.verify(&payload) {
            debug!(error = %e, "heartbeat response rejected");
            return false;
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(record) = &mut state.record else {
            return false;
        };
        record.last_verified_at = Self::now();
        let valid = payload
            .get("valid")
            .and_then(Value::as_bool)
            .unwrap_or(record.valid);
        if valid && state.lifecycle == LicenseState::PendingReverify {
            state.lifecycle = LicenseState::Valid;
        }
        self.persist(state);
        valid
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Answers whether the entitlement is currently trusted.
    ///
    /// Local checks only while inside the offline grace window; past the
    /// window this performs a synchronous reverification and answers with
    /// its result. Never errors, never panics.
    pub fn is_valid(&self) -> bool {
        let now = Self::now();
        let mut state = self.lock();
        let Some(record) = &state.record else {
            return false;
        };
        if !record.valid {
            return false;
        }
        if record.is_expired(now) {
            return false;
        }

        let offline_days = (now - record.last_verified_at) as f64 / 86400.0;
        if offline_days <= self.inner.config.offline_grace_days as f64 {
            return true;
        }

        // Grace elapsed: block on a real round-trip. A stopping engine
        // answers false instead of starting new network work.
        state.lifecycle = LicenseState::PendingReverify;
        drop(state);
        if self.inner.stop.is_signaled() {
            return false;
        }
        self.verify()
    }

    /// Returns true if the entitlement is valid and grants `name`.
    pub fn has_feature(&self, name: &str) -> bool {
        self.lock()
            .record
            .as_ref()
            .map(|r| r.has_feature(name))
            .unwrap_or(false)
    }

    /// Remaining days as last reported by the server.
    pub fn remaining_days(&self) -> i64 {
        self.lock()
            .record
            .as_ref()
            .map(|r| r.remaining_days)
            .unwrap_or(0)
    }

    /// A copy of the current entitlement record, if any.
    pub fn license_info(&self) -> Option<EntitlementRecord> {
        self.lock().record.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LicenseState {
        self.lock().lifecycle
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The transport handle, for collaborator modules that reuse the
    /// pinned channel for their own calls.
    pub fn transport(&self) -> Arc<dyn AuthTransport> {
        Arc::clone(&self.inner.transport)
    }

    /// Erases all entitlement state without a server round-trip and without
    /// surfacing a cause. The hardening layer calls this on a violation.
    pub(crate) fn invalidate_silently(&self) {
        let mut state = self.lock();
        state.record = None;
        state.lifecycle = LicenseState::NoLicense;
        self.inner.cache.clear();
    }

    /// Signals the background task and waits for it to exit. Shutdown
    /// latency is bounded by the poll granularity plus any in-flight
    /// request's timeout, not by the heartbeat interval.
    pub fn close(&self) {
        self.inner.stop.signal();
        let handle = self
            .inner
            .reverify_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    // ── Internals ────────────────────────────────────────────────

    /// Persists the current record. Best-effort: a failed write leaves the
    /// previous blob in place and the in-memory record authoritative.
    fn persist(&self, state: &EngineState) {
        if let Some(record) = &state.record {
            if let Err(e) = self.inner.cache.save(record) {
                warn!(error = %e, "failed to persist entitlement record");
            }
        }
    }

    /// Starts the periodic reverification task if not already running. The
    /// task holds only a weak reference so a dropped engine winds down on
    /// the next poll tick.
    fn spawn_reverify_task(&self) {
        let mut guard = self
            .inner
            .reverify_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if guard.is_some() || self.inner.stop.is_signaled() {
            return;
        }

        let stop = Arc::clone(&self.inner.stop);
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.heartbeat_interval;

        let handle = std::thread::Builder::new()
            .name("warden-reverify".to_string())
            .spawn(move || {
                let mut next_beat = Instant::now() + interval;
                loop {
                    if stop.wait_timeout(POLL_GRANULARITY) {
                        break;
                    }
                    if Instant::now() < next_beat {
                        continue;
                    }
                    next_beat = Instant::now() + interval;

                    let Some(inner) = weak.upgrade() else { break };
                    let engine = LicenseEngine { inner };
                    let has_record = engine.lock().record.is_some();
                    if has_record && !engine.heartbeat() {
                        warn!("periodic reverification failed; entitlement will go stale");
                    }
                }
            });

        match handle {
            Ok(handle) => *guard = Some(handle),
            Err(e) => warn!(error = %e, "could not start reverification task"),
        }
    }
}

/// Pre-hashes a password with the account email as salt, so the server
/// never sees cleartext and captured hashes don't transfer between
/// accounts.
fn hash_password(password: &str, email: &str) -> String {
    let salted = format!("{}:{}:license_salt_v1", password, email.to_lowercase());
    hex::encode(Sha256::digest(salted.as_bytes()))
}
