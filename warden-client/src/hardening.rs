//! Tamper and anti-analysis hardening.
//!
//! A registry of named boolean checks gates trust in the state machine's
//! answer: executable integrity, clock rollback, debugger and hostile
//! environment heuristics. Checks run in registration order and
//! short-circuit on the first failure.
//!
//! On a violation the entitlement cache is erased and the engine forced to
//! `NoLicense`, with no distinguishing error surfaced to the caller.
//! Heuristic categories require at least two corroborating indicators
//! before flagging.

use crate::engine::LicenseEngine;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;
use warden_crypto::{decrypt_string, encrypt_string, DerivedKey};

/// Re-run the full check every Nth `is_valid` call.
const DEFAULT_FULL_CHECK_EVERY: u64 = 10;

/// Or when this many seconds have passed since the last full check.
const DEFAULT_COOLDOWN_SECS: i64 = 300;

/// Allowed backwards clock drift before rollback is flagged (seconds).
const CLOCK_TOLERANCE_SECS: i64 = 300;

/// A named check outcome. Ephemeral — produced per full check, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityCheckResult {
    /// Check name, e.g. `"integrity"`, `"clock"`, `"debugger"`.
    pub name: String,
    /// Whether the check passed.
    pub passed: bool,
}

type Probe = Box<dyn Fn() -> bool + Send + Sync>;

/// Ordered registry of named security checks.
#[derive(Default)]
pub struct CheckRegistry {
    probes: Vec<(String, Probe)>,
    last_results: Mutex<Vec<SecurityCheckResult>>,
}

impl CheckRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a named check. Checks run in registration order.
    pub fn register(&mut self, name: impl Into<String>, probe: impl Fn() -> bool + Send + Sync + 'static) {
        self.probes.push((name.into(), Box::new(probe)));
    }

    /// Runs every check in order, short-circuiting on the first failure.
    /// Returns true only if all pass.
    pub fn validate_all(&self) -> bool {
        let mut results = Vec::with_capacity(self.probes.len());
        let mut all_passed = true;
        for (name, probe) in &self.probes {
            let passed = probe();
            results.push(SecurityCheckResult {
                name: name.clone(),
                passed,
            });
            if !passed {
                all_passed = false;
                break;
            }
        }
        *self.last_results.lock().unwrap_or_else(|e| e.into_inner()) = results;
        all_passed
    }

    /// Outcomes from the most recent [`validate_all`](Self::validate_all).
    pub fn last_results(&self) -> Vec<SecurityCheckResult> {
        self.last_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Compact token over the last outcomes plus a timestamp, for optional
    /// server-side reporting.
    pub fn audit_token(&self) -> String {
        let results = self.last_results();
        let bits: String = results
            .iter()
            .map(|r| if r.passed { '1' } else { '0' })
            .collect();
        let combined = format!("{}:{}", bits, chrono::Utc::now().timestamp());
        let digest = Sha256::digest(combined.as_bytes());
        hex::encode(digest)[..32].to_string()
    }
}

/// Hardened facade over the license engine. Collaborators query validity
/// through this layer; it periodically re-runs the security checks and
/// silently invalidates on a violation.
pub struct SecureEngine {
    engine: LicenseEngine,
    registry: CheckRegistry,
    full_check_every: u64,
    cooldown_secs: i64,
    check_count: AtomicU64,
    last_full_check: AtomicI64,
}

impl SecureEngine {
    /// Wraps an engine with the default check set: executable integrity,
    /// clock rollback, debugger heuristics, environment heuristics.
    pub fn new(engine: LicenseEngine) -> Self {
        let mut registry = CheckRegistry::new();

        let integrity = IntegrityBaseline::capture();
        registry.register("integrity", move || integrity.verify());

        let watermark = ClockWatermark::new(engine.config().cache_dir().join(".time_check"));
        registry.register("clock", move || watermark.check());

        registry.register("debugger", || !corroborated(&debugger_indicators()));
        registry.register("environment", || !corroborated(&environment_indicators()));

        Self::with_registry(engine, registry)
    }

    /// Wraps an engine with a caller-assembled registry. Hosts add their own
    /// checks (or drop heuristics that misfire in their fleet) this way.
    pub fn with_registry(engine: LicenseEngine, registry: CheckRegistry) -> Self {
        Self {
            engine,
            registry,
            full_check_every: DEFAULT_FULL_CHECK_EVERY,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            check_count: AtomicU64::new(0),
            last_full_check: AtomicI64::new(0),
        }
    }

    /// Overrides the full-check cadence.
    #[must_use]
    pub fn with_cadence(mut self, every_nth_call: u64, cooldown_secs: i64) -> Self {
        self.full_check_every = every_nth_call.max(1);
        self.cooldown_secs = cooldown_secs;
        self
    }

    /// Appends an additional named check.
    pub fn register_probe(
        &mut self,
        name: impl Into<String>,
        probe: impl Fn() -> bool + Send + Sync + 'static,
    ) {
        self.registry.register(name, probe);
    }

    /// Validity query gated by the security checks.
    ///
    /// Cheap calls reuse the last full-check outcome; a full check re-runs
    /// every Nth call or once the cooldown elapses. A violation erases the
    /// cache and answers false — indistinguishable from an ordinary
    /// invalid license.
    pub fn is_valid(&self) -> bool {
        let count = self.check_count.fetch_add(1, Ordering::Relaxed) + 1;
        let now = chrono::Utc::now().timestamp();
        let last = self.last_full_check.load(Ordering::Relaxed);

        if count % self.full_check_every == 0 || now - last >= self.cooldown_secs {
            if !self.run_full_check() {
                return false;
            }
            self.last_full_check.store(now, Ordering::Relaxed);
        }

        self.engine.is_valid()
    }

    fn run_full_check(&self) -> bool {
        if self.registry.validate_all() {
            return true;
        }
        debug!("security check failed; entitlement state cleared");
        self.engine.invalidate_silently();
        false
    }

    /// Forces a full check immediately, applying violation handling.
    pub fn full_check(&self) -> bool {
        let passed = self.run_full_check();
        if passed {
            self.last_full_check
                .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        }
        passed
    }

    /// Feature query gated the same way as [`is_valid`](Self::is_valid).
    pub fn has_feature(&self, name: &str) -> bool {
        self.is_valid() && self.engine.has_feature(name)
    }

    /// Remaining days, or 0 when the entitlement is not currently trusted.
    pub fn remaining_days(&self) -> i64 {
        if self.is_valid() {
            self.engine.remaining_days()
        } else {
            0
        }
    }

    /// Audit token over the most recent check outcomes.
    pub fn audit_token(&self) -> String {
        self.registry.audit_token()
    }

    /// The underlying engine, for lifecycle operations and the shared
    /// transport handle.
    pub fn engine(&self) -> &LicenseEngine {
        &self.engine
    }
}

/// True when at least two independent indicators corroborate.
fn corroborated(indicators: &[&'static str]) -> bool {
    indicators.len() >= 2
}

// ── Executable integrity ─────────────────────────────────────────

/// SHA-256 of the running executable, captured at construction and
/// recomputed on each check.
struct IntegrityBaseline {
    baseline: Option<String>,
}

impl IntegrityBaseline {
    fn capture() -> Self {
        Self {
            baseline: executable_hash(),
        }
    }

    /// Passes when the executable still hashes to the baseline. If the
    /// baseline could not be captured the check degrades to passing — the
    /// remaining checks still gate the answer.
    fn verify(&self) -> bool {
        match &self.baseline {
            Some(baseline) => executable_hash().as_ref() == Some(baseline),
            None => true,
        }
    }
}

fn executable_hash() -> Option<String> {
    let path = std::env::current_exe().ok()?;
    let data = std::fs::read(path).ok()?;
    Some(hex::encode(Sha256::digest(&data)))
}

// ── Clock rollback ───────────────────────────────────────────────

/// Persisted monotonically increasing wall-clock watermark. A current time
/// more than the tolerance behind the watermark flags rollback.
pub struct ClockWatermark {
    path: PathBuf,
    key: DerivedKey,
    last_seen: Mutex<i64>,
}

impl ClockWatermark {
    /// Opens the watermark file, recovering the highest previously observed
    /// time. A corrupt or tampered file is discarded.
    pub fn new(path: PathBuf) -> Self {
        let key = host_clock_key();
        let now = chrono::Utc::now().timestamp();
        let mut last_seen = now;
        if let Ok(content) = std::fs::read_to_string(&path) {
            match Self::decode(&key, &content) {
                Some(stored) if stored > last_seen => last_seen = stored,
                Some(_) => {}
                None => {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        Self {
            path,
            key,
            last_seen: Mutex::new(last_seen),
        }
    }

    /// Checks the current wall clock against the watermark.
    pub fn check(&self) -> bool {
        self.check_at(chrono::Utc::now().timestamp())
    }

    /// Checks an explicit time against the watermark, advancing it when the
    /// clock moved forward.
    pub fn check_at(&self, now: i64) -> bool {
        let mut last = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        if now < *last - CLOCK_TOLERANCE_SECS {
            return false;
        }
        if now > *last {
            *last = now;
        }
        self.store(*last);
        true
    }

    fn store(&self, watermark: i64) {
        if let Some(dir) = self.path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let plain = format!("{}:{}", watermark, Self::checksum(watermark));
        if let Ok(blob) = encrypt_string(&self.key, &plain) {
            let _ = std::fs::write(&self.path, blob);
        }
    }

    fn decode(key: &DerivedKey, content: &str) -> Option<i64> {
        let plain = decrypt_string(key, content).ok()?;
        let (ts, checksum) = plain.split_once(':')?;
        let ts: i64 = ts.parse().ok()?;
        if checksum != Self::checksum(ts) {
            return None;
        }
        Some(ts)
    }

    fn checksum(watermark: i64) -> String {
        let digest = Sha256::digest(format!("{}:warden-time-integrity", watermark).as_bytes());
        hex::encode(&digest[..8])
    }
}

/// Key for the watermark file, derived from host characteristics so the
/// file does not transfer between machines.
fn host_clock_key() -> DerivedKey {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let digest = Sha256::digest(format!("{}:warden-clock-v1", host).as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    DerivedKey::from_bytes(bytes)
}

// ── Debugger heuristics ──────────────────────────────────────────

/// Names of the debugger indicators that currently fire.
fn debugger_indicators() -> Vec<&'static str> {
    let mut fired = Vec::new();
    if tracer_attached() {
        fired.push("tracer_pid");
    }
    if debug_env_present() {
        fired.push("debug_env");
    }
    if timing_anomaly() {
        fired.push("timing");
    }
    fired
}

/// Linux: a nonzero `TracerPid` in `/proc/self/status` means ptrace is
/// attached.
fn tracer_attached() -> bool {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(pid) = line.strip_prefix("TracerPid:") {
                    return pid.trim() != "0";
                }
            }
        }
        false
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

fn debug_env_present() -> bool {
    ["DEBUGGER", "LLDB_DEBUGSERVER_PATH", "RR_TRACE_DIR"]
        .iter()
        .any(|var| std::env::var_os(var).is_some())
}

/// A tight loop that runs orders of magnitude slower under single-stepping.
fn timing_anomaly() -> bool {
    let start = Instant::now();
    let mut acc: u64 = 0;
    for i in 0..100_000u64 {
        acc = acc.wrapping_add(i);
    }
    std::hint::black_box(acc);
    start.elapsed() > Duration::from_millis(50)
}

// ── Environment heuristics ───────────────────────────────────────

/// Names of the VM/sandbox indicators that currently fire.
fn environment_indicators() -> Vec<&'static str> {
    let mut fired = Vec::new();
    if vm_mac_prefix_present() {
        fired.push("mac_prefix");
    }
    if vm_dmi_product() {
        fired.push("dmi_product");
    }
    if vm_guest_files_present() {
        fired.push("guest_files");
    }
    fired
}

const VM_MAC_PREFIXES: [&str; 5] = [
    "00:0c:29", // VMware
    "00:50:56", // VMware
    "08:00:27", // VirtualBox
    "00:1c:42", // Parallels
    "00:16:3e", // Xen
];

fn vm_mac_prefix_present() -> bool {
    #[cfg(target_os = "linux")]
    {
        let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
            return false;
        };
        for entry in entries.flatten() {
            let address = entry.path().join("address");
            if let Ok(mac) = std::fs::read_to_string(address) {
                let mac = mac.trim().to_lowercase();
                if VM_MAC_PREFIXES.iter().any(|p| mac.starts_with(p)) {
                    return true;
                }
            }
        }
        false
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

fn vm_dmi_product() -> bool {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/sys/class/dmi/id/product_name") {
            Ok(product) => {
                let product = product.to_lowercase();
                ["vmware", "virtualbox", "qemu", "xen", "kvm"]
                    .iter()
                    .any(|kw| product.contains(kw))
            }
            Err(_) => false,
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

fn vm_guest_files_present() -> bool {
    #[cfg(target_os = "linux")]
    let paths: &[&str] = &["/dev/vboxguest", "/dev/vmci", "/dev/virtio-ports"];

    #[cfg(target_os = "windows")]
    let paths: &[&str] = &[
        "C:\\Windows\\System32\\drivers\\vmmouse.sys",
        "C:\\Windows\\System32\\drivers\\vmhgfs.sys",
        "C:\\Windows\\System32\\drivers\\VBoxMouse.sys",
        "C:\\Windows\\System32\\drivers\\VBoxGuest.sys",
    ];

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    let paths: &[&str] = &[];

    paths.iter().any(|p| std::path::Path::new(p).exists())
}
