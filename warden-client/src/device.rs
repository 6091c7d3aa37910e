//! Device identity.
//!
//! The engine treats the device identity as an opaque stable string: it is
//! key-derivation material and a request field, never parsed. Hosts with
//! their own identity scheme pass it in directly; [`DeviceIdentity::from_host`]
//! derives a reasonable default from stable machine characteristics.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;

/// An opaque stable identifier for this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Wraps a caller-supplied identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives an identity from hostname, OS, architecture and (where
    /// available) the machine ID. Stable across reboots; changes if the
    /// machine changes significantly.
    #[must_use]
    pub fn from_host() -> Self {
        let mut parts = vec![
            get_hostname(),
            env::consts::OS.to_string(),
            env::consts::ARCH.to_string(),
        ];
        if let Some(machine_id) = get_machine_id() {
            parts.push(machine_id);
        }

        let combined = parts.join("|");
        let hash = Sha256::digest(combined.as_bytes());
        Self(hex::encode(&hash[..16]))
    }

    /// Returns the identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptive device fields sent with activation and login requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Display name (hostname).
    pub name: String,
    /// Hostname.
    pub hostname: String,
    /// Operating system name.
    pub os: String,
    /// OS version string.
    pub os_version: String,
    /// Application version.
    pub app_version: String,
}

impl DeviceInfo {
    /// Collects information about the current device.
    #[must_use]
    pub fn collect(app_version: &str) -> Self {
        let hostname = get_hostname();
        Self {
            name: hostname.clone(),
            hostname,
            os: env::consts::OS.to_string(),
            os_version: get_os_version(),
            app_version: app_version.to_string(),
        }
    }
}

/// Gets the machine hostname.
fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Gets the OS version string.
fn get_os_version() -> String {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| {
                content
                    .lines()
                    .find(|l| l.starts_with("VERSION_ID="))
                    .map(|l| {
                        l.trim_start_matches("VERSION_ID=")
                            .trim_matches('"')
                            .to_string()
                    })
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        env::consts::OS.to_string()
    }
}

/// Gets the machine ID (platform-specific stable identifier).
fn get_machine_id() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/machine-id")
            .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
            .ok()
            .map(|s| s.trim().to_string())
    }

    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .find(|l| l.contains("IOPlatformUUID"))
                    .and_then(|l| l.split('"').nth(3))
                    .map(String::from)
            })
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_host_is_stable() {
        let a = DeviceIdentity::from_host();
        let b = DeviceIdentity::from_host();
        assert_eq!(a, b);
    }

    #[test]
    fn opaque_identity_passes_through() {
        let id = DeviceIdentity::new("tenant-7:workstation-12");
        assert_eq!(id.as_str(), "tenant-7:workstation-12");
    }
}
