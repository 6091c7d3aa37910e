//! Independent certificate trust verification.
//!
//! Pinning here is defense-in-depth, additive to the chain validation the
//! transport already performs. After a request completes, the verifier opens
//! a second raw TLS handshake to the same host and port, takes the leaf
//! certificate it is served, and compares its SHA-256 fingerprint against
//! the pinned value.
//!
//! The outcome is a tri-state: a failed probe (unreachable host, handshake
//! error) is `Undetermined`, never a violation — the caller treats it
//! permissively but the distinction stays visible at the type level.

use crate::config::PinningMode;
use crate::error::{LicenseError, LicenseResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring as ring_provider;
use rustls::DigitallySignedStruct;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Result of an independent certificate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinCheck {
    /// The leaf certificate matches the pinned fingerprint.
    ConfirmedOk,
    /// The leaf certificate does not match. The response in hand must not
    /// be trusted.
    Violation { expected: String, actual: String },
    /// The check could not be performed. Not a violation.
    Undetermined(String),
}

/// Confirms the server's TLS leaf certificate against a pinned fingerprint.
#[derive(Debug, Clone)]
pub struct CertificateTrustVerifier {
    expected: String,
    timeout: Duration,
}

impl CertificateTrustVerifier {
    /// Builds a verifier from the configured pinning mode. Returns `None`
    /// for modes that perform no independent check (disabled, skip).
    ///
    /// # Errors
    ///
    /// Returns a storage error if a configured CA file cannot be read — a
    /// construction-time configuration problem, not a runtime one.
    pub fn from_mode(mode: &PinningMode, timeout: Duration) -> LicenseResult<Option<Self>> {
        let expected = match mode {
            PinningMode::Fingerprint(fp) => normalize_fingerprint(fp),
            PinningMode::CaFile(path) => fingerprint_from_pem_file(path)?,
            PinningMode::Disabled | PinningMode::SkipVerification => return Ok(None),
        };
        Ok(Some(Self { expected, timeout }))
    }

    /// The normalized fingerprint this verifier pins to.
    pub fn expected(&self) -> &str {
        &self.expected
    }

    /// Re-handshakes with `host:port` and compares the served leaf
    /// certificate against the pin.
    pub fn check(&self, host: &str, port: u16) -> PinCheck {
        match leaf_fingerprint(host, port, self.timeout) {
            Ok(actual) => self.compare(&actual),
            Err(reason) => PinCheck::Undetermined(reason),
        }
    }

    /// Compares an observed fingerprint (any accepted format) to the pin.
    pub fn compare(&self, actual: &str) -> PinCheck {
        let actual = normalize_fingerprint(actual);
        if actual == self.expected {
            PinCheck::ConfirmedOk
        } else {
            PinCheck::Violation {
                expected: self.expected.clone(),
                actual,
            }
        }
    }
}

/// Normalizes a fingerprint for comparison: strips a `SHA256:` prefix and
/// separators, lower-cases the hex.
pub fn normalize_fingerprint(fp: &str) -> String {
    let fp = fp.trim();
    let fp = fp
        .strip_prefix("SHA256:")
        .or_else(|| fp.strip_prefix("sha256:"))
        .unwrap_or(fp);
    fp.chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_lowercase()
}

/// Computes the pinned fingerprint from the first certificate in a PEM file.
pub fn fingerprint_from_pem_file(path: &Path) -> LicenseResult<String> {
    let data = std::fs::read(path)
        .map_err(|e| LicenseError::Storage(format!("cannot read pinned certificate: {}", e)))?;
    let mut reader = std::io::BufReader::new(&data[..]);
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .transpose()
        .map_err(|e| LicenseError::Storage(format!("cannot parse pinned certificate: {}", e)))?
        .ok_or_else(|| {
            LicenseError::Storage("pinned certificate file contains no certificate".to_string())
        })?;
    Ok(hex::encode(Sha256::digest(cert.as_ref())))
}

/// Fetches the server's current leaf fingerprint in display form
/// (`SHA256:AA:BB:...`). Intended for first-time pin configuration.
pub fn fetch_server_fingerprint(host: &str, port: u16, timeout: Duration) -> LicenseResult<String> {
    let fingerprint = leaf_fingerprint(host, port, timeout).map_err(LicenseError::Network)?;
    let grouped = fingerprint
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_uppercase())
        .collect::<Vec<_>>()
        .join(":");
    Ok(format!("SHA256:{}", grouped))
}

/// Performs the raw handshake and returns the leaf certificate's SHA-256
/// fingerprint as lowercase hex. Errors are reasons, not violations.
fn leaf_fingerprint(host: &str, port: u16, timeout: Duration) -> Result<String, String> {
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        ring_provider::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| format!("tls config: {}", e))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
    .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| format!("invalid server name: {}", e))?;
    let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| format!("tls client: {}", e))?;

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("resolve {}:{}: {}", host, port, e))?
        .next()
        .ok_or_else(|| format!("no address for {}:{}", host, port))?;
    let mut sock =
        TcpStream::connect_timeout(&addr, timeout).map_err(|e| format!("connect: {}", e))?;
    let _ = sock.set_read_timeout(Some(timeout));
    let _ = sock.set_write_timeout(Some(timeout));

    while conn.is_handshaking() {
        conn.complete_io(&mut sock)
            .map_err(|e| format!("handshake: {}", e))?;
    }

    let certs = conn
        .peer_certificates()
        .ok_or_else(|| "no peer certificates".to_string())?;
    let leaf = certs
        .first()
        .ok_or_else(|| "empty certificate chain".to_string())?;
    Ok(hex::encode(Sha256::digest(leaf.as_ref())))
}

/// Accepts any presented chain. The probe connection exists only to read the
/// leaf certificate; trust decisions happen in [`CertificateTrustVerifier`].
#[derive(Debug)]
struct AcceptAnyServerCert {
    schemes: Vec<rustls::SignatureScheme>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            schemes: ring_provider::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_prefix_and_separators() {
        assert_eq!(normalize_fingerprint("SHA256:AB:CD:EF"), "abcdef");
        assert_eq!(normalize_fingerprint("ab:cd:ef"), "abcdef");
        assert_eq!(normalize_fingerprint("ABCDEF"), "abcdef");
        assert_eq!(normalize_fingerprint("  sha256:ab:cd  "), "abcd");
    }

    #[test]
    fn compare_is_format_insensitive() {
        let verifier = CertificateTrustVerifier {
            expected: normalize_fingerprint("SHA256:AA:BB:CC"),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(verifier.compare("aabbcc"), PinCheck::ConfirmedOk);
        assert_eq!(verifier.compare("AA:BB:CC"), PinCheck::ConfirmedOk);
    }

    #[test]
    fn single_hex_character_difference_is_violation() {
        let verifier = CertificateTrustVerifier {
            expected: normalize_fingerprint("aabbcc"),
            timeout: Duration::from_secs(1),
        };
        match verifier.compare("aabbcd") {
            PinCheck::Violation { expected, actual } => {
                assert_eq!(expected, "aabbcc");
                assert_eq!(actual, "aabbcd");
            }
            other => panic!("expected violation, got {:?}", other),
        }
    }
}
