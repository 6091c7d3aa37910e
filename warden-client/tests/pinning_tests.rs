use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use std::time::Duration;
use warden_client::{
    fingerprint_from_pem_file, normalize_fingerprint, CertificateTrustVerifier, PinCheck,
    PinningMode,
};

// ── Fingerprint normalization ────────────────────────────────────

#[test]
fn display_and_bare_formats_normalize_identically() {
    let display = "SHA256:AB:CD:EF:01:23:45";
    let bare = "abcdef012345";
    assert_eq!(normalize_fingerprint(display), normalize_fingerprint(bare));
}

#[test]
fn comparison_is_case_and_separator_insensitive() {
    let verifier =
        CertificateTrustVerifier::from_mode(&PinningMode::Fingerprint("AB:CD:EF".into()), Duration::from_secs(1))
            .unwrap()
            .unwrap();
    assert_eq!(verifier.compare("abcdef"), PinCheck::ConfirmedOk);
    assert_eq!(verifier.compare("SHA256:AB:CD:EF"), PinCheck::ConfirmedOk);
}

#[test]
fn altered_hex_character_is_a_violation() {
    let verifier =
        CertificateTrustVerifier::from_mode(&PinningMode::Fingerprint("abcdef".into()), Duration::from_secs(1))
            .unwrap()
            .unwrap();
    assert!(matches!(
        verifier.compare("abcdee"),
        PinCheck::Violation { .. }
    ));
}

// ── Pin sources ──────────────────────────────────────────────────

#[test]
fn pin_from_certificate_file_hashes_der() {
    let der = b"\x30\x82\x01\x0adummy-certificate-bytes";
    let pem = format!(
        "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
        BASE64.encode(der)
    );
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.crt");
    std::fs::write(&path, pem).unwrap();

    let fingerprint = fingerprint_from_pem_file(&path).unwrap();
    assert_eq!(fingerprint, hex::encode(Sha256::digest(der)));

    let verifier =
        CertificateTrustVerifier::from_mode(&PinningMode::CaFile(path), Duration::from_secs(1))
            .unwrap()
            .unwrap();
    assert_eq!(verifier.expected(), fingerprint);
}

#[test]
fn missing_certificate_file_fails_construction() {
    let result = CertificateTrustVerifier::from_mode(
        &PinningMode::CaFile("/nonexistent/server.crt".into()),
        Duration::from_secs(1),
    );
    assert!(result.is_err());
}

// ── Modes without a check ────────────────────────────────────────

#[test]
fn disabled_and_skip_modes_never_check() {
    assert!(
        CertificateTrustVerifier::from_mode(&PinningMode::Disabled, Duration::from_secs(1))
            .unwrap()
            .is_none()
    );
    assert!(CertificateTrustVerifier::from_mode(
        &PinningMode::SkipVerification,
        Duration::from_secs(1)
    )
    .unwrap()
    .is_none());
}

// ── Probe degradation ────────────────────────────────────────────

#[test]
fn unreachable_host_is_undetermined_not_violation() {
    let verifier = CertificateTrustVerifier::from_mode(
        &PinningMode::Fingerprint("abcdef".into()),
        Duration::from_millis(250),
    )
    .unwrap()
    .unwrap();

    // Nothing listens on port 1; the probe fails to connect.
    match verifier.check("127.0.0.1", 1) {
        PinCheck::Undetermined(_) => {}
        other => panic!("expected undetermined, got {:?}", other),
    }
}

#[test]
fn plain_tcp_listener_is_undetermined() {
    // A listener that never speaks TLS: the handshake fails, which degrades
    // to "unable to confirm" rather than a violation.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            drop(stream);
        }
    });

    let verifier = CertificateTrustVerifier::from_mode(
        &PinningMode::Fingerprint("abcdef".into()),
        Duration::from_millis(500),
    )
    .unwrap()
    .unwrap();

    match verifier.check("127.0.0.1", port) {
        PinCheck::Undetermined(_) => {}
        other => panic!("expected undetermined, got {:?}", other),
    }
}
