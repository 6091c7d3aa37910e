//! Authenticated transport to the license server.
//!
//! The engine talks to the server through the [`AuthTransport`] trait; the
//! production implementation is a pinned reqwest client that decodes the
//! `{code, message, data}` envelope and runs the independent certificate
//! check after each response. Collaborator modules (data sync, hot update,
//! secure scripts, realtime channel) reuse the same handle for their own
//! calls so they inherit pinning without reimplementing it.

use crate::config::{EngineConfig, PinningMode};
use crate::error::{LicenseError, LicenseResult};
use crate::pinning::{CertificateTrustVerifier, PinCheck};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

/// Seam between the engine and the wire. Implementations must be safe to
/// share across threads; the heartbeat task calls through the same handle.
pub trait AuthTransport: Send + Sync {
    /// Posts a JSON body to an endpoint under `/api/client` and returns the
    /// envelope's `data` object.
    fn post(&self, endpoint: &str, body: &Value) -> LicenseResult<Map<String, Value>>;
}

/// Response envelope shared by all client endpoints.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Pinned HTTPS transport.
pub struct HttpTransport {
    server_url: String,
    client: reqwest::blocking::Client,
    pin: Option<CertificateTrustVerifier>,
    host: String,
    port: u16,
}

impl HttpTransport {
    /// Builds the transport from engine configuration.
    ///
    /// Standard chain validation stays on in every mode except
    /// [`PinningMode::SkipVerification`]; fingerprint pinning is additive,
    /// performed by a separate post-hoc handshake.
    pub fn new(config: &EngineConfig) -> LicenseResult<Self> {
        let mut builder = reqwest::blocking::Client::builder().timeout(config.timeout);

        match &config.trust.pinning {
            PinningMode::SkipVerification => {
                builder = builder.danger_accept_invalid_certs(true);
            }
            PinningMode::CaFile(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    LicenseError::Storage(format!("cannot read pinned certificate: {}", e))
                })?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| LicenseError::InvalidPublicKey(e.to_string()))?;
                builder = builder.add_root_certificate(cert);
            }
            PinningMode::Disabled | PinningMode::Fingerprint(_) => {}
        }

        let client = builder
            .build()
            .map_err(|e| LicenseError::Network(e.to_string()))?;

        let url = reqwest::Url::parse(&config.server_url)
            .map_err(|e| LicenseError::Network(format!("invalid server url: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| LicenseError::Network("server url has no host".to_string()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);

        let pin = CertificateTrustVerifier::from_mode(&config.trust.pinning, config.timeout)?;

        Ok(Self {
            server_url: config.server_url.clone(),
            client,
            pin,
            host,
            port,
        })
    }

    /// The reqwest client, for collaborator modules that need raw requests
    /// over the same pinned connection settings.
    pub fn http_client(&self) -> &reqwest::blocking::Client {
        &self.client
    }

    /// Runs the independent certificate check for the configured server.
    ///
    /// The check happens after the response is already in hand (the probe is
    /// a second connection); on violation the caller discards the response.
    fn confirm_certificate(&self) -> LicenseResult<()> {
        let Some(pin) = &self.pin else {
            return Ok(());
        };
        match pin.check(&self.host, self.port) {
            PinCheck::ConfirmedOk => Ok(()),
            PinCheck::Undetermined(reason) => {
                warn!(reason = %reason, "certificate pin check could not be performed");
                Ok(())
            }
            PinCheck::Violation { expected, actual } => {
                Err(LicenseError::CertificateTrust { expected, actual })
            }
        }
    }
}

impl AuthTransport for HttpTransport {
    fn post(&self, endpoint: &str, body: &Value) -> LicenseResult<Map<String, Value>> {
        let url = format!("{}/api/client{}", self.server_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| LicenseError::Network(e.to_string()))?;

        // Transport-level trust before payload-level: a pin violation
        // discards the response unparsed.
        self.confirm_certificate()?;

        let envelope: Envelope = response
            .json()
            .map_err(|e| LicenseError::Network(format!("invalid response body: {}", e)))?;

        if envelope.code != 0 {
            return Err(LicenseError::Api(envelope.message));
        }

        match envelope.data {
            Some(Value::Object(map)) => Ok(map),
            Some(Value::Null) | None => Ok(Map::new()),
            Some(_) => Err(LicenseError::Network(
                "response data is not an object".to_string(),
            )),
        }
    }
}
