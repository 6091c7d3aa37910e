//! The persisted entitlement record.
//!
//! The record is owned exclusively by the license engine; the cache store
//! serializes it without inspecting fields. Server responses are merged in
//! verbatim — numeric fields like `remaining_days` are echoed, never
//! recomputed, and unknown server fields are preserved opaquely.

use crate::error::LicenseResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A locally held entitlement, refreshed by verify/heartbeat round-trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    /// Server-issued validity flag.
    #[serde(default)]
    pub valid: bool,

    /// License identifier, when activated by license key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_id: Option<String>,

    /// Subscription identifier, when activated by account login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,

    /// Plan label, echoed verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<String>,

    /// Absolute expiry timestamp (RFC3339), if the entitlement has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<String>,

    /// Remaining days as reported by the server. Echoed, not recomputed.
    #[serde(default)]
    pub remaining_days: i64,

    /// Feature flags granted by the entitlement. Opaque strings.
    #[serde(default)]
    pub features: Vec<String>,

    /// Detached signature from the last signed response, kept so the cached
    /// record can be re-verified after a reload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// License key used for activation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,

    /// Account email used for login, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Unix timestamp of the last successful server contact.
    #[serde(default)]
    pub last_verified_at: i64,

    /// Unknown server fields, preserved but never interpreted.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EntitlementRecord {
    /// Builds a record from a server response fragment.
    pub fn from_fragment(fragment: &Map<String, Value>) -> LicenseResult<Self> {
        let record = serde_json::from_value(Value::Object(fragment.clone()))?;
        Ok(record)
    }

    /// Merges a server response fragment over this record.
    ///
    /// Every field present in the fragment wins; absent fields keep their
    /// current value. Unknown keys land in `extra`.
    pub fn apply_fragment(&mut self, fragment: &Map<String, Value>) -> LicenseResult<()> {
        let mut value = serde_json::to_value(&*self)?;
        if let Value::Object(obj) = &mut value {
            for (k, v) in fragment {
                obj.insert(k.clone(), v.clone());
            }
        }
        *self = serde_json::from_value(value)?;
        Ok(())
    }

    /// Returns true if the record carries an expiry timestamp in the past.
    ///
    /// An unparsable expiry is treated as absent rather than expired; the
    /// server controls the validity flag either way.
    pub fn is_expired(&self, now_unix: i64) -> bool {
        match &self.expire_at {
            Some(raw) if !raw.is_empty() => {
                match chrono::DateTime::parse_from_rfc3339(raw) {
                    Ok(expiry) => expiry.timestamp() < now_unix,
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }

    /// Returns true if the feature list contains `name`.
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fragment(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("fragment must be an object"),
        }
    }

    #[test]
    fn fragment_roundtrip_preserves_unknown_fields() {
        let map = fragment(json!({
            "valid": true,
            "remaining_days": 30,
            "features": ["sync", "export"],
            "server_region": "eu-1",
        }));
        let record = EntitlementRecord::from_fragment(&map).unwrap();
        assert!(record.valid);
        assert_eq!(record.remaining_days, 30);
        assert_eq!(record.extra.get("server_region"), Some(&json!("eu-1")));

        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded.get("server_region"), Some(&json!("eu-1")));
    }

    #[test]
    fn apply_fragment_overwrites_present_fields_only() {
        let mut record = EntitlementRecord::from_fragment(&fragment(json!({
            "valid": true,
            "remaining_days": 30,
            "features": ["sync"],
        })))
        .unwrap();
        record.license_key = Some("KEY-1".to_string());
        record.last_verified_at = 1_000;

        record
            .apply_fragment(&fragment(json!({"remaining_days": 29})))
            .unwrap();

        assert_eq!(record.remaining_days, 29);
        assert!(record.valid);
        assert_eq!(record.license_key.as_deref(), Some("KEY-1"));
        assert_eq!(record.last_verified_at, 1_000);
    }

    #[test]
    fn expiry_in_past_detected() {
        let mut record = EntitlementRecord::default();
        record.expire_at = Some("2020-01-01T00:00:00Z".to_string());
        assert!(record.is_expired(1_700_000_000));
    }

    #[test]
    fn expiry_in_future_not_expired() {
        let mut record = EntitlementRecord::default();
        record.expire_at = Some("2099-01-01T00:00:00Z".to_string());
        assert!(!record.is_expired(1_700_000_000));
    }

    #[test]
    fn unparsable_expiry_treated_as_absent() {
        let mut record = EntitlementRecord::default();
        record.expire_at = Some("not-a-date".to_string());
        assert!(!record.is_expired(1_700_000_000));
    }
}
