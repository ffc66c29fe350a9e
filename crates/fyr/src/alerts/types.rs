//! Alert webhook payload types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use tracing::warn;

use crate::model::AlertStatus;

/// Alertmanager-style webhook body.
///
/// Only `alerts` is read; every other top-level field is kept in the raw payload.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AlertPayload {
    pub alerts: Vec<IncomingAlert>,
}

impl AlertPayload {
    /// Extract alerts from a parsed body.
    ///
    /// Returns `None` when the body has no `alerts` array. Items that are not
    /// alert objects are skipped.
    pub fn from_value(body: &Value) -> Option<Self> {
        let items = body.get("alerts")?.as_array()?;
        let alerts = items
            .iter()
            .filter_map(|item| match serde_json::from_value::<IncomingAlert>(item.clone()) {
                Ok(mut alert) => {
                    alert.raw = item.clone();
                    Some(alert)
                }
                Err(e) => {
                    warn!(error = %e, "Skipping malformed alert item");
                    None
                }
            })
            .collect();
        Some(Self { alerts })
    }
}

/// One alert from the webhook.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingAlert {
    /// "firing" or "resolved"
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub starts_at: Option<String>,
    /// `0001-01-01T00:00:00Z` while the alert is still firing
    #[serde(default)]
    pub ends_at: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(skip)]
    pub raw: Value,
}

fn default_status() -> String {
    "firing".to_string()
}

impl IncomingAlert {
    pub fn status(&self) -> AlertStatus {
        if self.status.eq_ignore_ascii_case("resolved") {
            AlertStatus::Resolved
        } else {
            AlertStatus::Firing
        }
    }

    /// Get the alert name.
    pub fn name(&self) -> &str {
        self.labels.get("alertname").map_or("unknown", String::as_str)
    }

    /// Source fingerprint, or a stable hash of the label set when absent.
    pub fn fingerprint(&self) -> String {
        match self.fingerprint.as_deref().map(str::trim) {
            Some(fp) if !fp.is_empty() => fp.to_string(),
            _ => label_fingerprint(&self.labels),
        }
    }

    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        self.starts_at.as_deref().and_then(parse_timestamp)
    }

    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        self.ends_at.as_deref().and_then(parse_timestamp)
    }
}

/// Parse an RFC 3339 timestamp, treating Go's zero time as unset.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// First 16 hex digits of the SHA-1 over the sorted label set.
pub fn label_fingerprint(labels: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha1::new();
    for (key, value) in labels {
        hasher.update(key.as_bytes());
        hasher.update([0xff]);
        hasher.update(value.as_bytes());
        hasher.update([0xff]);
    }
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}
