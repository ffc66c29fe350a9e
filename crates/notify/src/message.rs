//! Message types rendered by notification channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Severity reported by a diagnostic analysis. Unknown values read as `Medium`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    High,
    Critical,
    #[default]
    #[serde(other)]
    Medium,
}

impl Severity {
    /// Attachment color for this severity.
    #[must_use]
    pub const fn color(&self) -> &'static str {
        match self {
            Self::Low => "#3498db",
            Self::Medium => "#f1c40f",
            Self::High => "#e67e22",
            Self::Critical => "#e74c3c",
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finished analysis, flattened for delivery.
///
/// Channels render this however suits them; nothing here is channel specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisMessage {
    /// Human readable reference, e.g. `payments/api#7` or `AlertBatch #3 (payments/api)`
    pub reference: String,
    pub severity: Severity,
    pub summary: String,
    pub likely_cause: String,
    #[serde(default)]
    pub recommended_steps: Vec<String>,
    #[serde(default)]
    pub details: Option<String>,
    /// Owning team from namespace metadata
    #[serde(default)]
    pub team: Option<String>,
    /// Team chosen by triage
    #[serde(default)]
    pub triage_team: Option<String>,
    #[serde(default)]
    pub pipeline_url: Option<String>,
    /// Opt-in annotations of the owning namespace
    #[serde(default)]
    pub namespace_annotations: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl AnalysisMessage {
    /// Title line used as notification fallback text.
    #[must_use]
    pub fn title(&self) -> String {
        format!("[{}] {}", self.severity.as_str().to_uppercase(), self.reference)
    }
}
