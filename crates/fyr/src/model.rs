//! Persisted record types.
//!
//! Every status enum round-trips through its stored string form (`as_str` /
//! `FromStr`) so the SQLite rows stay readable by dashboards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

pub use notify::Severity;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::StorageError(format!(
                        "invalid {} value '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

// =============================================================================
// Rollouts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutStatus {
    Pending,
    RollingOut,
    Success,
    Failed,
}

string_enum!(RolloutStatus {
    Pending => "PENDING",
    RollingOut => "ROLLING_OUT",
    Success => "SUCCESS",
    Failed => "FAILED",
});

impl RolloutStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Analysis progress of a rollout, batch or incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Done,
    Failed,
}

string_enum!(AnalysisStatus {
    Pending => "PENDING",
    Done => "DONE",
    Failed => "FAILED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

string_enum!(NotifyStatus {
    Pending => "PENDING",
    Sent => "SENT",
    Failed => "FAILED",
});

/// Identity of one rollout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolloutKey {
    pub cluster: String,
    pub namespace: String,
    pub deployment: String,
    pub generation: i64,
}

/// Free-form context attached to a rollout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mr_url: Option<String>,
    /// Opt-in annotations of the owning namespace at discovery time
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_annotations: BTreeMap<String, String>,
    /// Why the rollout was failed, e.g. `pod_failures: 3/5 pods CrashLoopBackOff`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl RolloutMetadata {
    /// Overlay every field set in `other`.
    pub fn merge(&mut self, other: &Self) {
        fn take(dst: &mut Option<String>, src: &Option<String>) {
            if src.is_some() {
                dst.clone_from(src);
            }
        }
        take(&mut self.team, &other.team);
        take(&mut self.notify_target, &other.notify_target);
        take(&mut self.git_project, &other.git_project);
        take(&mut self.git_commit, &other.git_commit);
        take(&mut self.pipeline_url, &other.pipeline_url);
        take(&mut self.mr_url, &other.mr_url);
        take(&mut self.failure, &other.failure);
        if !other.namespace_annotations.is_empty() {
            self.namespace_annotations
                .clone_from(&other.namespace_annotations);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollout {
    pub id: i64,
    pub key: RolloutKey,
    pub status: RolloutStatus,
    pub analysis_status: AnalysisStatus,
    pub notify_status: NotifyStatus,
    /// How the rollout was discovered (`k8s` or `pipeline`)
    pub origin: String,
    pub metadata: RolloutMetadata,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub analysis_id: Option<i64>,
}

impl Rollout {
    /// Human reference, `namespace/deployment#generation`.
    pub fn reference(&self) -> String {
        format!(
            "{}/{}#{}",
            self.key.namespace, self.key.deployment, self.key.generation
        )
    }
}

#[derive(Debug, Clone)]
pub struct NewRollout {
    pub key: RolloutKey,
    pub status: RolloutStatus,
    pub origin: String,
    pub metadata: RolloutMetadata,
    pub started_at: DateTime<Utc>,
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

string_enum!(AlertStatus {
    Firing => "firing",
    Resolved => "resolved",
});

/// One delivered alert item, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub fingerprint: String,
    pub status: AlertStatus,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub raw: Value,
    pub received_at: DateTime<Utc>,
    pub batched: bool,
    pub batch_id: Option<i64>,
}

impl AlertRecord {
    pub fn name(&self) -> &str {
        self.labels
            .get("alertname")
            .map_or("unknown", String::as_str)
    }

    pub fn severity(&self) -> &str {
        self.labels.get("severity").map_or("none", String::as_str)
    }

    pub fn description(&self) -> Option<&str> {
        self.annotations
            .get("description")
            .or_else(|| self.annotations.get("summary"))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub fingerprint: String,
    pub status: AlertStatus,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub raw: Value,
    pub received_at: DateTime<Utc>,
}

/// Throttle state, one row per fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertStateRecord {
    pub fingerprint: String,
    pub status: AlertStatus,
    pub last_received_at: DateTime<Utc>,
    pub last_investigated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertBatchRecord {
    pub id: i64,
    pub primary_fingerprint: String,
    pub namespace: String,
    pub service: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub summary: String,
    pub analysis_status: AnalysisStatus,
    pub notify_status: NotifyStatus,
    pub analysis_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl AlertBatchRecord {
    pub fn reference(&self) -> String {
        format!("AlertBatch #{} ({}/{})", self.id, self.namespace, self.service)
    }
}

#[derive(Debug, Clone)]
pub struct NewAlertBatch {
    pub primary_fingerprint: String,
    pub namespace: String,
    pub service: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Namespace incidents
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    StuckTerminating,
    QuotaExceeded,
    HighEvictionRate,
    HighRestartRate,
}

string_enum!(IncidentType {
    StuckTerminating => "stuck_terminating",
    QuotaExceeded => "quota_exceeded",
    HighEvictionRate => "high_eviction_rate",
    HighRestartRate => "high_restart_rate",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Active,
    Investigating,
    Resolved,
}

string_enum!(IncidentStatus {
    Active => "ACTIVE",
    Investigating => "INVESTIGATING",
    Resolved => "RESOLVED",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceIncident {
    pub id: i64,
    pub cluster: String,
    pub namespace: String,
    pub incident_type: IncidentType,
    pub status: IncidentStatus,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub analysis_status: AnalysisStatus,
    pub notify_status: NotifyStatus,
    pub analysis_id: Option<i64>,
    pub metadata: Value,
}

impl NamespaceIncident {
    pub fn reference(&self) -> String {
        format!("{} ({})", self.namespace, self.incident_type)
    }
}

#[derive(Debug, Clone)]
pub struct NewIncident {
    pub cluster: String,
    pub namespace: String,
    pub incident_type: IncidentType,
    pub started_at: DateTime<Utc>,
    pub metadata: Value,
}

// =============================================================================
// Investigation jobs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Rollout,
    Alert,
    Namespace,
}

string_enum!(JobKind {
    Rollout => "rollout",
    Alert => "alert",
    Namespace => "namespace",
});

/// The single entity a job investigates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum JobTarget {
    Rollout(i64),
    AlertBatch(i64),
    NamespaceIncident(i64),
}

impl JobTarget {
    pub const fn kind(self) -> JobKind {
        match self {
            Self::Rollout(_) => JobKind::Rollout,
            Self::AlertBatch(_) => JobKind::Alert,
            Self::NamespaceIncident(_) => JobKind::Namespace,
        }
    }

    pub const fn id(self) -> i64 {
        match self {
            Self::Rollout(id) | Self::AlertBatch(id) | Self::NamespaceIncident(id) => id,
        }
    }

    pub const fn from_parts(kind: JobKind, id: i64) -> Self {
        match kind {
            JobKind::Rollout => Self::Rollout(id),
            JobKind::Alert => Self::AlertBatch(id),
            JobKind::Namespace => Self::NamespaceIncident(id),
        }
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

string_enum!(JobStatus {
    Pending => "pending",
    Running => "running",
    Done => "done",
    Failed => "failed",
});

/// Where a job counts against the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobScope {
    pub cluster: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationJob {
    pub id: i64,
    pub target: JobTarget,
    pub scope: JobScope,
    pub status: JobStatus,
    pub analysis_id: Option<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Analyses
// =============================================================================

/// Structured answer from the diagnostic engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: String,
    pub likely_cause: String,
    #[serde(default)]
    pub recommended_steps: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: i64,
    pub job_id: i64,
    pub target: JobTarget,
    pub analysis: Analysis,
    pub triage_team: String,
    pub triage_reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub job_id: i64,
    pub target: JobTarget,
    pub analysis: Analysis,
    pub triage_team: String,
    pub triage_reason: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        assert_eq!(RolloutStatus::RollingOut.as_str(), "ROLLING_OUT");
        assert_eq!(
            "ROLLING_OUT".parse::<RolloutStatus>().unwrap(),
            RolloutStatus::RollingOut
        );
        assert_eq!(
            "high_restart_rate".parse::<IncidentType>().unwrap(),
            IncidentType::HighRestartRate
        );
        assert!("rolling".parse::<RolloutStatus>().is_err());
    }

    #[test]
    fn test_job_target_serializes_as_tagged_union() {
        let target = JobTarget::AlertBatch(7);
        let json = serde_json::to_value(target).unwrap();
        assert_eq!(json, serde_json::json!({"type": "alert_batch", "id": 7}));
        assert_eq!(target.kind(), JobKind::Alert);
        assert_eq!(JobTarget::from_parts(JobKind::Alert, 7), target);
    }

    #[test]
    fn test_metadata_merge_keeps_unset_fields() {
        let mut metadata = RolloutMetadata {
            team: Some("payments".to_string()),
            notify_target: Some("#payments".to_string()),
            ..RolloutMetadata::default()
        };
        metadata.merge(&RolloutMetadata {
            pipeline_url: Some("https://ci.example/p/9".to_string()),
            notify_target: Some("#payments-alerts".to_string()),
            ..RolloutMetadata::default()
        });
        assert_eq!(metadata.team.as_deref(), Some("payments"));
        assert_eq!(metadata.notify_target.as_deref(), Some("#payments-alerts"));
        assert_eq!(
            metadata.pipeline_url.as_deref(),
            Some("https://ci.example/p/9")
        );
    }

    #[test]
    fn test_rollout_reference() {
        let rollout = Rollout {
            id: 1,
            key: RolloutKey {
                cluster: "c".to_string(),
                namespace: "shop".to_string(),
                deployment: "web".to_string(),
                generation: 12,
            },
            status: RolloutStatus::Pending,
            analysis_status: AnalysisStatus::Pending,
            notify_status: NotifyStatus::Pending,
            origin: "watch".to_string(),
            metadata: RolloutMetadata::default(),
            started_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            analysis_id: None,
        };
        assert_eq!(rollout.reference(), "shop/web#12");
    }
}
