//! Durable state shared by every loop.
//!
//! Components never hold records across passes; each operation re-reads what
//! it needs. Every method is one small independent write or read. Operations
//! that decide and write together (`record_alert`, the conditional creates,
//! `fail_rollout`, `begin_incident_investigation`) are atomic, and every
//! operation that creates a job owner also queues its job in the same step.

#[cfg(test)]
pub(crate) mod faulty;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::model::{
    AlertBatchRecord, AlertRecord, AlertStateRecord, AnalysisRecord, AnalysisStatus,
    IncidentStatus, InvestigationJob, JobKind, JobScope, JobStatus, JobTarget,
    NamespaceIncident, NewAlert, NewAlertBatch, NewAnalysis, NewIncident, NewRollout,
    NotifyStatus, Rollout, RolloutKey, RolloutMetadata, RolloutStatus,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait Store: Send + Sync {
    // --- rollouts ---

    /// Insert unless a rollout with the same identity exists. Returns the
    /// stored row and whether it was created.
    async fn create_rollout_if_absent(&self, new: NewRollout) -> Result<(Rollout, bool)>;

    async fn get_rollout(&self, id: i64) -> Result<Option<Rollout>>;

    async fn find_rollout(&self, key: &RolloutKey) -> Result<Option<Rollout>>;

    /// Merge `metadata` into the stored metadata.
    async fn update_rollout_metadata(&self, id: i64, metadata: &RolloutMetadata) -> Result<()>;

    /// Set a non-failed status; SUCCESS also stamps `completed_at`. Failing
    /// goes through [`Store::fail_rollout`] and is rejected here.
    async fn update_rollout_status(
        &self,
        id: i64,
        status: RolloutStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Fail a PENDING or ROLLING_OUT rollout, record `failure` in its
    /// metadata and queue its investigation. Returns `None`, writing nothing,
    /// when the rollout is no longer active.
    async fn fail_rollout(
        &self,
        id: i64,
        failure: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<InvestigationJob>>;

    /// Rollouts in PENDING or ROLLING_OUT for `cluster`.
    async fn list_active_rollouts(&self, cluster: &str) -> Result<Vec<Rollout>>;

    // --- alerts ---

    /// Store one alert and advance its fingerprint state as one step.
    ///
    /// Returns the stored alert and whether it was admitted for
    /// investigation (see [`crate::alerts::should_investigate`]). An alert
    /// that is not admitted is stored already excluded from correlation.
    async fn record_alert(
        &self,
        new: NewAlert,
        throttle_window: Duration,
    ) -> Result<(AlertRecord, bool)>;

    async fn get_alert_state(&self, fingerprint: &str) -> Result<Option<AlertStateRecord>>;

    /// Unbatched alerts received at or after `since`, oldest first.
    async fn list_unbatched_alerts(&self, since: DateTime<Utc>) -> Result<Vec<AlertRecord>>;

    /// Create a batch over the listed alerts that are still unbatched and
    /// queue its investigation under `scope`. Returns `None` (and writes
    /// nothing) when none of them are.
    async fn create_batch(
        &self,
        new: NewAlertBatch,
        alert_ids: &[i64],
        scope: JobScope,
    ) -> Result<Option<(AlertBatchRecord, InvestigationJob)>>;

    async fn get_batch(&self, id: i64) -> Result<Option<AlertBatchRecord>>;

    async fn list_batch_alerts(&self, batch_id: i64) -> Result<Vec<AlertRecord>>;

    // --- namespace incidents ---

    /// Insert unless an open incident exists for the dedup key. A created
    /// incident comes back with the job queued for it; an existing one with
    /// `None`.
    async fn create_incident_if_absent(
        &self,
        new: NewIncident,
    ) -> Result<(NamespaceIncident, Option<InvestigationJob>)>;

    async fn get_incident(&self, id: i64) -> Result<Option<NamespaceIncident>>;

    async fn list_open_incidents(&self, cluster: &str) -> Result<Vec<NamespaceIncident>>;

    /// Set status; RESOLVED also stamps `resolved_at`.
    async fn update_incident_status(
        &self,
        id: i64,
        status: IncidentStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Move an ACTIVE incident to INVESTIGATING. Returns `false`, leaving the
    /// incident untouched, when it is in any other state.
    async fn begin_incident_investigation(&self, id: i64) -> Result<bool>;

    // --- investigation jobs ---

    async fn get_job(&self, id: i64) -> Result<Option<InvestigationJob>>;

    /// Pending jobs of the given kinds, oldest first.
    async fn list_pending_jobs(&self, kinds: &[JobKind]) -> Result<Vec<InvestigationJob>>;

    async fn mark_job_running(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        analysis_id: Option<i64>,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Jobs started at or after `since` in `cluster`, optionally narrowed to one namespace.
    async fn count_started_jobs(
        &self,
        since: DateTime<Utc>,
        cluster: &str,
        namespace: Option<&str>,
    ) -> Result<usize>;

    // --- analyses ---

    async fn insert_analysis(&self, new: NewAnalysis) -> Result<AnalysisRecord>;

    async fn get_analysis(&self, id: i64) -> Result<Option<AnalysisRecord>>;

    /// Record the analysis outcome on the entity a job investigated.
    /// `notify_status` of `None` leaves the stored value untouched.
    async fn set_target_outcome(
        &self,
        target: JobTarget,
        analysis_status: AnalysisStatus,
        notify_status: Option<NotifyStatus>,
        analysis_id: Option<i64>,
    ) -> Result<()>;
}

fn failed_via_update(id: i64) -> Error {
    Error::StorageError(format!("rollout {id} can only be failed through fail_rollout"))
}

/// Open the store selected by configuration.
pub fn open(settings: &Settings) -> Result<Arc<dyn Store>> {
    match &settings.store.sqlite_path {
        Some(path) => {
            info!(path = %path.display(), "Using SQLite store");
            Ok(Arc::new(SqliteStore::open(path)?))
        }
        None => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
