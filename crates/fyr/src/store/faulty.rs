//! Test double that fails chosen store operations once.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Mutex;

use super::{MemoryStore, Store};
use crate::error::{Error, Result};
use crate::model::{
    AlertBatchRecord, AlertRecord, AlertStateRecord, AnalysisRecord, AnalysisStatus,
    IncidentStatus, InvestigationJob, JobKind, JobScope, JobStatus, JobTarget,
    NamespaceIncident, NewAlert, NewAlertBatch, NewAnalysis, NewIncident, NewRollout,
    NotifyStatus, Rollout, RolloutKey, RolloutMetadata, RolloutStatus,
};

/// Wraps a [`MemoryStore`]; each operation named in `fail_next` errors on its
/// next call and then behaves normally again.
#[derive(Default)]
pub(crate) struct FaultyStore {
    pub(crate) inner: MemoryStore,
    armed: Mutex<HashSet<&'static str>>,
}

impl FaultyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_next(&self, op: &'static str) {
        self.armed.lock().unwrap().insert(op);
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.armed.lock().unwrap().remove(op) {
            return Err(Error::StorageError(format!("injected failure in {op}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn create_rollout_if_absent(&self, new: NewRollout) -> Result<(Rollout, bool)> {
        self.check("create_rollout_if_absent")?;
        self.inner.create_rollout_if_absent(new).await
    }

    async fn get_rollout(&self, id: i64) -> Result<Option<Rollout>> {
        self.check("get_rollout")?;
        self.inner.get_rollout(id).await
    }

    async fn find_rollout(&self, key: &RolloutKey) -> Result<Option<Rollout>> {
        self.check("find_rollout")?;
        self.inner.find_rollout(key).await
    }

    async fn update_rollout_metadata(&self, id: i64, metadata: &RolloutMetadata) -> Result<()> {
        self.check("update_rollout_metadata")?;
        self.inner.update_rollout_metadata(id, metadata).await
    }

    async fn update_rollout_status(
        &self,
        id: i64,
        status: RolloutStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check("update_rollout_status")?;
        self.inner.update_rollout_status(id, status, at).await
    }

    async fn fail_rollout(
        &self,
        id: i64,
        failure: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<InvestigationJob>> {
        self.check("fail_rollout")?;
        self.inner.fail_rollout(id, failure, at).await
    }

    async fn list_active_rollouts(&self, cluster: &str) -> Result<Vec<Rollout>> {
        self.check("list_active_rollouts")?;
        self.inner.list_active_rollouts(cluster).await
    }

    async fn record_alert(
        &self,
        new: NewAlert,
        throttle_window: Duration,
    ) -> Result<(AlertRecord, bool)> {
        self.check("record_alert")?;
        self.inner.record_alert(new, throttle_window).await
    }

    async fn get_alert_state(&self, fingerprint: &str) -> Result<Option<AlertStateRecord>> {
        self.check("get_alert_state")?;
        self.inner.get_alert_state(fingerprint).await
    }

    async fn list_unbatched_alerts(&self, since: DateTime<Utc>) -> Result<Vec<AlertRecord>> {
        self.check("list_unbatched_alerts")?;
        self.inner.list_unbatched_alerts(since).await
    }

    async fn create_batch(
        &self,
        new: NewAlertBatch,
        alert_ids: &[i64],
        scope: JobScope,
    ) -> Result<Option<(AlertBatchRecord, InvestigationJob)>> {
        self.check("create_batch")?;
        self.inner.create_batch(new, alert_ids, scope).await
    }

    async fn get_batch(&self, id: i64) -> Result<Option<AlertBatchRecord>> {
        self.check("get_batch")?;
        self.inner.get_batch(id).await
    }

    async fn list_batch_alerts(&self, batch_id: i64) -> Result<Vec<AlertRecord>> {
        self.check("list_batch_alerts")?;
        self.inner.list_batch_alerts(batch_id).await
    }

    async fn create_incident_if_absent(
        &self,
        new: NewIncident,
    ) -> Result<(NamespaceIncident, Option<InvestigationJob>)> {
        self.check("create_incident_if_absent")?;
        self.inner.create_incident_if_absent(new).await
    }

    async fn get_incident(&self, id: i64) -> Result<Option<NamespaceIncident>> {
        self.check("get_incident")?;
        self.inner.get_incident(id).await
    }

    async fn list_open_incidents(&self, cluster: &str) -> Result<Vec<NamespaceIncident>> {
        self.check("list_open_incidents")?;
        self.inner.list_open_incidents(cluster).await
    }

    async fn update_incident_status(
        &self,
        id: i64,
        status: IncidentStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check("update_incident_status")?;
        self.inner.update_incident_status(id, status, at).await
    }

    async fn begin_incident_investigation(&self, id: i64) -> Result<bool> {
        self.check("begin_incident_investigation")?;
        self.inner.begin_incident_investigation(id).await
    }

    async fn get_job(&self, id: i64) -> Result<Option<InvestigationJob>> {
        self.check("get_job")?;
        self.inner.get_job(id).await
    }

    async fn list_pending_jobs(&self, kinds: &[JobKind]) -> Result<Vec<InvestigationJob>> {
        self.check("list_pending_jobs")?;
        self.inner.list_pending_jobs(kinds).await
    }

    async fn mark_job_running(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.check("mark_job_running")?;
        self.inner.mark_job_running(id, at).await
    }

    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        analysis_id: Option<i64>,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check("finish_job")?;
        self.inner.finish_job(id, status, analysis_id, error, at).await
    }

    async fn count_started_jobs(
        &self,
        since: DateTime<Utc>,
        cluster: &str,
        namespace: Option<&str>,
    ) -> Result<usize> {
        self.check("count_started_jobs")?;
        self.inner.count_started_jobs(since, cluster, namespace).await
    }

    async fn insert_analysis(&self, new: NewAnalysis) -> Result<AnalysisRecord> {
        self.check("insert_analysis")?;
        self.inner.insert_analysis(new).await
    }

    async fn get_analysis(&self, id: i64) -> Result<Option<AnalysisRecord>> {
        self.check("get_analysis")?;
        self.inner.get_analysis(id).await
    }

    async fn set_target_outcome(
        &self,
        target: JobTarget,
        analysis_status: AnalysisStatus,
        notify_status: Option<NotifyStatus>,
        analysis_id: Option<i64>,
    ) -> Result<()> {
        self.check("set_target_outcome")?;
        self.inner
            .set_target_outcome(target, analysis_status, notify_status, analysis_id)
            .await
    }
}
