//! Process-local store.
//!
//! All tables sit behind one lock so conditional creates are atomic.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{failed_via_update, Store};
use crate::alerts::should_investigate;
use crate::error::{Error, Result};
use crate::model::{
    AlertBatchRecord, AlertRecord, AlertStateRecord, AnalysisRecord, AnalysisStatus,
    IncidentStatus, InvestigationJob, JobKind, JobScope, JobStatus, JobTarget,
    NamespaceIncident, NewAlert, NewAlertBatch, NewAnalysis, NewIncident, NewRollout,
    NotifyStatus, Rollout, RolloutKey, RolloutMetadata, RolloutStatus,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    rollouts: BTreeMap<i64, Rollout>,
    rollout_keys: HashMap<RolloutKey, i64>,
    alerts: BTreeMap<i64, AlertRecord>,
    alert_states: HashMap<String, AlertStateRecord>,
    batches: BTreeMap<i64, AlertBatchRecord>,
    incidents: BTreeMap<i64, NamespaceIncident>,
    jobs: BTreeMap<i64, InvestigationJob>,
    analyses: BTreeMap<i64, AnalysisRecord>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn push_job(&mut self, target: JobTarget, scope: JobScope) -> InvestigationJob {
        let id = self.next_id();
        let job = InvestigationJob {
            id,
            target,
            scope,
            status: JobStatus::Pending,
            analysis_id: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.jobs.insert(id, job.clone());
        job
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Queue a job without going through its owner's lifecycle.
    pub(crate) async fn enqueue_job(&self, target: JobTarget, scope: JobScope) -> InvestigationJob {
        self.tables.write().await.push_job(target, scope)
    }
}

fn missing(what: &str, id: i64) -> Error {
    Error::NotFound(format!("{what} {id}"))
}

fn is_open(incident: &NamespaceIncident) -> bool {
    incident.status != IncidentStatus::Resolved
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_rollout_if_absent(&self, new: NewRollout) -> Result<(Rollout, bool)> {
        let mut t = self.tables.write().await;
        if let Some(existing) = t.rollout_keys.get(&new.key).and_then(|id| t.rollouts.get(id)) {
            return Ok((existing.clone(), false));
        }
        let id = t.next_id();
        let rollout = Rollout {
            id,
            key: new.key.clone(),
            status: new.status,
            analysis_status: AnalysisStatus::Pending,
            notify_status: NotifyStatus::Pending,
            origin: new.origin,
            metadata: new.metadata,
            started_at: new.started_at,
            completed_at: None,
            failed_at: None,
            analysis_id: None,
        };
        t.rollout_keys.insert(new.key, id);
        t.rollouts.insert(id, rollout.clone());
        Ok((rollout, true))
    }

    async fn get_rollout(&self, id: i64) -> Result<Option<Rollout>> {
        Ok(self.tables.read().await.rollouts.get(&id).cloned())
    }

    async fn find_rollout(&self, key: &RolloutKey) -> Result<Option<Rollout>> {
        let t = self.tables.read().await;
        Ok(t.rollout_keys.get(key).and_then(|id| t.rollouts.get(id)).cloned())
    }

    async fn update_rollout_metadata(&self, id: i64, metadata: &RolloutMetadata) -> Result<()> {
        let mut t = self.tables.write().await;
        let rollout = t.rollouts.get_mut(&id).ok_or_else(|| missing("rollout", id))?;
        rollout.metadata.merge(metadata);
        Ok(())
    }

    async fn update_rollout_status(
        &self,
        id: i64,
        status: RolloutStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if status == RolloutStatus::Failed {
            return Err(failed_via_update(id));
        }
        let mut t = self.tables.write().await;
        let rollout = t.rollouts.get_mut(&id).ok_or_else(|| missing("rollout", id))?;
        rollout.status = status;
        if status == RolloutStatus::Success {
            rollout.completed_at = Some(at);
        }
        Ok(())
    }

    async fn fail_rollout(
        &self,
        id: i64,
        failure: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<InvestigationJob>> {
        let mut t = self.tables.write().await;
        let rollout = t.rollouts.get_mut(&id).ok_or_else(|| missing("rollout", id))?;
        if rollout.status.is_terminal() {
            return Ok(None);
        }
        rollout.status = RolloutStatus::Failed;
        rollout.failed_at = Some(at);
        rollout.metadata.failure = Some(failure.to_string());
        let scope = JobScope {
            cluster: rollout.key.cluster.clone(),
            namespace: rollout.key.namespace.clone(),
        };
        Ok(Some(t.push_job(JobTarget::Rollout(id), scope)))
    }

    async fn list_active_rollouts(&self, cluster: &str) -> Result<Vec<Rollout>> {
        let t = self.tables.read().await;
        Ok(t.rollouts
            .values()
            .filter(|r| r.key.cluster == cluster && !r.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn record_alert(
        &self,
        new: NewAlert,
        throttle_window: Duration,
    ) -> Result<(AlertRecord, bool)> {
        let mut t = self.tables.write().await;
        let prior = t.alert_states.get(&new.fingerprint);
        let investigate = should_investigate(new.status, prior, new.received_at, throttle_window);
        let last_investigated_at = if investigate {
            Some(new.received_at)
        } else {
            prior.and_then(|state| state.last_investigated_at)
        };
        t.alert_states.insert(
            new.fingerprint.clone(),
            AlertStateRecord {
                fingerprint: new.fingerprint.clone(),
                status: new.status,
                last_received_at: new.received_at,
                last_investigated_at,
            },
        );

        let id = t.next_id();
        let record = AlertRecord {
            id,
            fingerprint: new.fingerprint,
            status: new.status,
            starts_at: new.starts_at,
            ends_at: new.ends_at,
            labels: new.labels,
            annotations: new.annotations,
            raw: new.raw,
            received_at: new.received_at,
            batched: !investigate,
            batch_id: None,
        };
        t.alerts.insert(id, record.clone());
        Ok((record, investigate))
    }

    async fn get_alert_state(&self, fingerprint: &str) -> Result<Option<AlertStateRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .alert_states
            .get(fingerprint)
            .cloned())
    }

    async fn list_unbatched_alerts(&self, since: DateTime<Utc>) -> Result<Vec<AlertRecord>> {
        let t = self.tables.read().await;
        Ok(t.alerts
            .values()
            .filter(|a| !a.batched && a.received_at >= since)
            .cloned()
            .collect())
    }

    async fn create_batch(
        &self,
        new: NewAlertBatch,
        alert_ids: &[i64],
        scope: JobScope,
    ) -> Result<Option<(AlertBatchRecord, InvestigationJob)>> {
        let mut t = self.tables.write().await;
        let claimable: Vec<i64> = alert_ids
            .iter()
            .copied()
            .filter(|id| t.alerts.get(id).is_some_and(|a| !a.batched))
            .collect();
        if claimable.is_empty() {
            return Ok(None);
        }

        let id = t.next_id();
        for alert_id in claimable {
            if let Some(alert) = t.alerts.get_mut(&alert_id) {
                alert.batched = true;
                alert.batch_id = Some(id);
            }
        }
        let batch = AlertBatchRecord {
            id,
            primary_fingerprint: new.primary_fingerprint,
            namespace: new.namespace,
            service: new.service,
            window_start: new.window_start,
            window_end: new.window_end,
            summary: new.summary,
            analysis_status: AnalysisStatus::Pending,
            notify_status: NotifyStatus::Pending,
            analysis_id: None,
            created_at: new.created_at,
        };
        t.batches.insert(id, batch.clone());
        let job = t.push_job(JobTarget::AlertBatch(id), scope);
        Ok(Some((batch, job)))
    }

    async fn get_batch(&self, id: i64) -> Result<Option<AlertBatchRecord>> {
        Ok(self.tables.read().await.batches.get(&id).cloned())
    }

    async fn list_batch_alerts(&self, batch_id: i64) -> Result<Vec<AlertRecord>> {
        let t = self.tables.read().await;
        Ok(t.alerts
            .values()
            .filter(|a| a.batch_id == Some(batch_id))
            .cloned()
            .collect())
    }

    async fn create_incident_if_absent(
        &self,
        new: NewIncident,
    ) -> Result<(NamespaceIncident, Option<InvestigationJob>)> {
        let mut t = self.tables.write().await;
        if let Some(existing) = t.incidents.values().find(|i| {
            is_open(i)
                && i.cluster == new.cluster
                && i.namespace == new.namespace
                && i.incident_type == new.incident_type
        }) {
            return Ok((existing.clone(), None));
        }
        let id = t.next_id();
        let incident = NamespaceIncident {
            id,
            cluster: new.cluster,
            namespace: new.namespace,
            incident_type: new.incident_type,
            status: IncidentStatus::Active,
            started_at: new.started_at,
            resolved_at: None,
            analysis_status: AnalysisStatus::Pending,
            notify_status: NotifyStatus::Pending,
            analysis_id: None,
            metadata: new.metadata,
        };
        t.incidents.insert(id, incident.clone());
        let job = t.push_job(
            JobTarget::NamespaceIncident(id),
            JobScope {
                cluster: incident.cluster.clone(),
                namespace: incident.namespace.clone(),
            },
        );
        Ok((incident, Some(job)))
    }

    async fn get_incident(&self, id: i64) -> Result<Option<NamespaceIncident>> {
        Ok(self.tables.read().await.incidents.get(&id).cloned())
    }

    async fn list_open_incidents(&self, cluster: &str) -> Result<Vec<NamespaceIncident>> {
        let t = self.tables.read().await;
        Ok(t.incidents
            .values()
            .filter(|i| is_open(i) && i.cluster == cluster)
            .cloned()
            .collect())
    }

    async fn update_incident_status(
        &self,
        id: i64,
        status: IncidentStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut t = self.tables.write().await;
        let incident = t.incidents.get_mut(&id).ok_or_else(|| missing("incident", id))?;
        incident.status = status;
        if status == IncidentStatus::Resolved {
            incident.resolved_at = Some(at);
        }
        Ok(())
    }

    async fn begin_incident_investigation(&self, id: i64) -> Result<bool> {
        let mut t = self.tables.write().await;
        let incident = t.incidents.get_mut(&id).ok_or_else(|| missing("incident", id))?;
        if incident.status != IncidentStatus::Active {
            return Ok(false);
        }
        incident.status = IncidentStatus::Investigating;
        Ok(true)
    }

    async fn get_job(&self, id: i64) -> Result<Option<InvestigationJob>> {
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn list_pending_jobs(&self, kinds: &[JobKind]) -> Result<Vec<InvestigationJob>> {
        let t = self.tables.read().await;
        Ok(t.jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && kinds.contains(&j.target.kind()))
            .cloned()
            .collect())
    }

    async fn mark_job_running(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.write().await;
        let job = t.jobs.get_mut(&id).ok_or_else(|| missing("job", id))?;
        job.status = JobStatus::Running;
        job.started_at = Some(at);
        Ok(())
    }

    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        analysis_id: Option<i64>,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut t = self.tables.write().await;
        let job = t.jobs.get_mut(&id).ok_or_else(|| missing("job", id))?;
        job.status = status;
        job.analysis_id = analysis_id;
        job.error = error;
        job.finished_at = Some(at);
        Ok(())
    }

    async fn count_started_jobs(
        &self,
        since: DateTime<Utc>,
        cluster: &str,
        namespace: Option<&str>,
    ) -> Result<usize> {
        let t = self.tables.read().await;
        Ok(t.jobs
            .values()
            .filter(|j| j.started_at.is_some_and(|at| at >= since))
            .filter(|j| j.scope.cluster == cluster)
            .filter(|j| namespace.is_none_or(|ns| j.scope.namespace == ns))
            .count())
    }

    async fn insert_analysis(&self, new: NewAnalysis) -> Result<AnalysisRecord> {
        let mut t = self.tables.write().await;
        let id = t.next_id();
        let record = AnalysisRecord {
            id,
            job_id: new.job_id,
            target: new.target,
            analysis: new.analysis,
            triage_team: new.triage_team,
            triage_reason: new.triage_reason,
            created_at: new.created_at,
        };
        t.analyses.insert(id, record.clone());
        Ok(record)
    }

    async fn get_analysis(&self, id: i64) -> Result<Option<AnalysisRecord>> {
        Ok(self.tables.read().await.analyses.get(&id).cloned())
    }

    async fn set_target_outcome(
        &self,
        target: JobTarget,
        analysis_status: AnalysisStatus,
        notify_status: Option<NotifyStatus>,
        analysis_id: Option<i64>,
    ) -> Result<()> {
        let mut t = self.tables.write().await;
        let (analysis, notify, stored_id) = match target {
            JobTarget::Rollout(id) => {
                let r = t.rollouts.get_mut(&id).ok_or_else(|| missing("rollout", id))?;
                (&mut r.analysis_status, &mut r.notify_status, &mut r.analysis_id)
            }
            JobTarget::AlertBatch(id) => {
                let b = t.batches.get_mut(&id).ok_or_else(|| missing("alert batch", id))?;
                (&mut b.analysis_status, &mut b.notify_status, &mut b.analysis_id)
            }
            JobTarget::NamespaceIncident(id) => {
                let i = t.incidents.get_mut(&id).ok_or_else(|| missing("incident", id))?;
                (&mut i.analysis_status, &mut i.notify_status, &mut i.analysis_id)
            }
        };
        *analysis = analysis_status;
        if let Some(status) = notify_status {
            *notify = status;
        }
        if analysis_id.is_some() {
            *stored_id = analysis_id;
        }
        Ok(())
    }
}
