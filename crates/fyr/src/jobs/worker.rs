//! Investigation job worker.
//!
//! Pending jobs are taken oldest first and processed one at a time. A job
//! over the hourly caps, or whose caps cannot be read, stays pending for a
//! later pass. Once started, any failure is terminal for that job.

use chrono::{DateTime, Utc};
use notify::{AnalysisMessage, Notifier};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::rate_limit::{RateDecision, RateLimiter};
use crate::config::Settings;
use crate::diagnose::{AlertBrief, AlertContext, DiagnosticEngine, DiagnosticRequest};
use crate::error::{Error, Result};
use crate::model::{
    AnalysisStatus, InvestigationJob, JobKind, JobStatus, JobTarget, NewAnalysis, NotifyStatus,
};
use crate::namespace_cache::NamespaceCache;
use crate::service::run_every;
use crate::store::Store;
use crate::triage::triage;

/// Job kinds handled by the rollout sub-loop.
pub const ROLLOUT_JOBS: &[JobKind] = &[JobKind::Rollout];
/// Job kinds handled by the alert/namespace sub-loop.
pub const INVESTIGATION_JOBS: &[JobKind] = &[JobKind::Alert, JobKind::Namespace];

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerReport {
    pub deferred: usize,
    pub done: usize,
    pub failed: usize,
}

/// Everything needed to investigate a job and deliver the result.
struct Dispatch {
    request: DiagnosticRequest,
    notify_target: Option<String>,
    team: Option<String>,
    pipeline_url: Option<String>,
    annotations: BTreeMap<String, String>,
}

pub struct JobWorker {
    store: Arc<dyn Store>,
    namespaces: Arc<NamespaceCache>,
    engine: Arc<dyn DiagnosticEngine>,
    notifier: Arc<Notifier>,
    limiter: Arc<RateLimiter>,
    settings: Arc<Settings>,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn Store>,
        namespaces: Arc<NamespaceCache>,
        engine: Arc<dyn DiagnosticEngine>,
        notifier: Arc<Notifier>,
        limiter: Arc<RateLimiter>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            namespaces,
            engine,
            notifier,
            limiter,
            settings,
        }
    }

    /// Process pending jobs of `kinds` once.
    pub async fn run_pass(&self, kinds: &[JobKind], now: DateTime<Utc>) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();
        for job in self.store.list_pending_jobs(kinds).await? {
            let decision = match self.limiter.check(&job.scope, now).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "Rate limit check failed, leaving job pending");
                    report.deferred += 1;
                    continue;
                }
            };
            if let RateDecision::NamespaceCapped { started, cap }
            | RateDecision::ClusterCapped { started, cap } = decision
            {
                debug!(
                    job_id = job.id,
                    target = %job.target,
                    namespace = %job.scope.namespace,
                    started,
                    cap,
                    "Investigation deferred by rate limit"
                );
                report.deferred += 1;
                continue;
            }

            match self.process(&job, now).await {
                Ok(JobStatus::Done) => report.done += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "Failed to record job outcome");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    #[instrument(skip_all, fields(job_id = job.id, target = %job.target))]
    async fn process(&self, job: &InvestigationJob, now: DateTime<Utc>) -> Result<JobStatus> {
        self.store.mark_job_running(job.id, now).await?;

        let Err(e) = self.investigate(job).await else {
            return Ok(JobStatus::Done);
        };
        warn!(error = %e, "Investigation failed");
        if let Err(mark) = self
            .store
            .set_target_outcome(job.target, AnalysisStatus::Failed, None, None)
            .await
        {
            warn!(error = %mark, "Failed to mark analysis failed");
        }
        self.store
            .finish_job(
                job.id,
                JobStatus::Failed,
                None,
                Some(e.to_string()),
                Utc::now(),
            )
            .await?;
        Ok(JobStatus::Failed)
    }

    /// Diagnose, triage, store and deliver one running job.
    async fn investigate(&self, job: &InvestigationJob) -> Result<()> {
        let dispatch = self.prepare(job.target).await?;
        let analysis = self.engine.analyze(&dispatch.request).await?;

        let decision = triage(&analysis, &dispatch.request.context_text());
        let record = self
            .store
            .insert_analysis(NewAnalysis {
                job_id: job.id,
                target: job.target,
                analysis: analysis.clone(),
                triage_team: decision.team.to_string(),
                triage_reason: decision.reason.to_string(),
                created_at: Utc::now(),
            })
            .await?;

        let message = AnalysisMessage {
            reference: dispatch.request.reference.clone(),
            severity: analysis.severity,
            summary: analysis.summary,
            likely_cause: analysis.likely_cause,
            recommended_steps: analysis.recommended_steps,
            details: analysis.details,
            team: dispatch.team,
            triage_team: Some(decision.team.to_string()),
            pipeline_url: dispatch.pipeline_url,
            namespace_annotations: dispatch.annotations,
            created_at: record.created_at,
        };
        let sent = self
            .notifier
            .deliver(dispatch.notify_target.as_deref(), &message)
            .await;
        let notify_status = if sent {
            NotifyStatus::Sent
        } else {
            NotifyStatus::Failed
        };

        self.store
            .set_target_outcome(
                job.target,
                AnalysisStatus::Done,
                Some(notify_status),
                Some(record.id),
            )
            .await?;
        self.store
            .finish_job(job.id, JobStatus::Done, Some(record.id), None, Utc::now())
            .await?;

        info!(
            reference = %message.reference,
            team = %decision.team,
            notify = %notify_status,
            "Investigation complete"
        );
        Ok(())
    }

    /// Resolve the job target into the minimal reference the engine needs.
    async fn prepare(&self, target: JobTarget) -> Result<Dispatch> {
        match target {
            JobTarget::Rollout(id) => {
                let rollout = self
                    .store
                    .get_rollout(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("rollout {id}")))?;
                let metadata = rollout.metadata.clone();
                Ok(Dispatch {
                    request: DiagnosticRequest {
                        kind: JobKind::Rollout,
                        reference: rollout.reference(),
                        namespace: rollout.key.namespace.clone(),
                        deployment: Some(rollout.key.deployment.clone()),
                        failure: metadata.failure.clone(),
                        alert_context: None,
                        incident: None,
                    },
                    notify_target: metadata.notify_target,
                    team: metadata.team,
                    pipeline_url: metadata.pipeline_url,
                    annotations: metadata.namespace_annotations,
                })
            }
            JobTarget::AlertBatch(id) => {
                let batch = self
                    .store
                    .get_batch(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("alert batch {id}")))?;
                let alerts = self.store.list_batch_alerts(id).await?;

                let mut seen = BTreeSet::new();
                let briefs = alerts
                    .iter()
                    .filter(|a| seen.insert((a.name().to_string(), a.fingerprint.clone())))
                    .map(|a| AlertBrief {
                        name: a.name().to_string(),
                        severity: a.severity().to_string(),
                        description: a.description().map(str::to_string),
                        starts_at: a.starts_at,
                    })
                    .collect();
                let deployment = (batch.service != "unknown").then(|| batch.service.clone());
                let namespace = self.namespaces.get(&batch.namespace).await;

                Ok(Dispatch {
                    request: DiagnosticRequest {
                        kind: JobKind::Alert,
                        reference: batch.reference(),
                        namespace: batch.namespace.clone(),
                        deployment,
                        failure: None,
                        alert_context: Some(AlertContext {
                            text: batch.summary.clone(),
                            alerts: briefs,
                        }),
                        incident: None,
                    },
                    notify_target: namespace.notify_target,
                    team: namespace.team,
                    pipeline_url: None,
                    annotations: namespace.annotations,
                })
            }
            JobTarget::NamespaceIncident(id) => {
                let incident = self
                    .store
                    .get_incident(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("namespace incident {id}")))?;
                if !self.store.begin_incident_investigation(id).await? {
                    debug!(
                        incident = %incident.reference(),
                        status = %incident.status,
                        "Incident no longer active, status left as is"
                    );
                }
                let namespace = self.namespaces.get(&incident.namespace).await;

                Ok(Dispatch {
                    request: DiagnosticRequest {
                        kind: JobKind::Namespace,
                        reference: incident.reference(),
                        namespace: incident.namespace.clone(),
                        deployment: None,
                        failure: None,
                        alert_context: None,
                        incident: Some(json!({
                            "type": incident.incident_type,
                            "startedAt": incident.started_at,
                            "evidence": incident.metadata,
                        })),
                    },
                    notify_target: namespace.notify_target,
                    team: namespace.team,
                    pipeline_url: None,
                    annotations: namespace.annotations,
                })
            }
        }
    }

    async fn run_queue(&self, name: &'static str, kinds: &'static [JobKind], cancel: CancellationToken) {
        let interval = Duration::from_secs(self.settings.jobs.worker_interval_secs);
        run_every(name, interval, cancel, move || async move {
            match self.run_pass(kinds, Utc::now()).await {
                Ok(report) if report.done + report.failed + report.deferred > 0 => {
                    info!(queue = name, ?report, "Job pass complete");
                }
                Ok(_) => {}
                Err(e) => warn!(queue = name, error = %e, "Job pass failed"),
            }
        })
        .await;
    }

    /// Run the rollout and alert/namespace queues side by side until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tokio::join!(
            self.run_queue("rollout-jobs", ROLLOUT_JOBS, cancel.clone()),
            self.run_queue("investigation-jobs", INVESTIGATION_JOBS, cancel),
        );
    }
}
