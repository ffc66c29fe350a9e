//! Periodic reconciliation of active rollouts against live cluster state.
//!
//! Sole writer of rollout status once a rollout exists. A rollout that turns
//! FAILED gets exactly one investigation job, written in the same store step
//! as the transition, so a failed write leaves the rollout active for the
//! next pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::phase::{evaluate_phase, Phase, PodFailureSignals};
use crate::cluster::ClusterClient;
use crate::config::Settings;
use crate::error::Result;
use crate::model::{Rollout, RolloutStatus};
use crate::service::run_every;
use crate::store::Store;

/// Why a rollout was failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Most pods are crash-looping or cannot pull their image
    PodFailures,
    /// `Progressing=False`
    ProgressDeadline,
    /// Still not stable when the rollout timeout elapsed
    Timeout,
}

impl FailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PodFailures => "pod_failures",
            Self::ProgressDeadline => "progress_deadline",
            Self::Timeout => "timeout",
        }
    }
}

/// Result of reconciling one rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Workload could not be read; retried next pass
    Unreachable,
    Unchanged,
    Progressed(RolloutStatus),
    Succeeded,
    Failed(FailureReason),
}

/// Report from one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub progressed: usize,
    pub unreachable: usize,
    pub errors: usize,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterClient>,
    settings: Arc<Settings>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        cluster: Arc<dyn ClusterClient>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            cluster,
            settings,
        }
    }

    /// Reconcile every active rollout once.
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let rollouts = self
            .store
            .list_active_rollouts(&self.settings.cluster_name)
            .await?;

        let mut report = ReconcileReport {
            checked: rollouts.len(),
            ..ReconcileReport::default()
        };

        for rollout in &rollouts {
            match self.reconcile_rollout(rollout, now).await {
                Ok(ReconcileOutcome::Unreachable) => report.unreachable += 1,
                Ok(ReconcileOutcome::Unchanged) => {}
                Ok(ReconcileOutcome::Progressed(_)) => report.progressed += 1,
                Ok(ReconcileOutcome::Succeeded) => report.succeeded += 1,
                Ok(ReconcileOutcome::Failed(_)) => report.failed += 1,
                Err(e) => {
                    warn!(rollout = %rollout.reference(), error = %e, "Failed to reconcile rollout");
                    report.errors += 1;
                }
            }
        }

        if report.succeeded + report.failed + report.progressed > 0 {
            info!(
                "Reconciliation complete: {} checked, {} succeeded, {} failed, {} progressed",
                report.checked, report.succeeded, report.failed, report.progressed
            );
        }
        Ok(report)
    }

    #[instrument(skip_all, fields(rollout = %rollout.reference()))]
    pub async fn reconcile_rollout(
        &self,
        rollout: &Rollout,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let key = &rollout.key;
        let workload = match self.cluster.get_workload(&key.namespace, &key.deployment).await {
            Ok(Some(workload)) => workload,
            Ok(None) => {
                debug!("Deployment not found, retrying next pass");
                return Ok(ReconcileOutcome::Unreachable);
            }
            Err(e) => {
                warn!(error = %e, "Failed to read deployment, retrying next pass");
                return Ok(ReconcileOutcome::Unreachable);
            }
        };

        if workload.selector.is_empty() {
            debug!("Deployment has no usable label selector, skipping pod analysis");
        } else {
            match self.cluster.list_pods(&key.namespace, &workload.selector).await {
                Ok(pods) => {
                    let signals = PodFailureSignals::from_pods(&pods);
                    if signals.should_fail_early() {
                        info!(
                            crashloop = signals.crashloop_pods,
                            image_pull = signals.image_pull_pods,
                            total = signals.total_pods,
                            "Majority of pods failing, failing rollout early"
                        );
                        return self
                            .fail(rollout, FailureReason::PodFailures, &signals.describe(), now)
                            .await;
                    }
                }
                Err(e) => warn!(error = %e, "Pod analysis failed"),
            }
        }

        let phase = evaluate_phase(&workload);
        match phase {
            Phase::Stable => {
                self.store
                    .update_rollout_status(rollout.id, RolloutStatus::Success, now)
                    .await?;
                info!("Rollout succeeded");
                Ok(ReconcileOutcome::Succeeded)
            }
            Phase::FailedProgress => {
                self.fail(rollout, FailureReason::ProgressDeadline, "Progressing=False", now)
                    .await
            }
            Phase::Pending | Phase::RollingOut => {
                if now - rollout.started_at > self.settings.rollout_timeout() {
                    let detail = format!(
                        "not stable after {}s",
                        self.settings.reconcile.rollout_timeout_secs
                    );
                    return self.fail(rollout, FailureReason::Timeout, &detail, now).await;
                }
                let status = phase.in_flight_status();
                if status == rollout.status {
                    return Ok(ReconcileOutcome::Unchanged);
                }
                self.store.update_rollout_status(rollout.id, status, now).await?;
                debug!(status = %status, "Rollout status updated");
                Ok(ReconcileOutcome::Progressed(status))
            }
        }
    }

    async fn fail(
        &self,
        rollout: &Rollout,
        reason: FailureReason,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let failure = format!("{}: {detail}", reason.as_str());
        let Some(job) = self.store.fail_rollout(rollout.id, &failure, now).await? else {
            debug!("Rollout already terminal, nothing to fail");
            return Ok(ReconcileOutcome::Unchanged);
        };
        info!(failure = %failure, job_id = job.id, "Rollout failed, investigation queued");
        Ok(ReconcileOutcome::Failed(reason))
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.settings.reconcile.interval_secs);
        run_every("reconcile", interval, cancel, move || async move {
            if let Err(e) = self.reconcile_once(Utc::now()).await {
                warn!(error = %e, "Reconciliation pass failed");
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::{PodSummary, WorkloadCondition, WorkloadObject};
    use crate::model::{JobKind, JobTarget, NewRollout, RolloutKey, RolloutMetadata};
    use crate::store::faulty::FaultyStore;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;

    struct Harness {
        store: Arc<MemoryStore>,
        cluster: Arc<FakeCluster>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let cluster = Arc::new(FakeCluster::default());
        let reconciler =
            Reconciler::new(store.clone(), cluster.clone(), Arc::new(Settings::default()));
        Harness {
            store,
            cluster,
            reconciler,
        }
    }

    fn workload(available: i32, conditions: &[(&str, &str)]) -> WorkloadObject {
        WorkloadObject {
            namespace: "shop".to_string(),
            name: "web".to_string(),
            generation: 2,
            desired_replicas: 3,
            available_replicas: Some(available),
            conditions: conditions
                .iter()
                .map(|(kind, status)| WorkloadCondition {
                    kind: (*kind).to_string(),
                    status: (*status).to_string(),
                })
                .collect(),
            selector: "app=web".to_string(),
            ..WorkloadObject::default()
        }
    }

    fn pod(reason: Option<&str>) -> PodSummary {
        PodSummary {
            name: "web-x".to_string(),
            phase: "Running".to_string(),
            waiting_reasons: reason.into_iter().map(str::to_string).collect(),
        }
    }

    async fn track(store: &dyn Store, status: RolloutStatus, started_at: DateTime<Utc>) -> Rollout {
        store
            .create_rollout_if_absent(NewRollout {
                key: RolloutKey {
                    cluster: "ci-cluster".to_string(),
                    namespace: "shop".to_string(),
                    deployment: "web".to_string(),
                    generation: 2,
                },
                status,
                origin: "k8s".to_string(),
                metadata: RolloutMetadata::default(),
                started_at,
            })
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn test_stable_rollout_succeeds_without_job() {
        let h = harness();
        h.cluster.put_workload(workload(3, &[]));
        let rollout = track(h.store.as_ref(), RolloutStatus::RollingOut, Utc::now()).await;

        let report = h.reconciler.reconcile_once(Utc::now()).await.unwrap();
        assert_eq!(report.succeeded, 1);
        let stored = h.store.get_rollout(rollout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RolloutStatus::Success);
        assert!(stored.completed_at.is_some());
        assert!(h.store.list_pending_jobs(&[JobKind::Rollout]).await.unwrap().is_empty());

        let second = h.reconciler.reconcile_once(Utc::now()).await.unwrap();
        assert_eq!(second.checked, 0);
    }

    #[tokio::test]
    async fn test_crashloop_majority_fails_early_and_queues_job() {
        let h = harness();
        h.cluster.put_workload(workload(0, &[]));
        h.cluster.put_pods(
            "shop",
            vec![
                pod(Some("CrashLoopBackOff")),
                pod(Some("CrashLoopBackOff")),
                pod(Some("CrashLoopBackOff")),
                pod(None),
                pod(None),
            ],
        );
        let rollout = track(h.store.as_ref(), RolloutStatus::RollingOut, Utc::now()).await;

        let outcome = h.reconciler.reconcile_rollout(&rollout, Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Failed(FailureReason::PodFailures));

        let jobs = h.store.list_pending_jobs(&[JobKind::Rollout]).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].target, JobTarget::Rollout(rollout.id));
        assert_eq!(jobs[0].scope.namespace, "shop");

        let stored = h.store.get_rollout(rollout.id).await.unwrap().unwrap();
        assert_eq!(
            stored.metadata.failure.as_deref(),
            Some("pod_failures: 3/5 pods CrashLoopBackOff")
        );
    }

    #[tokio::test]
    async fn test_minority_crashloop_keeps_rolling() {
        let h = harness();
        h.cluster.put_workload(workload(1, &[]));
        h.cluster.put_pods(
            "shop",
            vec![pod(Some("CrashLoopBackOff")), pod(None), pod(None), pod(None), pod(None)],
        );
        let rollout = track(h.store.as_ref(), RolloutStatus::RollingOut, Utc::now()).await;

        let outcome = h.reconciler.reconcile_rollout(&rollout, Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_selectorless_workload_skips_pod_analysis() {
        let h = harness();
        let mut selectorless = workload(0, &[]);
        selectorless.selector = String::new();
        h.cluster.put_workload(selectorless);
        h.cluster
            .put_pods("shop", vec![pod(Some("CrashLoopBackOff")), pod(Some("CrashLoopBackOff"))]);
        let rollout = track(h.store.as_ref(), RolloutStatus::RollingOut, Utc::now()).await;

        let outcome = h.reconciler.reconcile_rollout(&rollout, Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(h.store.list_pending_jobs(&[JobKind::Rollout]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_progress_deadline_fails() {
        let h = harness();
        h.cluster.put_workload(workload(0, &[("Progressing", "False")]));
        let rollout = track(h.store.as_ref(), RolloutStatus::RollingOut, Utc::now()).await;

        let outcome = h.reconciler.reconcile_rollout(&rollout, Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Failed(FailureReason::ProgressDeadline));
        let stored = h.store.get_rollout(rollout.id).await.unwrap().unwrap();
        assert!(stored.failed_at.is_some());
        assert_eq!(
            stored.metadata.failure.as_deref(),
            Some("progress_deadline: Progressing=False")
        );
    }

    #[tokio::test]
    async fn test_timeout_fails_slow_rollout() {
        let h = harness();
        h.cluster.put_workload(workload(1, &[]));
        let started = Utc::now() - ChronoDuration::minutes(16);
        let rollout = track(h.store.as_ref(), RolloutStatus::RollingOut, started).await;

        let outcome = h.reconciler.reconcile_rollout(&rollout, Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Failed(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn test_stale_snapshot_does_not_fail_twice() {
        let h = harness();
        h.cluster.put_workload(workload(0, &[("Progressing", "False")]));
        let rollout = track(h.store.as_ref(), RolloutStatus::RollingOut, Utc::now()).await;

        let first = h.reconciler.reconcile_rollout(&rollout, Utc::now()).await.unwrap();
        assert_eq!(first, ReconcileOutcome::Failed(FailureReason::ProgressDeadline));
        let replay = h.reconciler.reconcile_rollout(&rollout, Utc::now()).await.unwrap();
        assert_eq!(replay, ReconcileOutcome::Unchanged);
        assert_eq!(h.store.list_pending_jobs(&[JobKind::Rollout]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_rollout_active_for_next_pass() {
        let store = Arc::new(FaultyStore::new());
        let cluster = Arc::new(FakeCluster::default());
        let reconciler =
            Reconciler::new(store.clone(), cluster.clone(), Arc::new(Settings::default()));
        cluster.put_workload(workload(0, &[("Progressing", "False")]));
        let rollout = track(store.as_ref(), RolloutStatus::RollingOut, Utc::now()).await;

        store.fail_next("fail_rollout");
        let report = reconciler.reconcile_once(Utc::now()).await.unwrap();
        assert_eq!(report.errors, 1);
        let stored = store.get_rollout(rollout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RolloutStatus::RollingOut);
        assert!(store.list_pending_jobs(&[JobKind::Rollout]).await.unwrap().is_empty());

        let retry = reconciler.reconcile_once(Utc::now()).await.unwrap();
        assert_eq!(retry.failed, 1);
        let stored = store.get_rollout(rollout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RolloutStatus::Failed);
        assert_eq!(store.list_pending_jobs(&[JobKind::Rollout]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_written_only_on_change() {
        let h = harness();
        h.cluster.put_workload(workload(0, &[("Available", "False")]));
        let rollout = track(h.store.as_ref(), RolloutStatus::RollingOut, Utc::now()).await;

        let outcome = h.reconciler.reconcile_rollout(&rollout, Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Progressed(RolloutStatus::Pending));

        let stored = h.store.get_rollout(rollout.id).await.unwrap().unwrap();
        let outcome = h.reconciler.reconcile_rollout(&stored, Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_unreachable_workload_changes_nothing() {
        let h = harness();
        h.cluster.put_workload(workload(0, &[("Progressing", "False")]));
        h.cluster.unreachable.lock().unwrap().push("web".to_string());
        let rollout = track(h.store.as_ref(), RolloutStatus::RollingOut, Utc::now()).await;

        let report = h.reconciler.reconcile_once(Utc::now()).await.unwrap();
        assert_eq!(report.unreachable, 1);
        let stored = h.store.get_rollout(rollout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RolloutStatus::RollingOut);
    }
}
