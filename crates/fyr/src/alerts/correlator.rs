//! Alert correlation: groups recent unbatched alerts by (namespace, service)
//! and queues one investigation per batch.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{window_start, Settings};
use crate::error::Result;
use crate::model::{AlertRecord, JobScope, NewAlertBatch};
use crate::service::run_every;
use crate::store::Store;

/// Grouping key: namespace label (or `default`) and service/app label (or `unknown`).
pub fn correlation_key(alert: &AlertRecord) -> (String, String) {
    let namespace = alert
        .labels
        .get("namespace")
        .filter(|v| !v.is_empty())
        .map_or("default", String::as_str);
    let service = alert
        .labels
        .get("service")
        .filter(|v| !v.is_empty())
        .or_else(|| alert.labels.get("app").filter(|v| !v.is_empty()))
        .map_or("unknown", String::as_str);
    (namespace.to_string(), service.to_string())
}

/// Report from one batching pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub unbatched: usize,
    pub groups: usize,
    pub batches_created: usize,
    pub below_minimum: usize,
}

pub struct AlertCorrelator {
    store: Arc<dyn Store>,
    settings: Arc<Settings>,
}

impl AlertCorrelator {
    pub fn new(store: Arc<dyn Store>, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<BatchReport> {
        let since = window_start(now, self.settings.correlation_window());
        let alerts = self.store.list_unbatched_alerts(since).await?;
        let mut report = BatchReport {
            unbatched: alerts.len(),
            ..BatchReport::default()
        };
        if alerts.is_empty() {
            return Ok(report);
        }

        let mut groups: BTreeMap<(String, String), Vec<AlertRecord>> = BTreeMap::new();
        for alert in alerts {
            groups.entry(correlation_key(&alert)).or_default().push(alert);
        }
        report.groups = groups.len();

        for ((namespace, service), group) in groups {
            if group.len() < self.settings.alerts.batch_min_count {
                debug!(
                    namespace = %namespace,
                    service = %service,
                    size = group.len(),
                    "Group below batch minimum, waiting"
                );
                report.below_minimum += 1;
                continue;
            }
            match self.create_batch(&namespace, &service, &group, now).await {
                Ok(true) => report.batches_created += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    namespace = %namespace,
                    service = %service,
                    error = %e,
                    "Failed to create alert batch"
                ),
            }
        }
        Ok(report)
    }

    async fn create_batch(
        &self,
        namespace: &str,
        service: &str,
        group: &[AlertRecord],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(first) = group.first() else {
            return Ok(false);
        };
        let names: BTreeSet<&str> = group.iter().map(AlertRecord::name).collect();
        let summary = format!(
            "Batch of {} alerts for {namespace}/{service}. Alerts: {}",
            group.len(),
            names.into_iter().collect::<Vec<_>>().join(", ")
        );
        let window_start = group
            .iter()
            .map(|a| a.starts_at.unwrap_or(a.received_at))
            .min()
            .unwrap_or(now);
        let window_end = group.iter().map(|a| a.received_at).max().unwrap_or(now);
        let ids: Vec<i64> = group.iter().map(|a| a.id).collect();

        let scope = JobScope {
            cluster: self.settings.cluster_name.clone(),
            namespace: namespace.to_string(),
        };
        let Some((batch, job)) = self
            .store
            .create_batch(
                NewAlertBatch {
                    primary_fingerprint: first.fingerprint.clone(),
                    namespace: namespace.to_string(),
                    service: service.to_string(),
                    window_start,
                    window_end,
                    summary,
                    created_at: now,
                },
                &ids,
                scope,
            )
            .await?
        else {
            debug!(namespace, service, "Alerts already batched elsewhere");
            return Ok(false);
        };

        info!(
            batch = %batch.reference(),
            alerts = group.len(),
            job_id = job.id,
            "Created alert batch"
        );
        Ok(true)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.settings.alerts.batch_interval_secs);
        run_every("alert-batcher", interval, cancel, move || async move {
            if let Err(e) = self.run_once(Utc::now()).await {
                warn!(error = %e, "Alert batching pass failed");
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertStatus, JobKind, NewAlert};
    use crate::store::faulty::FaultyStore;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    async fn record(store: &dyn Store, name: &str, labels: &[(&str, &str)], at: DateTime<Utc>) {
        let mut labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        labels.insert("alertname".to_string(), name.to_string());
        let new = NewAlert {
            fingerprint: format!("fp-{name}"),
            status: AlertStatus::Firing,
            starts_at: Some(at - ChronoDuration::minutes(1)),
            ends_at: None,
            labels,
            annotations: BTreeMap::new(),
            raw: json!({}),
            received_at: at,
        };
        let (_, admitted) = store.record_alert(new, ChronoDuration::hours(24)).await.unwrap();
        assert!(admitted);
    }

    fn correlator(store: Arc<dyn Store>, min_count: usize) -> AlertCorrelator {
        let mut settings = Settings::default();
        settings.alerts.batch_min_count = min_count;
        AlertCorrelator::new(store, Arc::new(settings))
    }

    #[tokio::test]
    async fn test_groups_by_namespace_and_service() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        record(store.as_ref(), "HighLatency", &[("namespace", "shop"), ("service", "web")], now).await;
        record(store.as_ref(), "ErrorRate", &[("namespace", "shop"), ("app", "web")], now).await;
        record(store.as_ref(), "DiskFull", &[], now).await;

        let report = correlator(store.clone(), 1).run_once(now).await.unwrap();
        assert_eq!(report.groups, 2);
        assert_eq!(report.batches_created, 2);

        let jobs = store.list_pending_jobs(&[JobKind::Alert]).await.unwrap();
        assert_eq!(jobs.len(), 2);
        let mut batches = Vec::new();
        for job in &jobs {
            let batch = store.get_batch(job.target.id()).await.unwrap().unwrap();
            batches.push((batch.namespace.clone(), batch.service.clone(), batch.summary));
        }
        batches.sort();
        assert_eq!(batches[0].0, "default");
        assert_eq!(batches[0].1, "unknown");
        assert_eq!(
            batches[1].2,
            "Batch of 2 alerts for shop/web. Alerts: ErrorRate, HighLatency"
        );
    }

    #[tokio::test]
    async fn test_second_pass_creates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        record(store.as_ref(), "HighLatency", &[("namespace", "shop")], now).await;

        let correlator = correlator(store.clone(), 1);
        assert_eq!(correlator.run_once(now).await.unwrap().batches_created, 1);
        let second = correlator.run_once(now).await.unwrap();
        assert_eq!(second.unbatched, 0);
        assert_eq!(second.batches_created, 0);
        assert_eq!(store.list_pending_jobs(&[JobKind::Alert]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_small_groups_wait_and_age_out() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        record(store.as_ref(), "HighLatency", &[("namespace", "shop")], now).await;

        let correlator = correlator(store.clone(), 2);
        let report = correlator.run_once(now).await.unwrap();
        assert_eq!(report.below_minimum, 1);
        assert_eq!(report.batches_created, 0);

        let later = correlator
            .run_once(now + ChronoDuration::minutes(6))
            .await
            .unwrap();
        assert_eq!(later.unbatched, 0);
    }

    #[tokio::test]
    async fn test_failed_batch_write_leaves_alerts_for_next_pass() {
        let store = Arc::new(FaultyStore::new());
        let now = Utc::now();
        record(store.as_ref(), "HighLatency", &[("namespace", "shop")], now).await;
        let correlator = correlator(store.clone(), 1);

        store.fail_next("create_batch");
        let failed = correlator.run_once(now).await.unwrap();
        assert_eq!(failed.batches_created, 0);
        assert!(store.list_pending_jobs(&[JobKind::Alert]).await.unwrap().is_empty());

        let retried = correlator.run_once(now).await.unwrap();
        assert_eq!(retried.unbatched, 1);
        assert_eq!(retried.batches_created, 1);
        let jobs = store.list_pending_jobs(&[JobKind::Alert]).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].scope.namespace, "shop");
    }
}
