//! Namespace incident detection.
//!
//! Each pass reads a snapshot of every namespace and evaluates four
//! conditions. A triggered condition opens at most one incident per
//! (cluster, namespace, type); a condition that is no longer observed
//! resolves its open incident.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterClient, NamespaceSnapshot};
use crate::config::{secs, window_start, IncidentSettings, Settings};
use crate::error::Result;
use crate::model::{IncidentStatus, IncidentType, NewIncident};
use crate::service::run_every;
use crate::store::Store;

const EVICTED_REASON: &str = "Evicted";
const BACKOFF_REASON: &str = "BackOff";

/// A triggered condition with the evidence that triggered it.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub incident_type: IncidentType,
    pub metadata: Value,
}

/// Evaluate every incident condition against one namespace snapshot.
pub fn detect_conditions(
    snapshot: &NamespaceSnapshot,
    settings: &IncidentSettings,
    now: DateTime<Utc>,
) -> Vec<Condition> {
    let mut found = Vec::new();

    if snapshot.phase.as_deref() == Some("Terminating") {
        if let Some(deleted_at) = snapshot.deletion_timestamp {
            let elapsed = now - deleted_at;
            if elapsed >= secs(settings.terminating_threshold_secs) {
                found.push(Condition {
                    incident_type: IncidentType::StuckTerminating,
                    metadata: json!({
                        "deletionTimestamp": deleted_at.to_rfc3339(),
                        "terminatingSeconds": elapsed.num_seconds(),
                    }),
                });
            }
        }
    }

    let exceeded: Vec<Value> = snapshot
        .quotas
        .iter()
        .filter(|q| q.hard > 0.0 && q.used / q.hard >= settings.quota_ratio)
        .map(|q| {
            json!({
                "quota": q.quota,
                "resource": q.resource,
                "hard": q.hard,
                "used": q.used,
            })
        })
        .collect();
    if !exceeded.is_empty() {
        found.push(Condition {
            incident_type: IncidentType::QuotaExceeded,
            metadata: json!({ "resources": exceeded }),
        });
    }

    let since = window_start(now, secs(settings.event_window_secs));
    for (reason, threshold, incident_type) in [
        (
            EVICTED_REASON,
            settings.eviction_threshold,
            IncidentType::HighEvictionRate,
        ),
        (
            BACKOFF_REASON,
            settings.restart_threshold,
            IncidentType::HighRestartRate,
        ),
    ] {
        let (count, objects) = recent_events(snapshot, reason, since);
        if count >= threshold {
            found.push(Condition {
                incident_type,
                metadata: json!({
                    "reason": reason,
                    "count": count,
                    "windowSeconds": settings.event_window_secs,
                    "objects": objects,
                }),
            });
        }
    }

    found
}

/// Summed occurrences of `reason` last seen at or after `since`, with the
/// objects involved.
fn recent_events<'a>(
    snapshot: &'a NamespaceSnapshot,
    reason: &str,
    since: DateTime<Utc>,
) -> (u32, BTreeSet<&'a str>) {
    snapshot
        .events
        .iter()
        .filter(|e| e.reason == reason && e.last_seen.is_some_and(|at| at >= since))
        .fold((0, BTreeSet::new()), |(count, mut objects), e| {
            objects.insert(e.object.as_str());
            (count.saturating_add(e.count.max(1)), objects)
        })
}

/// Report from one detector pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub opened: usize,
    pub already_open: usize,
    pub resolved: usize,
    pub errors: usize,
}

pub struct IncidentDetector {
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterClient>,
    settings: Arc<Settings>,
}

impl IncidentDetector {
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

    fn excluded(&self, namespace: &str) -> bool {
        self.settings
            .incidents
            .excluded_namespaces
            .iter()
            .any(|n| n == namespace)
    }

    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let namespaces = self.cluster.list_namespaces().await?;
        let mut report = ScanReport::default();
        let mut unreadable: HashSet<String> = HashSet::new();
        let mut observed: HashSet<(String, IncidentType)> = HashSet::new();

        for namespace in namespaces.iter().filter(|ns| !self.excluded(&ns.name)) {
            let snapshot = match self.cluster.namespace_snapshot(&namespace.name).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(e) => {
                    warn!(namespace = %namespace.name, error = %e, "Failed to read namespace");
                    unreadable.insert(namespace.name.clone());
                    report.errors += 1;
                    continue;
                }
            };
            report.scanned += 1;

            for condition in detect_conditions(&snapshot, &self.settings.incidents, now) {
                observed.insert((snapshot.name.clone(), condition.incident_type));
                match self.open_incident(&snapshot.name, condition, now).await {
                    Ok(true) => report.opened += 1,
                    Ok(false) => report.already_open += 1,
                    Err(e) => {
                        warn!(namespace = %snapshot.name, error = %e, "Failed to record incident");
                        report.errors += 1;
                    }
                }
            }
        }

        for incident in self
            .store
            .list_open_incidents(&self.settings.cluster_name)
            .await?
        {
            if unreadable.contains(&incident.namespace)
                || observed.contains(&(incident.namespace.clone(), incident.incident_type))
            {
                continue;
            }
            match self
                .store
                .update_incident_status(incident.id, IncidentStatus::Resolved, now)
                .await
            {
                Ok(()) => {
                    info!(incident = %incident.reference(), "Incident resolved");
                    report.resolved += 1;
                }
                Err(e) => {
                    warn!(incident = %incident.reference(), error = %e, "Failed to resolve incident");
                    report.errors += 1;
                }
            }
        }

        debug!(?report, "Namespace scan complete");
        Ok(report)
    }

    #[instrument(skip(self, condition, now), fields(incident_type = %condition.incident_type))]
    async fn open_incident(
        &self,
        namespace: &str,
        condition: Condition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (incident, job) = self
            .store
            .create_incident_if_absent(NewIncident {
                cluster: self.settings.cluster_name.clone(),
                namespace: namespace.to_string(),
                incident_type: condition.incident_type,
                started_at: now,
                metadata: condition.metadata,
            })
            .await?;
        let Some(job) = job else {
            return Ok(false);
        };

        info!(
            incident = %incident.reference(),
            job_id = job.id,
            "Opened namespace incident"
        );
        Ok(true)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.settings.incidents.scan_interval_secs);
        run_every("namespace-scan", interval, cancel, move || async move {
            if let Err(e) = self.scan_once(Utc::now()).await {
                warn!(error = %e, "Namespace scan failed");
            }
        })
        .await;
    }
}
