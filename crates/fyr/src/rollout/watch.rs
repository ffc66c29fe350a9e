//! Deployment watch loop.
//!
//! Creates one rollout per new (cluster, namespace, deployment, generation).
//! Existing rollouts only get their metadata refreshed here; status belongs
//! to the reconciler.

use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::phase::evaluate_phase;
use crate::cluster::{ClusterClient, WorkloadEvent, WorkloadObject};
use crate::config::{Settings, WatchMode};
use crate::error::Result;
use crate::model::{NewRollout, RolloutKey, RolloutMetadata};
use crate::namespace_cache::{NamespaceCache, NamespaceMetadata};
use crate::store::Store;

/// What the watcher did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Ignored,
    Created(i64),
    Refreshed(i64),
}

pub struct DeploymentWatcher {
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterClient>,
    namespaces: Arc<NamespaceCache>,
    settings: Arc<Settings>,
}

impl DeploymentWatcher {
    pub fn new(
        store: Arc<dyn Store>,
        cluster: Arc<dyn ClusterClient>,
        namespaces: Arc<NamespaceCache>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            cluster,
            namespaces,
            settings,
        }
    }

    fn label_selector(&self) -> Option<String> {
        match self.settings.watch.mode {
            WatchMode::Labeled => Some(format!("{}=true", self.settings.watch.enable_label)),
            WatchMode::Broad | WatchMode::All => None,
        }
    }

    fn is_enabled(&self, workload: &WorkloadObject, namespace: &NamespaceMetadata) -> bool {
        let labeled = workload
            .labels
            .get(&self.settings.watch.enable_label)
            .is_some_and(|v| v == "true");
        match self.settings.watch.mode {
            WatchMode::Labeled => labeled,
            WatchMode::Broad => labeled || namespace.enabled,
            WatchMode::All => true,
        }
    }

    /// Apply one watch event.
    pub async fn handle_event(&self, event: WorkloadEvent) -> Result<WatchOutcome> {
        let workload = match event {
            WorkloadEvent::Applied(workload) => workload,
            WorkloadEvent::Deleted(_) => return Ok(WatchOutcome::Ignored),
        };

        let namespace = self.namespaces.get(&workload.namespace).await;
        if !self.is_enabled(&workload, &namespace) {
            debug!(
                namespace = %workload.namespace,
                deployment = %workload.name,
                "Deployment not opted in, skipping"
            );
            return Ok(WatchOutcome::Ignored);
        }

        let key = RolloutKey {
            cluster: self.settings.cluster_name.clone(),
            namespace: workload.namespace.clone(),
            deployment: workload.name.clone(),
            generation: workload.generation,
        };
        let metadata = RolloutMetadata {
            team: namespace.team.clone(),
            notify_target: namespace.notify_target.clone(),
            namespace_annotations: namespace.annotations.clone(),
            ..RolloutMetadata::default()
        };

        if let Some(existing) = self.store.find_rollout(&key).await? {
            if metadata != RolloutMetadata::default() {
                self.store
                    .update_rollout_metadata(existing.id, &metadata)
                    .await?;
            }
            return Ok(WatchOutcome::Refreshed(existing.id));
        }

        let status = evaluate_phase(&workload).in_flight_status();
        let (rollout, created) = self
            .store
            .create_rollout_if_absent(NewRollout {
                key,
                status,
                origin: "k8s".to_string(),
                metadata,
                started_at: Utc::now(),
            })
            .await?;

        if created {
            info!(
                rollout = %rollout.reference(),
                status = %status,
                "Tracking new rollout"
            );
            Ok(WatchOutcome::Created(rollout.id))
        } else {
            Ok(WatchOutcome::Refreshed(rollout.id))
        }
    }

    /// Consume the watch stream until cancelled, re-subscribing after errors.
    pub async fn run(&self, cancel: CancellationToken) {
        let selector = self.label_selector();
        let backoff = Duration::from_secs(self.settings.watch.reconnect_backoff_secs);
        info!(
            mode = ?self.settings.watch.mode,
            selector = selector.as_deref().unwrap_or("<none>"),
            "Starting deployment watch"
        );

        loop {
            let mut stream = self
                .cluster
                .watch_workloads(selector.as_deref(), self.settings.watch.stream_timeout_secs);

            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => return,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        if let Err(e) = self.handle_event(event).await {
                            warn!(error = %e, "Failed to handle deployment event");
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Deployment watch stream failed");
                        break;
                    }
                    None => {
                        debug!("Deployment watch stream ended");
                        break;
                    }
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }
}
