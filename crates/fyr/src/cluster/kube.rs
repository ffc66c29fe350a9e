//! `ClusterClient` over the Kubernetes API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Namespace, Pod, ResourceQuota};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::Client;
use tracing::debug;

use super::{
    ClusterClient, EventSummary, NamespaceInfo, NamespaceSnapshot, PodSummary,
    QuotaUsage, WorkloadCondition, WorkloadEvent, WorkloadObject, WorkloadStream,
};
use crate::error::{Error, Result};

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with in-cluster or kubeconfig credentials.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    fn watch_workloads(&self, label_selector: Option<&str>, timeout_secs: u32) -> WorkloadStream {
        let api: Api<Deployment> = Api::all(self.client.clone());
        let mut config = watcher::Config::default().timeout(timeout_secs);
        if let Some(selector) = label_selector {
            config = config.labels(selector);
        }

        watcher(api, config)
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(d) | watcher::Event::InitApply(d)) => {
                        Some(Ok(WorkloadEvent::Applied(normalize_deployment(&d))))
                    }
                    Ok(watcher::Event::Delete(d)) => {
                        Some(Ok(WorkloadEvent::Deleted(normalize_deployment(&d))))
                    }
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(Error::WatchError(e.to_string()))),
                }
            })
            .boxed()
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<WorkloadObject>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(normalize_deployment))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSummary>> {
        if selector.is_empty() {
            return Err(Error::WatchError(format!(
                "refusing to list pods in {namespace} without a label selector"
            )));
        }
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(selector);
        let pods = api.list(&params).await?;
        Ok(pods.items.iter().map(normalize_pod).collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceInfo>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.as_ref().map(normalize_namespace))
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = api.list(&ListParams::default()).await?;
        Ok(namespaces.items.iter().map(normalize_namespace).collect())
    }

    async fn namespace_snapshot(&self, name: &str) -> Result<Option<NamespaceSnapshot>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let Some(namespace) = api.get_opt(name).await? else {
            return Ok(None);
        };

        let quotas: Api<ResourceQuota> = Api::namespaced(self.client.clone(), name);
        let quotas = quotas.list(&ListParams::default()).await?;
        let events: Api<Event> = Api::namespaced(self.client.clone(), name);
        let events = events.list(&ListParams::default()).await?;
        debug!(
            namespace = name,
            quotas = quotas.items.len(),
            events = events.items.len(),
            "Fetched namespace snapshot"
        );

        Ok(Some(NamespaceSnapshot {
            name: name.to_string(),
            phase: namespace.status.as_ref().and_then(|s| s.phase.clone()),
            deletion_timestamp: namespace.metadata.deletion_timestamp.as_ref().map(|t| t.0),
            quotas: quotas.items.iter().flat_map(normalize_quota).collect(),
            events: events.items.iter().map(normalize_event).collect(),
        }))
    }
}

// =============================================================================
// Normalization
// =============================================================================

fn normalize_deployment(deployment: &Deployment) -> WorkloadObject {
    let meta = &deployment.metadata;
    let spec = deployment.spec.as_ref();
    let status = deployment.status.as_ref();

    WorkloadObject {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        generation: meta.generation.unwrap_or(1),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        desired_replicas: spec.and_then(|s| s.replicas).unwrap_or(0),
        available_replicas: status.and_then(|s| s.available_replicas),
        conditions: status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .map(|c| WorkloadCondition {
                        kind: c.type_.clone(),
                        status: c.status.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        selector: spec.map(|s| selector_string(&s.selector)).unwrap_or_default(),
    }
}

/// Render `matchLabels` and `matchExpressions` in label selector syntax.
fn selector_string(selector: &LabelSelector) -> String {
    let labels = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"));
    let expressions = selector
        .match_expressions
        .iter()
        .flatten()
        .filter_map(|req| {
            let values = req.values.as_deref().unwrap_or_default().join(",");
            match req.operator.as_str() {
                "In" => Some(format!("{} in ({values})", req.key)),
                "NotIn" => Some(format!("{} notin ({values})", req.key)),
                "Exists" => Some(req.key.clone()),
                "DoesNotExist" => Some(format!("!{}", req.key)),
                _ => None,
            }
        });
    labels.chain(expressions).collect::<Vec<_>>().join(",")
}

fn normalize_pod(pod: &Pod) -> PodSummary {
    let status = pod.status.as_ref();
    PodSummary {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        waiting_reasons: status
            .and_then(|s| s.container_statuses.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.clone())
            .collect(),
    }
}

fn normalize_namespace(namespace: &Namespace) -> NamespaceInfo {
    NamespaceInfo {
        name: namespace.metadata.name.clone().unwrap_or_default(),
        labels: namespace.metadata.labels.clone().unwrap_or_default(),
        annotations: namespace.metadata.annotations.clone().unwrap_or_default(),
    }
}

fn normalize_quota(quota: &ResourceQuota) -> Vec<QuotaUsage> {
    let name = quota.metadata.name.clone().unwrap_or_default();
    let Some(status) = quota.status.as_ref() else {
        return Vec::new();
    };
    let (Some(hard), Some(used)) = (status.hard.as_ref(), status.used.as_ref()) else {
        return Vec::new();
    };

    hard.iter()
        .filter_map(|(resource, limit)| {
            Some(QuotaUsage {
                quota: name.clone(),
                resource: resource.clone(),
                hard: parse_quantity(&limit.0)?,
                used: parse_quantity(&used.get(resource)?.0)?,
            })
        })
        .collect()
}

fn normalize_event(event: &Event) -> EventSummary {
    let last_seen: Option<DateTime<Utc>> = event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0));

    EventSummary {
        reason: event.reason.clone().unwrap_or_default(),
        object: event.involved_object.name.clone().unwrap_or_default(),
        count: event
            .count
            .and_then(|c| u32::try_from(c).ok())
            .unwrap_or(1)
            .max(1),
        last_seen,
        message: event.message.clone().unwrap_or_default(),
    }
}

/// Parse a Kubernetes quantity (`500m`, `2Gi`, `1.5`, `1e3`) into a plain number.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    const SUFFIXES: [(&str, f64); 15] = [
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * multiplier);
        }
    }
    raw.parse().ok()
}
