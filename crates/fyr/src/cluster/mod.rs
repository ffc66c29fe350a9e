//! Cluster boundary.
//!
//! Internal logic only sees the normalized structs below; the `kube` adapter
//! fills them in from API objects and nothing past this module branches on
//! object shape.

pub mod kube;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::BTreeMap;

use crate::error::Result;

pub use self::kube::KubeCluster;

/// One entry of a workload's status condition list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadCondition {
    pub kind: String,
    /// `"True"`, `"False"` or `"Unknown"`
    pub status: String,
}

/// A Deployment, reduced to the fields the rollout logic reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadObject {
    pub namespace: String,
    pub name: String,
    pub generation: i64,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub desired_replicas: i32,
    pub available_replicas: Option<i32>,
    pub conditions: Vec<WorkloadCondition>,
    /// `spec.selector` rendered as a label selector string
    pub selector: String,
}

impl WorkloadObject {
    /// Status of the named condition, if present.
    pub fn condition(&self, kind: &str) -> Option<&str> {
        self.conditions
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| c.status.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub phase: String,
    /// `state.waiting.reason` of every waiting container
    pub waiting_reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadEvent {
    Applied(WorkloadObject),
    Deleted(WorkloadObject),
}

pub type WorkloadStream = BoxStream<'static, Result<WorkloadEvent>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// One resource line of a ResourceQuota.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaUsage {
    pub quota: String,
    pub resource: String,
    pub hard: f64,
    pub used: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSummary {
    pub reason: String,
    pub object: String,
    pub count: u32,
    pub last_seen: Option<DateTime<Utc>>,
    pub message: String,
}

/// Point-in-time inputs for namespace incident detection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceSnapshot {
    pub name: String,
    pub phase: Option<String>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub quotas: Vec<QuotaUsage>,
    pub events: Vec<EventSummary>,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Open one watch connection over Deployments in every namespace.
    /// The stream ends after `timeout_secs`; callers re-subscribe.
    fn watch_workloads(&self, label_selector: Option<&str>, timeout_secs: u32) -> WorkloadStream;

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<WorkloadObject>>;

    /// Pods matching a non-empty label selector.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSummary>>;

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceInfo>>;

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>>;

    /// `None` when the namespace no longer exists.
    async fn namespace_snapshot(&self, name: &str) -> Result<Option<NamespaceSnapshot>>;
}
