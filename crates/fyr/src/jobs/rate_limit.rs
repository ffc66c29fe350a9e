//! Hourly investigation caps per namespace and per cluster.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::config::{window_start, JobSettings};
use crate::error::Result;
use crate::model::JobScope;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    NamespaceCapped { started: usize, cap: usize },
    ClusterCapped { started: usize, cap: usize },
}

impl RateDecision {
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Counts jobs started in the trailing hour. Shared by every worker sub-loop
/// so the caps hold across job kinds.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    per_namespace: usize,
    per_cluster: usize,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, settings: &JobSettings) -> Self {
        Self {
            store,
            per_namespace: settings.max_per_namespace_per_hour,
            per_cluster: settings.max_per_cluster_per_hour,
        }
    }

    pub async fn check(&self, scope: &JobScope, now: DateTime<Utc>) -> Result<RateDecision> {
        let since = window_start(now, Duration::hours(1));

        let started = self
            .store
            .count_started_jobs(since, &scope.cluster, Some(&scope.namespace))
            .await?;
        if started >= self.per_namespace {
            return Ok(RateDecision::NamespaceCapped {
                started,
                cap: self.per_namespace,
            });
        }

        let started = self
            .store
            .count_started_jobs(since, &scope.cluster, None)
            .await?;
        if started >= self.per_cluster {
            return Ok(RateDecision::ClusterCapped {
                started,
                cap: self.per_cluster,
            });
        }

        Ok(RateDecision::Allowed)
    }
}
