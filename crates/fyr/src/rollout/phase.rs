//! Pure rollout health rules.

use crate::cluster::{PodSummary, WorkloadObject};
use crate::model::RolloutStatus;

/// Coarse phase derived from a workload's spec and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stable,
    FailedProgress,
    Pending,
    RollingOut,
}

impl Phase {
    /// Non-terminal status recorded for this phase.
    pub const fn in_flight_status(self) -> RolloutStatus {
        match self {
            Self::Pending => RolloutStatus::Pending,
            _ => RolloutStatus::RollingOut,
        }
    }
}

/// Evaluate the phase of a workload.
///
/// Checked in order: enough available replicas, then an explicit
/// `Progressing=False`, then an explicit `Available=False`.
pub fn evaluate_phase(workload: &WorkloadObject) -> Phase {
    let desired = workload.desired_replicas;
    if let Some(available) = workload.available_replicas {
        if desired > 0 && available >= desired {
            return Phase::Stable;
        }
    }
    if workload.condition("Progressing") == Some("False") {
        return Phase::FailedProgress;
    }
    if workload.condition("Available") == Some("False") {
        return Phase::Pending;
    }
    Phase::RollingOut
}

/// Pod-level failure counts for one workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodFailureSignals {
    pub crashloop_pods: usize,
    pub image_pull_pods: usize,
    pub pending_pods: usize,
    pub total_pods: usize,
}

impl PodFailureSignals {
    pub fn from_pods(pods: &[PodSummary]) -> Self {
        let mut signals = Self {
            total_pods: pods.len(),
            ..Self::default()
        };
        for pod in pods {
            if pod.waiting_reasons.iter().any(|r| r == "CrashLoopBackOff") {
                signals.crashloop_pods += 1;
            }
            if pod
                .waiting_reasons
                .iter()
                .any(|r| r == "ImagePullBackOff" || r == "ErrImagePull")
            {
                signals.image_pull_pods += 1;
            }
            if pod.phase.eq_ignore_ascii_case("pending") {
                signals.pending_pods += 1;
            }
        }
        signals
    }

    /// Fail without waiting for the timeout when at least half the pods are visibly broken.
    pub fn should_fail_early(&self) -> bool {
        if self.total_pods == 0 {
            return false;
        }
        let failing = self.crashloop_pods + self.image_pull_pods;
        failing >= (self.total_pods / 2).max(1)
    }

    /// Short human-readable account, e.g. `3/5 pods CrashLoopBackOff`.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.crashloop_pods > 0 {
            parts.push(format!("{}/{} pods CrashLoopBackOff", self.crashloop_pods, self.total_pods));
        }
        if self.image_pull_pods > 0 {
            parts.push(format!("{}/{} pods ImagePullBackOff", self.image_pull_pods, self.total_pods));
        }
        if parts.is_empty() {
            return format!("0/{} pods failing", self.total_pods);
        }
        parts.join(", ")
    }
}
