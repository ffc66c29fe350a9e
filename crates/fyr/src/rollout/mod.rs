//! Rollout tracking: watch, phase rules and reconciliation.

pub mod phase;
pub mod reconcile;
pub mod watch;

pub use phase::{evaluate_phase, Phase, PodFailureSignals};
pub use reconcile::{FailureReason, ReconcileOutcome, ReconcileReport, Reconciler};
pub use watch::{DeploymentWatcher, WatchOutcome};
