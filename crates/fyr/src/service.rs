//! Process wiring: which loops run in which role, and the shared loop driver.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertCorrelator;
use crate::cluster::ClusterClient;
use crate::config::Settings;
use crate::diagnose::HttpDiagnosticEngine;
use crate::error::Result;
use crate::incidents::IncidentDetector;
use crate::jobs::{JobWorker, RateLimiter};
use crate::namespace_cache::NamespaceCache;
use crate::rollout::{DeploymentWatcher, Reconciler};
use crate::server::{run_server, AppState};
use crate::store::Store;

/// Run `tick` every `interval` until `cancel` fires.
///
/// The first tick runs immediately. A tick that overruns the interval delays
/// the next one instead of bursting.
pub async fn run_every<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(loop_name = name, interval_secs = interval.as_secs(), "Loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => tick().await,
        }
    }
    info!(loop_name = name, "Loop stopped");
}

/// Which set of loops this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Everything in one process
    All,
    /// Deployment watch, reconciliation and namespace scan
    Watcher,
    /// HTTP intake, alert batching and the job worker
    Analyzer,
}

impl Role {
    const fn watches(self) -> bool {
        matches!(self, Self::All | Self::Watcher)
    }

    const fn analyzes(self) -> bool {
        matches!(self, Self::All | Self::Analyzer)
    }
}

/// Start every loop for `role` and wait until all have stopped.
///
/// Loops stop when `cancel` fires. If any loop exits on its own the token is
/// cancelled so the others follow.
pub async fn run(
    role: Role,
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterClient>,
    cancel: CancellationToken,
) -> Result<()> {
    let namespaces = Arc::new(NamespaceCache::new(cluster.clone(), &settings.watch));
    let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

    if role.watches() {
        let watcher = DeploymentWatcher::new(
            store.clone(),
            cluster.clone(),
            namespaces.clone(),
            settings.clone(),
        );
        let token = cancel.clone();
        tasks.spawn(async move {
            watcher.run(token).await;
            ("watch", Ok(()))
        });

        let reconciler = Reconciler::new(store.clone(), cluster.clone(), settings.clone());
        let token = cancel.clone();
        tasks.spawn(async move {
            reconciler.run(token).await;
            ("reconcile", Ok(()))
        });

        let detector = IncidentDetector::new(store.clone(), cluster.clone(), settings.clone());
        let token = cancel.clone();
        tasks.spawn(async move {
            detector.run(token).await;
            ("namespace-scan", Ok(()))
        });
    }

    if role.analyzes() {
        let state = AppState::new(settings.clone(), store.clone());
        let token = cancel.clone();
        tasks.spawn(async move { ("http", run_server(state, token).await) });

        let correlator = AlertCorrelator::new(store.clone(), settings.clone());
        let token = cancel.clone();
        tasks.spawn(async move {
            correlator.run(token).await;
            ("alert-batcher", Ok(()))
        });

        match HttpDiagnosticEngine::from_settings(&settings.diagnostic)? {
            Some(engine) => {
                let notifier = Arc::new(notify_from_settings(&settings));
                let limiter = Arc::new(RateLimiter::new(store.clone(), &settings.jobs));
                let worker = JobWorker::new(
                    store.clone(),
                    namespaces.clone(),
                    Arc::new(engine),
                    notifier,
                    limiter,
                    settings.clone(),
                );
                let token = cancel.clone();
                tasks.spawn(async move {
                    worker.run(token).await;
                    ("job-worker", Ok(()))
                });
            }
            None => warn!("No diagnostic engine URL configured, investigation jobs stay pending"),
        }
    }

    info!(?role, loops = tasks.len(), cluster = %settings.cluster_name, "Service started");

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => debug!(loop_name = name, "Loop exited"),
            Ok((name, Err(e))) => {
                error!(loop_name = name, error = %e, "Loop failed");
                first_error.get_or_insert(e);
            }
            Err(e) => {
                error!(error = %e, "Loop panicked");
                first_error.get_or_insert(e.into());
            }
        }
        cancel.cancel();
    }

    first_error.map_or(Ok(()), Err)
}

/// Build the notifier from configuration. Without Slack credentials the
/// notifier is disabled and every delivery reports not-sent.
pub fn notify_from_settings(settings: &Settings) -> notify::Notifier {
    let cfg = &settings.notify;
    if cfg.slack_bot_token.is_none() && cfg.slack_webhook_url.is_none() {
        return notify::Notifier::disabled();
    }
    let slack = notify::SlackChannel::new(notify::SlackConfig {
        bot_token: cfg.slack_bot_token.clone(),
        webhook_url: cfg.slack_webhook_url.clone(),
        default_channel: cfg.slack_default_channel.clone(),
        api_base: cfg.slack_api_url.clone(),
    });
    notify::Notifier::new(Arc::new(slack), settings.retry_policy())
}
