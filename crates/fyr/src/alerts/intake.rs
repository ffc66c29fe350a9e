//! Alert intake with sticky per-fingerprint throttling.
//!
//! Every delivered item is stored. Whether it may be investigated depends only
//! on the fingerprint's `last_investigated_at`, so a fingerprint that flaps
//! firing -> resolved -> firing inside the throttle window is not re-triggered.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::types::{AlertPayload, IncomingAlert};
use crate::config::Settings;
use crate::error::Result;
use crate::model::{AlertStateRecord, AlertStatus, NewAlert};
use crate::store::Store;

/// Outcome of one webhook delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntakeSummary {
    pub count: usize,
    pub triggered: usize,
}

/// Decide whether an incoming alert may be investigated.
pub fn should_investigate(
    incoming: AlertStatus,
    prior: Option<&AlertStateRecord>,
    now: DateTime<Utc>,
    throttle_window: Duration,
) -> bool {
    if incoming == AlertStatus::Resolved {
        return false;
    }
    let throttled = prior
        .and_then(|state| state.last_investigated_at)
        .is_some_and(|at| now - at < throttle_window);
    !throttled
}

pub struct AlertIntake {
    store: Arc<dyn Store>,
    settings: Arc<Settings>,
}

impl AlertIntake {
    pub fn new(store: Arc<dyn Store>, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    pub async fn ingest(&self, payload: &AlertPayload, now: DateTime<Utc>) -> Result<IntakeSummary> {
        let mut summary = IntakeSummary::default();
        for alert in &payload.alerts {
            if self.process_alert(alert, now).await? {
                summary.triggered += 1;
            }
            summary.count += 1;
        }
        if summary.count > 0 {
            info!(
                count = summary.count,
                triggered = summary.triggered,
                "Processed alert webhook"
            );
        }
        Ok(summary)
    }

    /// Store one alert and update its fingerprint state in a single store
    /// step. Returns whether it was admitted for investigation.
    #[instrument(skip_all, fields(fingerprint = tracing::field::Empty))]
    pub async fn process_alert(&self, alert: &IncomingAlert, now: DateTime<Utc>) -> Result<bool> {
        let fingerprint = alert.fingerprint();
        tracing::Span::current().record("fingerprint", fingerprint.as_str());

        let status = alert.status();
        let (_, investigate) = self
            .store
            .record_alert(
                NewAlert {
                    fingerprint,
                    status,
                    starts_at: alert.starts_at(),
                    ends_at: alert.ends_at(),
                    labels: alert.labels.clone(),
                    annotations: alert.annotations.clone(),
                    raw: alert.raw.clone(),
                    received_at: now,
                },
                self.settings.throttle_window(),
            )
            .await?;

        debug!(
            alert = alert.name(),
            status = %status,
            investigate,
            "Alert recorded"
        );
        Ok(investigate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn alert(status: &str) -> AlertPayload {
        AlertPayload::from_value(&json!({"alerts": [{
            "status": status,
            "labels": {"alertname": "HighErrorRate", "namespace": "shop", "service": "web"},
            "annotations": {"description": "5xx above 5%"},
            "startsAt": "2024-05-01T10:00:00Z",
            "endsAt": "0001-01-01T00:00:00Z",
            "fingerprint": "fp-1"
        }]}))
        .unwrap()
    }

    #[test]
    fn test_decision_table() {
        let now = Utc::now();
        let window = Duration::hours(24);
        let state = |status, investigated: Option<DateTime<Utc>>| AlertStateRecord {
            fingerprint: "fp".to_string(),
            status,
            last_received_at: now,
            last_investigated_at: investigated,
        };

        assert!(should_investigate(AlertStatus::Firing, None, now, window));
        assert!(should_investigate(
            AlertStatus::Firing,
            Some(&state(AlertStatus::Resolved, None)),
            now,
            window
        ));
        assert!(should_investigate(
            AlertStatus::Firing,
            Some(&state(AlertStatus::Firing, Some(now - Duration::hours(25)))),
            now,
            window
        ));
        assert!(!should_investigate(
            AlertStatus::Firing,
            Some(&state(AlertStatus::Firing, Some(now - Duration::minutes(5)))),
            now,
            window
        ));
        assert!(!should_investigate(AlertStatus::Resolved, None, now, window));
    }

    #[tokio::test]
    async fn test_sticky_throttle_sequence() {
        let store = Arc::new(MemoryStore::new());
        let intake = AlertIntake::new(store.clone(), Arc::new(Settings::default()));
        let t0 = Utc::now();

        let first = intake.ingest(&alert("firing"), t0).await.unwrap();
        assert_eq!(first.triggered, 1);
        let state = store.get_alert_state("fp-1").await.unwrap().unwrap();
        assert_eq!(state.last_investigated_at, Some(t0));

        let repeat = intake
            .ingest(&alert("firing"), t0 + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(repeat.triggered, 0);

        let t1 = t0 + Duration::hours(25);
        let after_window = intake.ingest(&alert("firing"), t1).await.unwrap();
        assert_eq!(after_window.triggered, 1);

        let resolved = intake
            .ingest(&alert("resolved"), t1 + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(resolved.triggered, 0);
        let state = store.get_alert_state("fp-1").await.unwrap().unwrap();
        assert_eq!(state.status, AlertStatus::Resolved);
        assert_eq!(state.last_investigated_at, Some(t1));

        let refire = intake
            .ingest(&alert("firing"), t1 + Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(refire.triggered, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_deliveries_trigger_once() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> =
            Arc::new(crate::store::SqliteStore::open(dir.path().join("fyr.db")).unwrap());
        let settings = Arc::new(Settings::default());
        let left = AlertIntake::new(store.clone(), settings.clone());
        let right = AlertIntake::new(store.clone(), settings);
        let now = Utc::now();

        let payload = alert("firing");
        let (a, b) = tokio::join!(left.ingest(&payload, now), right.ingest(&payload, now));
        let triggered = a.unwrap().triggered + b.unwrap().triggered;
        assert_eq!(triggered, 1);

        let unbatched = store
            .list_unbatched_alerts(now - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(unbatched.len(), 1);
    }

    #[tokio::test]
    async fn test_suppressed_alerts_never_reach_correlation() {
        let store = Arc::new(MemoryStore::new());
        let intake = AlertIntake::new(store.clone(), Arc::new(Settings::default()));
        let now = Utc::now();

        intake.ingest(&alert("firing"), now).await.unwrap();
        intake.ingest(&alert("firing"), now).await.unwrap();
        intake.ingest(&alert("resolved"), now).await.unwrap();

        let unbatched = store
            .list_unbatched_alerts(now - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(unbatched.len(), 1);
        assert_eq!(unbatched[0].status, AlertStatus::Firing);
    }
}
