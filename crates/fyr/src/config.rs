//! Service configuration.
//!
//! One immutable [`Settings`] value is built at startup and handed to every
//! component. Values come from built-in defaults, then an optional YAML file,
//! then `FYR_*` environment variables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable pointing at the YAML config file.
pub const ENV_CONFIG_PATH: &str = "FYR_CONFIG_PATH";

/// Upper bound for any configured interval, window or timeout (one year).
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Name recorded on every rollout, incident and job
    pub cluster_name: String,
    pub store: StoreSettings,
    pub server: ServerSettings,
    pub watch: WatchSettings,
    pub reconcile: ReconcileSettings,
    pub alerts: AlertSettings,
    pub incidents: IncidentSettings,
    pub jobs: JobSettings,
    pub diagnostic: DiagnosticSettings,
    pub notify: NotifySettings,
}

/// Persistence engine selection
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreSettings {
    /// SQLite database file; in-memory store when unset
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub listen_addr: String,
    /// Shared secret expected in `X-Alert-Token` (or as a bearer token)
    pub alert_webhook_secret: Option<String>,
}

/// How workloads are selected for tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Server-side label selector on the enable label
    #[default]
    Labeled,
    /// Every workload, enabled by its label or its namespace annotation
    Broad,
    /// Every workload, no opt-in required
    All,
}

impl FromStr for WatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "labeled" | "label" => Ok(Self::Labeled),
            "broad" => Ok(Self::Broad),
            "all" => Ok(Self::All),
            other => Err(Error::ConfigError(format!("unknown watch mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchSettings {
    pub mode: WatchMode,
    /// Label (on the workload) and annotation suffix (on the namespace) that opt in
    pub enable_label: String,
    /// Prefix shared by all opt-in namespace annotations
    pub annotation_prefix: String,
    pub namespace_cache_ttl_secs: u64,
    /// Server-side timeout of one watch connection
    pub stream_timeout_secs: u32,
    pub reconnect_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconcileSettings {
    pub interval_secs: u64,
    /// Rollouts still progressing after this long are failed
    pub rollout_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertSettings {
    /// Sticky throttle per fingerprint
    pub throttle_secs: u64,
    pub correlation_window_secs: u64,
    pub batch_min_count: usize,
    pub batch_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IncidentSettings {
    pub scan_interval_secs: u64,
    pub terminating_threshold_secs: u64,
    /// used / hard at or above this ratio counts as exceeded
    pub quota_ratio: f64,
    pub eviction_threshold: u32,
    pub restart_threshold: u32,
    /// Trailing window for eviction and restart counts
    pub event_window_secs: u64,
    pub excluded_namespaces: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobSettings {
    pub worker_interval_secs: u64,
    pub max_per_namespace_per_hour: usize,
    pub max_per_cluster_per_hour: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiagnosticSettings {
    /// Diagnostic engine endpoint; the job worker does not start without it
    pub url: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotifySettings {
    pub slack_bot_token: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub slack_default_channel: Option<String>,
    pub slack_api_url: Option<String>,
    pub retries: u32,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cluster_name: "ci-cluster".to_string(),
            store: StoreSettings::default(),
            server: ServerSettings::default(),
            watch: WatchSettings::default(),
            reconcile: ReconcileSettings::default(),
            alerts: AlertSettings::default(),
            incidents: IncidentSettings::default(),
            jobs: JobSettings::default(),
            diagnostic: DiagnosticSettings::default(),
            notify: NotifySettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            alert_webhook_secret: None,
        }
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            mode: WatchMode::Labeled,
            enable_label: "fyr/enabled".to_string(),
            annotation_prefix: "fyr/".to_string(),
            namespace_cache_ttl_secs: 60,
            stream_timeout_secs: 60,
            reconnect_backoff_secs: 2,
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            rollout_timeout_secs: 15 * 60,
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            throttle_secs: 24 * 60 * 60,
            correlation_window_secs: 5 * 60,
            batch_min_count: 1,
            batch_interval_secs: 10,
        }
    }
}

impl Default for IncidentSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            terminating_threshold_secs: 10 * 60,
            quota_ratio: 1.0,
            eviction_threshold: 5,
            restart_threshold: 10,
            event_window_secs: 15 * 60,
            excluded_namespaces: Vec::new(),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            worker_interval_secs: 15,
            max_per_namespace_per_hour: 5,
            max_per_cluster_per_hour: 20,
        }
    }
}

impl Default for DiagnosticSettings {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_secs: 120,
        }
    }
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            slack_bot_token: None,
            slack_webhook_url: None,
            slack_default_channel: None,
            slack_api_url: None,
            retries: 3,
            backoff_ms: 500,
            timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the YAML file (if any), then environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from);
        let path = config_path.map(Path::to_path_buf).or(env_path);

        let mut settings = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a YAML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config YAML: {e}")))
    }

    /// Overlay `FYR_*` variables resolved through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("FYR_CLUSTER_NAME") {
            self.cluster_name = v;
        }
        if let Some(v) = get("FYR_SQLITE_PATH") {
            self.store.sqlite_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("FYR_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Some(v) = get("FYR_ALERT_WEBHOOK_SECRET") {
            self.server.alert_webhook_secret = Some(v);
        }
        if let Some(mode) = get("FYR_WATCH_MODE").and_then(|v| v.parse().ok()) {
            self.watch.mode = mode;
        }
        if let Some(v) = get("FYR_ENABLE_LABEL") {
            self.watch.enable_label = v;
        }
        set_parsed(&get, "FYR_NAMESPACE_CACHE_TTL_SECONDS", &mut self.watch.namespace_cache_ttl_secs);
        set_parsed(&get, "FYR_RECONCILE_INTERVAL_SECONDS", &mut self.reconcile.interval_secs);
        set_parsed(&get, "FYR_ROLLOUT_TIMEOUT_SECONDS", &mut self.reconcile.rollout_timeout_secs);
        set_parsed(&get, "FYR_ALERT_THROTTLE_SECONDS", &mut self.alerts.throttle_secs);
        set_parsed(
            &get,
            "FYR_ALERT_CORRELATION_WINDOW_SECONDS",
            &mut self.alerts.correlation_window_secs,
        );
        set_parsed(&get, "FYR_ALERT_BATCH_MIN_COUNT", &mut self.alerts.batch_min_count);
        set_parsed(&get, "FYR_INCIDENT_SCAN_INTERVAL_SECONDS", &mut self.incidents.scan_interval_secs);
        set_parsed(&get, "FYR_WORKER_INTERVAL_SECONDS", &mut self.jobs.worker_interval_secs);
        set_parsed(
            &get,
            "FYR_MAX_INVESTIGATIONS_PER_NAMESPACE",
            &mut self.jobs.max_per_namespace_per_hour,
        );
        set_parsed(
            &get,
            "FYR_MAX_INVESTIGATIONS_PER_CLUSTER",
            &mut self.jobs.max_per_cluster_per_hour,
        );
        if let Some(v) = get("FYR_DIAGNOSTIC_URL") {
            self.diagnostic.url = Some(v);
        }
        if let Some(v) = get("FYR_DIAGNOSTIC_TOKEN") {
            self.diagnostic.token = Some(v);
        }
        set_parsed(&get, "FYR_DIAGNOSTIC_TIMEOUT_SECONDS", &mut self.diagnostic.timeout_secs);
        if let Some(v) = get("FYR_SLACK_BOT_TOKEN") {
            self.notify.slack_bot_token = Some(v);
        }
        if let Some(v) = get("FYR_SLACK_WEBHOOK_URL") {
            self.notify.slack_webhook_url = Some(v);
        }
        if let Some(v) = get("FYR_SLACK_DEFAULT_CHANNEL") {
            self.notify.slack_default_channel = Some(v);
        }
        if let Some(v) = get("FYR_SLACK_API_URL") {
            self.notify.slack_api_url = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("reconcile.intervalSecs", self.reconcile.interval_secs),
            ("alerts.batchIntervalSecs", self.alerts.batch_interval_secs),
            ("alerts.correlationWindowSecs", self.alerts.correlation_window_secs),
            ("incidents.scanIntervalSecs", self.incidents.scan_interval_secs),
            ("incidents.eventWindowSecs", self.incidents.event_window_secs),
            ("jobs.workerIntervalSecs", self.jobs.worker_interval_secs),
            ("diagnostic.timeoutSecs", self.diagnostic.timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::ConfigError(format!("{name} must be greater than zero")));
            }
        }
        let bounded = [
            ("reconcile.rolloutTimeoutSecs", self.reconcile.rollout_timeout_secs),
            ("alerts.throttleSecs", self.alerts.throttle_secs),
            ("incidents.terminatingThresholdSecs", self.incidents.terminating_threshold_secs),
            ("watch.namespaceCacheTtlSecs", self.watch.namespace_cache_ttl_secs),
            ("watch.reconnectBackoffSecs", self.watch.reconnect_backoff_secs),
            ("notify.timeoutSecs", self.notify.timeout_secs),
        ];
        for (name, value) in intervals.into_iter().chain(bounded) {
            if value > MAX_DURATION_SECS {
                return Err(Error::ConfigError(format!(
                    "{name} must be at most {MAX_DURATION_SECS} seconds"
                )));
            }
        }
        if self.alerts.batch_min_count == 0 {
            return Err(Error::ConfigError(
                "alerts.batchMinCount must be at least 1".to_string(),
            ));
        }
        if self.incidents.quota_ratio <= 0.0 {
            return Err(Error::ConfigError(
                "incidents.quotaRatio must be positive".to_string(),
            ));
        }
        if self.jobs.max_per_namespace_per_hour == 0 || self.jobs.max_per_cluster_per_hour == 0 {
            return Err(Error::ConfigError(
                "investigation rate caps must be at least 1".to_string(),
            ));
        }
        if self.cluster_name.trim().is_empty() {
            return Err(Error::ConfigError("clusterName must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn throttle_window(&self) -> chrono::Duration {
        secs(self.alerts.throttle_secs)
    }

    pub fn correlation_window(&self) -> chrono::Duration {
        secs(self.alerts.correlation_window_secs)
    }

    pub fn rollout_timeout(&self) -> chrono::Duration {
        secs(self.reconcile.rollout_timeout_secs)
    }

    pub fn diagnostic_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnostic.timeout_secs)
    }

    pub fn retry_policy(&self) -> notify::RetryPolicy {
        notify::RetryPolicy {
            attempts: self.notify.retries.max(1),
            backoff: Duration::from_millis(self.notify.backoff_ms),
            timeout: Duration::from_secs(self.notify.timeout_secs),
        }
    }
}

fn set_parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(value) = get(key).and_then(|v| v.trim().parse().ok()) {
        *target = value;
    }
}

/// Seconds as a chrono duration, saturating at the largest representable span.
pub(crate) fn secs(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Start of the trailing window of length `window` ending at `now`, clamped
/// to the earliest representable instant.
pub(crate) fn window_start(now: DateTime<Utc>, window: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.cluster_name, "ci-cluster");
        assert_eq!(settings.alerts.throttle_secs, 86_400);
        assert_eq!(settings.reconcile.rollout_timeout_secs, 900);
        assert_eq!(settings.watch.mode, WatchMode::Labeled);
    }

    #[test]
    fn test_yaml_overrides_only_given_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "clusterName: prod-eu\nalerts:\n  batchMinCount: 3\nwatch:\n  mode: broad\n"
        )
        .unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.cluster_name, "prod-eu");
        assert_eq!(settings.alerts.batch_min_count, 3);
        assert_eq!(settings.alerts.throttle_secs, 86_400);
        assert_eq!(settings.watch.mode, WatchMode::Broad);
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FYR_CLUSTER_NAME", "staging"),
            ("FYR_WATCH_MODE", "all"),
            ("FYR_MAX_INVESTIGATIONS_PER_NAMESPACE", "2"),
            ("FYR_ROLLOUT_TIMEOUT_SECONDS", "not-a-number"),
            ("FYR_ALERT_WEBHOOK_SECRET", ""),
        ]);
        let mut settings = Settings::default();
        settings.apply_env(|k| vars.get(k).map(ToString::to_string));

        assert_eq!(settings.cluster_name, "staging");
        assert_eq!(settings.watch.mode, WatchMode::All);
        assert_eq!(settings.jobs.max_per_namespace_per_hour, 2);
        assert_eq!(settings.reconcile.rollout_timeout_secs, 900);
        assert!(settings.server.alert_webhook_secret.is_none());
    }

    #[test]
    #[serial]
    fn test_load_reads_process_env() {
        std::env::set_var("FYR_ALERT_BATCH_MIN_COUNT", "4");
        let settings = Settings::load(None);
        std::env::remove_var("FYR_ALERT_BATCH_MIN_COUNT");
        assert_eq!(settings.unwrap().alerts.batch_min_count, 4);
    }

    #[test]
    fn test_validate_rejects_zero_batch_minimum() {
        let mut settings = Settings::default();
        settings.alerts.batch_min_count = 0;
        assert!(matches!(settings.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_absurd_durations() {
        let mut settings = Settings::default();
        settings.alerts.throttle_secs = 10_000_000_000_000_000;
        assert!(matches!(settings.validate(), Err(Error::ConfigError(_))));

        let mut settings = Settings::default();
        settings.reconcile.interval_secs = MAX_DURATION_SECS + 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_huge_windows_saturate_instead_of_panicking() {
        let mut settings = Settings::default();
        settings.alerts.throttle_secs = 10_000_000_000_000_000;
        settings.alerts.correlation_window_secs = u64::MAX;
        assert_eq!(settings.throttle_window(), chrono::Duration::MAX);

        let now = Utc::now();
        assert_eq!(
            window_start(now, settings.correlation_window()),
            DateTime::<Utc>::MIN_UTC
        );
        assert_eq!(secs(90), chrono::Duration::seconds(90));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut settings = Settings::default();
        settings.reconcile.interval_secs = 0;
        assert!(settings.validate().is_err());
    }
}
