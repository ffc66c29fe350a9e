//! TTL-bounded cache of namespace opt-in annotations.
//!
//! Entries expire on read; there is no background sweep.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cluster::ClusterClient;
use crate::config::WatchSettings;

/// Opt-in metadata read from a namespace's annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceMetadata {
    /// Enable annotation set to `"true"`
    pub enabled: bool,
    pub team: Option<String>,
    pub notify_target: Option<String>,
    /// Every annotation under the configured prefix
    pub annotations: BTreeMap<String, String>,
}

impl NamespaceMetadata {
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
        prefix: &str,
        enable_key: &str,
    ) -> Self {
        let non_empty = |key: &str| annotations.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            enabled: annotations.get(enable_key).is_some_and(|v| v == "true"),
            team: non_empty(&format!("{prefix}team")),
            notify_target: non_empty(&format!("{prefix}slack-channel")),
            annotations: annotations
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

pub struct NamespaceCache {
    cluster: Arc<dyn ClusterClient>,
    ttl: Duration,
    prefix: String,
    enable_key: String,
    entries: RwLock<HashMap<String, (Instant, NamespaceMetadata)>>,
}

impl NamespaceCache {
    pub fn new(cluster: Arc<dyn ClusterClient>, settings: &WatchSettings) -> Self {
        Self {
            cluster,
            ttl: Duration::from_secs(settings.namespace_cache_ttl_secs),
            prefix: settings.annotation_prefix.clone(),
            enable_key: settings.enable_label.clone(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached metadata for `namespace`, refreshed once the entry is older than the TTL.
    ///
    /// Read failures are cached as empty metadata so a flaky API is not hammered.
    pub async fn get(&self, namespace: &str) -> NamespaceMetadata {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            if let Some((fetched_at, metadata)) = entries.get(namespace) {
                if now.duration_since(*fetched_at) < self.ttl {
                    return metadata.clone();
                }
            }
        }

        let metadata = match self.cluster.get_namespace(namespace).await {
            Ok(Some(info)) => {
                NamespaceMetadata::from_annotations(&info.annotations, &self.prefix, &self.enable_key)
            }
            Ok(None) => NamespaceMetadata::default(),
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Failed to read namespace metadata");
                NamespaceMetadata::default()
            }
        };
        debug!(namespace = %namespace, enabled = metadata.enabled, "Refreshed namespace metadata");

        self.entries
            .write()
            .await
            .insert(namespace.to_string(), (now, metadata.clone()));
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::config::Settings;

    #[test]
    fn test_from_annotations() {
        let annotations = BTreeMap::from([
            ("fyr/enabled".to_string(), "true".to_string()),
            ("fyr/team".to_string(), "payments".to_string()),
            ("fyr/slack-channel".to_string(), "#payments".to_string()),
            ("other/key".to_string(), "x".to_string()),
        ]);
        let metadata = NamespaceMetadata::from_annotations(&annotations, "fyr/", "fyr/enabled");
        assert!(metadata.enabled);
        assert_eq!(metadata.team.as_deref(), Some("payments"));
        assert_eq!(metadata.notify_target.as_deref(), Some("#payments"));
        assert_eq!(metadata.annotations.len(), 3);
        assert!(!metadata.annotations.contains_key("other/key"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.put_namespace("shop", &[("fyr/team", "storefront")]);
        let cache = NamespaceCache::new(cluster.clone(), &Settings::default().watch);

        assert_eq!(cache.get("shop").await.team.as_deref(), Some("storefront"));
        cluster.put_namespace("shop", &[("fyr/team", "platform")]);
        assert_eq!(cache.get("shop").await.team.as_deref(), Some("storefront"));
        assert_eq!(*cluster.namespace_reads.lock().unwrap(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("shop").await.team.as_deref(), Some("platform"));
        assert_eq!(*cluster.namespace_reads.lock().unwrap(), 2);
    }
}
