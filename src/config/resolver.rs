//! Cluster configuration resolution
//!
//! Resolves a cluster name to a validated `ClusterConfig`, with a
//! process-wide TTL cache in front of the external store and an in-code
//! default table behind it. Cache entries are immutable `Arc`s; a refresh
//! race at worst re-fetches the same document.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::cluster::ClusterConfig;
use super::defaults::builtin_cluster;
use super::store::ConfigStore;
use super::ConfigError;

const KEY_PREFIX: &str = "clusters:";
const CACHE_TTL: Duration = Duration::from_secs(60);

struct CacheEntry {
    config: Arc<ClusterConfig>,
    expires: Instant,
}

/// Process-wide cluster configuration cache
///
/// Populated lazily by the resolver, TTL-expired, externally invalidatable.
/// Passed by handle so tests can substitute a fresh instance.
#[derive(Default)]
pub struct ConfigCache {
    entries: DashMap<String, CacheEntry>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_live(&self, key: &str) -> Option<Arc<ClusterConfig>> {
        let entry = self.entries.get(key)?;
        if entry.expires > Instant::now() {
            Some(entry.config.clone())
        } else {
            None
        }
    }

    fn put(&self, key: String, config: Arc<ClusterConfig>, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                config,
                expires: Instant::now() + ttl,
            },
        );
    }

    /// Drop an entry immediately; safe to call concurrently with lookups
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Resolves cluster names to validated configuration
pub struct ConfigResolver {
    store: Arc<dyn ConfigStore>,
    cache: Arc<ConfigCache>,
    default_cluster: String,
    ttl: Duration,
}

impl ConfigResolver {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        cache: Arc<ConfigCache>,
        default_cluster: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            default_cluster: default_cluster.into(),
            ttl: CACHE_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn normalize(&self, name: Option<&str>) -> String {
        name.filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.default_cluster)
            .to_lowercase()
    }

    /// Resolve a cluster name (or the deployment default) to configuration
    ///
    /// A cache hit within the TTL returns the identical `Arc`. A miss reads
    /// the store under `clusters:<name>`, falls back to the built-in default
    /// table, validates, and caches the result.
    pub async fn resolve(&self, name: Option<&str>) -> Result<Arc<ClusterConfig>, ConfigError> {
        let key = self.normalize(name);

        if let Some(config) = self.cache.get_live(&key) {
            return Ok(config);
        }

        let persisted = self
            .store
            .get(&format!("{}{}", KEY_PREFIX, key))
            .await?;

        let config = match persisted {
            Some(document) => ClusterConfig::from_value(document)?,
            None => builtin_cluster(&key).ok_or_else(|| ConfigError::NotFound(key.clone()))?,
        };

        debug!(cluster = %key, version = %config.version, "resolved cluster configuration");

        let config = Arc::new(config);
        self.cache.put(key, config.clone(), self.ttl);
        Ok(config)
    }

    /// Remove a cached entry so the next lookup re-reads the store
    pub fn invalidate(&self, name: &str) {
        self.cache.invalidate(&name.to_lowercase());
    }
}
