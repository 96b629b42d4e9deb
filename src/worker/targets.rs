/// Execution target resolution for SSH jobs
///
/// Connection details and credentials for a `(user, server)` pair are looked
/// up through a `TargetSource` and cached for a TTL. Handlers invalidate an
/// entry when a connection attempt with it fails, so rotated credentials are
/// picked up on the next job instead of after the TTL.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// A resolved remote host plus the credentials to reach it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTarget {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Private key or password material, as stored by the owning application
    #[serde(skip_serializing)]
    pub credential: String,
}

/// Where targets come from (server inventory, secret store, ...)
#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn load_target(&self, user_id: &str, server_id: &str) -> anyhow::Result<Option<ExecutionTarget>>;
}

/// Fixed inventory, keyed by `(user, server)`
#[derive(Debug, Default)]
pub struct StaticTargetSource {
    targets: HashMap<(String, String), ExecutionTarget>,
}

impl StaticTargetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, user_id: impl Into<String>, target: ExecutionTarget) -> Self {
        self.targets
            .insert((user_id.into(), target.server_id.clone()), target);
        self
    }
}

#[async_trait]
impl TargetSource for StaticTargetSource {
    async fn load_target(&self, user_id: &str, server_id: &str) -> anyhow::Result<Option<ExecutionTarget>> {
        Ok(self
            .targets
            .get(&(user_id.to_string(), server_id.to_string()))
            .cloned())
    }
}

struct CachedTarget {
    target: Arc<ExecutionTarget>,
    loaded_at: Instant,
}

/// TTL cache in front of a `TargetSource`
pub struct TargetResolver {
    source: Arc<dyn TargetSource>,
    ttl: Duration,
    cache: RwLock<HashMap<(String, String), CachedTarget>>,
}

impl TargetResolver {
    pub fn new(source: Arc<dyn TargetSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached target if still fresh, otherwise a fresh load
    pub async fn resolve(&self, user_id: &str, server_id: &str) -> anyhow::Result<Arc<ExecutionTarget>> {
        let key = (user_id.to_string(), server_id.to_string());

        if let Ok(cache) = self.cache.read() {
            if let Some(cached) = cache.get(&key) {
                if cached.loaded_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&cached.target));
                }
            }
        }

        let target = self
            .source
            .load_target(user_id, server_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown server '{}' for user '{}'", server_id, user_id))?;
        let target = Arc::new(target);

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                key,
                CachedTarget {
                    target: Arc::clone(&target),
                    loaded_at: Instant::now(),
                },
            );
        }

        tracing::debug!("🔑 Resolved target {} for user {}", server_id, user_id);
        Ok(target)
    }

    pub fn invalidate(&self, user_id: &str, server_id: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&(user_id.to_string(), server_id.to_string()));
        }
    }

    /// Drop every cached target of one user
    pub fn invalidate_user(&self, user_id: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|(user, _), _| user != user_id);
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl TargetSource for CountingSource {
        async fn load_target(&self, _user_id: &str, server_id: &str) -> anyhow::Result<Option<ExecutionTarget>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if server_id == "missing" {
                return Ok(None);
            }
            Ok(Some(ExecutionTarget {
                server_id: server_id.to_string(),
                host: "10.0.0.5".to_string(),
                port: 22,
                username: "deploy".to_string(),
                credential: "key".to_string(),
            }))
        }
    }

    #[tokio::test]
    async fn caches_until_invalidated() {
        let source = Arc::new(CountingSource { loads: AtomicUsize::new(0) });
        let resolver = TargetResolver::new(source.clone(), Duration::from_secs(60));

        resolver.resolve("u1", "srv-1").await.unwrap();
        resolver.resolve("u1", "srv-1").await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        resolver.invalidate("u1", "srv-1");
        resolver.resolve("u1", "srv-1").await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);

        resolver.resolve("u1", "srv-2").await.unwrap();
        resolver.resolve("u2", "srv-1").await.unwrap();
        assert_eq!(resolver.cached_len(), 3);

        resolver.invalidate_user("u1");
        assert_eq!(resolver.cached_len(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_reloaded_and_unknown_servers_fail() {
        let source = Arc::new(CountingSource { loads: AtomicUsize::new(0) });
        let resolver = TargetResolver::new(source.clone(), Duration::ZERO);

        resolver.resolve("u1", "srv-1").await.unwrap();
        resolver.resolve("u1", "srv-1").await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);

        assert!(resolver.resolve("u1", "missing").await.is_err());
    }
}
