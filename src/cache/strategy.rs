//! Fetch Strategies
//!
//! Named policies that combine a cache lookup with a caller-supplied fetch.
//!
//! | Strategy | Behavior |
//! |---|---|
//! | `cache-first` | cached value, else fetch + store |
//! | `network-first` | fetch + store, cached value on fetch failure |
//! | `stale-while-revalidate` | cached value now, refresh in the background |
//! | `network-only` | fetch, cache untouched |
//! | `cache-only` | cached value or [`Error::CacheOnlyMiss`] |

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::coordinator::{CacheCoordinator, SetOptions};
use crate::error::{Error, Result};

/// A named read/refresh policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    NetworkOnly,
    CacheOnly,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::CacheFirst,
        Strategy::NetworkFirst,
        Strategy::StaleWhileRevalidate,
        Strategy::NetworkOnly,
        Strategy::CacheOnly,
    ];

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::CacheFirst => "cache-first",
            Strategy::NetworkFirst => "network-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
            Strategy::NetworkOnly => "network-only",
            Strategy::CacheOnly => "cache-only",
        }
    }

    /// Whether the strategy ever consults the cache
    pub fn reads_cache(&self) -> bool {
        !matches!(self, Strategy::NetworkOnly)
    }

    /// Whether the strategy ever invokes the fetch function
    pub fn fetches(&self) -> bool {
        !matches!(self, Strategy::CacheOnly)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.name() == s)
            .ok_or_else(|| Error::UnknownStrategy(s.to_string()))
    }
}

/// Resolves strategy names, including aliases
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    names: HashMap<String, Strategy>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            names: HashMap::new(),
        };
        for strategy in Strategy::ALL {
            registry.register(strategy.name(), strategy);
        }
        registry.register("cacheFirst", Strategy::CacheFirst);
        registry.register("networkFirst", Strategy::NetworkFirst);
        registry.register("staleWhileRevalidate", Strategy::StaleWhileRevalidate);
        registry.register("swr", Strategy::StaleWhileRevalidate);
        registry.register("networkOnly", Strategy::NetworkOnly);
        registry.register("cacheOnly", Strategy::CacheOnly);
        registry
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a name
    pub fn register(&mut self, name: impl Into<String>, strategy: Strategy) {
        self.names.insert(name.into(), strategy);
    }

    pub fn resolve(&self, name: &str) -> Result<Strategy> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl CacheCoordinator {
    /// Register `name` as an alias for `strategy` on this cache
    pub fn register_strategy(&self, name: impl Into<String>, strategy: Strategy) {
        let name = name.into();
        debug!(name = %name, strategy = %strategy, "Strategy name registered");
        self.strategies.write().register(name, strategy);
    }

    /// Names accepted by [`execute_strategy`](Self::execute_strategy), sorted
    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies
            .read()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Run the strategy registered under `name`
    pub async fn execute_strategy<F, Fut>(
        self: &Arc<Self>,
        name: &str,
        key: &str,
        fetch: F,
        options: SetOptions,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let strategy = self.strategies.read().resolve(name)?;
        self.execute(strategy, key, fetch, options).await
    }

    /// Run `strategy` for `key`, calling `fetch` as the policy requires
    pub async fn execute<F, Fut>(
        self: &Arc<Self>,
        strategy: Strategy,
        key: &str,
        fetch: F,
        options: SetOptions,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let options = options.with_strategy(strategy.name());

        match strategy {
            Strategy::CacheFirst => {
                if let Some(cached) = self.get(key).await {
                    return Ok(cached);
                }
                self.fetch_and_store(key, fetch, options).await
            }

            Strategy::NetworkFirst => match fetch().await {
                Ok(fresh) => {
                    self.set(key, fresh.clone(), options).await;
                    Ok(fresh)
                }
                Err(source) => match self.get(key).await {
                    Some(cached) => {
                        warn!(key, error = %source, "Fetch failed, serving cached value");
                        Ok(cached)
                    }
                    None => Err(Error::NoNetworkNoCache {
                        key: key.to_string(),
                        source,
                    }),
                },
            },

            Strategy::StaleWhileRevalidate => match self.get(key).await {
                Some(cached) => {
                    let cache = Arc::clone(self);
                    let key = key.to_string();
                    tokio::spawn(async move { cache.revalidate(key, fetch, options).await });
                    Ok(cached)
                }
                None => self.fetch_and_store(key, fetch, options).await,
            },

            Strategy::NetworkOnly => fetch().await.map_err(|source| Error::FetchFailed {
                key: key.to_string(),
                source,
            }),

            Strategy::CacheOnly => self.get(key).await.ok_or_else(|| Error::CacheOnlyMiss {
                key: key.to_string(),
            }),
        }
    }

    async fn fetch_and_store<F, Fut>(&self, key: &str, fetch: F, options: SetOptions) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Bytes>>,
    {
        let fresh = fetch().await.map_err(|source| Error::FetchFailed {
            key: key.to_string(),
            source,
        })?;
        self.set(key, fresh.clone(), options).await;
        Ok(fresh)
    }

    /// Background refresh; the caller already has a response, so failures
    /// are only logged
    async fn revalidate<F, Fut>(&self, key: String, fetch: F, options: SetOptions)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Bytes>>,
    {
        match fetch().await {
            Ok(fresh) => {
                self.set(&key, fresh, options).await;
                self.metrics().record_background_refresh(true);
                debug!(key = %key, "Background revalidation stored fresh value");
            }
            Err(e) => {
                self.metrics().record_background_refresh(false);
                warn!(key = %key, error = %e, "Background revalidation failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting(
        calls: &Arc<AtomicUsize>,
        value: &'static [u8],
    ) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send>>
           + Send
           + 'static {
        let calls = Arc::clone(calls);
        move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::from_static(value))
            })
        }
    }

    fn failing(
        calls: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send>>
           + Send
           + 'static {
        let calls = Arc::clone(calls);
        move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("network unreachable"))
            })
        }
    }

    #[test]
    fn test_names_round_trip() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.name().parse::<Strategy>().unwrap(), strategy);
            assert_eq!(strategy.to_string(), strategy.name());
        }
        assert_matches!("cache-last".parse::<Strategy>(), Err(Error::UnknownStrategy(_)));
        assert_eq!(
            serde_json::to_string(&Strategy::StaleWhileRevalidate).unwrap(),
            "\"stale-while-revalidate\""
        );
    }

    #[test]
    fn test_registry_aliases() {
        let registry = StrategyRegistry::new();
        assert_eq!(registry.resolve("swr").unwrap(), Strategy::StaleWhileRevalidate);
        assert_eq!(registry.resolve("cacheFirst").unwrap(), Strategy::CacheFirst);
        assert_matches!(registry.resolve("nope"), Err(Error::UnknownStrategy(_)));
        assert!(registry.names().contains(&"network-only"));
    }

    #[test]
    fn test_strategy_capabilities() {
        assert!(!Strategy::NetworkOnly.reads_cache());
        assert!(!Strategy::CacheOnly.fetches());
        assert!(Strategy::StaleWhileRevalidate.reads_cache());
    }

    #[tokio::test]
    async fn test_cache_first_skips_fetch_when_cached() {
        let cache = CacheCoordinator::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .execute(Strategy::CacheFirst, "k", counting(&calls, b"v1"), SetOptions::new())
            .await
            .unwrap();
        let second = cache
            .execute(Strategy::CacheFirst, "k", counting(&calls, b"v2"), SetOptions::new())
            .await
            .unwrap();

        assert_eq!(first.as_ref(), b"v1");
        assert_eq!(second.as_ref(), b"v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_first_prefers_fresh() {
        let cache = CacheCoordinator::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .set("k", Bytes::from_static(b"old"), SetOptions::new())
            .await;

        let value = cache
            .execute(Strategy::NetworkFirst, "k", counting(&calls, b"new"), SetOptions::new())
            .await
            .unwrap();
        assert_eq!(value.as_ref(), b"new");
        assert_eq!(cache.get("k").await.unwrap().as_ref(), b"new");
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_cache() {
        let cache = CacheCoordinator::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .set("k", Bytes::from_static(b"cached"), SetOptions::new())
            .await;

        let value = cache
            .execute(Strategy::NetworkFirst, "k", failing(&calls), SetOptions::new())
            .await
            .unwrap();
        assert_eq!(value.as_ref(), b"cached");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_first_without_cache_errors() {
        let cache = CacheCoordinator::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));

        let result = cache
            .execute(Strategy::NetworkFirst, "k", failing(&calls), SetOptions::new())
            .await;
        assert_matches!(result, Err(Error::NoNetworkNoCache { .. }));
    }

    #[tokio::test]
    async fn test_cache_only_never_fetches() {
        let cache = CacheCoordinator::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));

        let result = cache
            .execute(Strategy::CacheOnly, "k", counting(&calls, b"v"), SetOptions::new())
            .await;
        assert_matches!(result, Err(Error::CacheOnlyMiss { key }) if key == "k");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_network_only_bypasses_cache() {
        let cache = CacheCoordinator::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .set("k", Bytes::from_static(b"cached"), SetOptions::new())
            .await;

        let value = cache
            .execute(Strategy::NetworkOnly, "k", counting(&calls, b"live"), SetOptions::new())
            .await
            .unwrap();
        assert_eq!(value.as_ref(), b"live");
        assert_eq!(cache.get("k").await.unwrap().as_ref(), b"cached");

        let result = cache
            .execute(Strategy::NetworkOnly, "k", failing(&calls), SetOptions::new())
            .await;
        assert_matches!(result, Err(Error::FetchFailed { .. }));
    }

    #[tokio::test]
    async fn test_swr_serves_stale_then_refreshes() {
        let cache = CacheCoordinator::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .set("k", Bytes::from_static(b"stale"), SetOptions::new())
            .await;

        let value = cache
            .execute_strategy("swr", "k", counting(&calls, b"fresh"), SetOptions::new())
            .await
            .unwrap();
        assert_eq!(value.as_ref(), b"stale");

        for _ in 0..50 {
            if cache.get("k").await.as_deref() == Some(b"fresh".as_slice()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.get("k").await.unwrap().as_ref(), b"fresh");
        assert_eq!(cache.metrics().snapshot().background_refreshes, 1);
    }

    #[tokio::test]
    async fn test_swr_blocks_when_empty_and_swallows_background_errors() {
        let cache = CacheCoordinator::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));

        let value = cache
            .execute(
                Strategy::StaleWhileRevalidate,
                "k",
                counting(&calls, b"first"),
                SetOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(value.as_ref(), b"first");

        let value = cache
            .execute(Strategy::StaleWhileRevalidate, "k", failing(&calls), SetOptions::new())
            .await
            .unwrap();
        assert_eq!(value.as_ref(), b"first");

        for _ in 0..50 {
            if cache.metrics().snapshot().background_refresh_failures == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.metrics().snapshot().background_refresh_failures, 1);
        assert_eq!(cache.get("k").await.unwrap().as_ref(), b"first");
    }

    #[tokio::test]
    async fn test_execute_strategy_unknown_name() {
        let cache = CacheCoordinator::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));
        let result = cache
            .execute_strategy("eventually", "k", counting(&calls, b"v"), SetOptions::new())
            .await;
        assert_matches!(result, Err(Error::UnknownStrategy(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registered_alias_resolves_on_same_cache() {
        let cache = CacheCoordinator::in_memory();
        let other = CacheCoordinator::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.register_strategy("offline", Strategy::CacheOnly);
        assert!(cache.strategy_names().contains(&"offline".to_string()));
        assert!(!other.strategy_names().contains(&"offline".to_string()));

        let result = cache
            .execute_strategy("offline", "k", counting(&calls, b"v"), SetOptions::new())
            .await;
        assert_matches!(result, Err(Error::CacheOnlyMiss { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cache
            .set("k", Bytes::from_static(b"stored"), SetOptions::new())
            .await;
        let value = cache
            .execute_strategy("offline", "k", counting(&calls, b"v"), SetOptions::new())
            .await
            .unwrap();
        assert_eq!(value.as_ref(), b"stored");

        let result = other
            .execute_strategy("offline", "k", counting(&calls, b"v"), SetOptions::new())
            .await;
        assert_matches!(result, Err(Error::UnknownStrategy(_)));
    }

    #[tokio::test]
    async fn test_strategy_tag_recorded() {
        let cache = CacheCoordinator::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .execute(Strategy::CacheFirst, "k", counting(&calls, b"v"), SetOptions::new())
            .await
            .unwrap();

        let edge = cache.tier(crate::cache::TierKind::Edge).unwrap();
        let stored = edge.read("k").await.unwrap().unwrap();
        assert_eq!(stored.meta.strategy.as_deref(), Some("cache-first"));
    }
}
