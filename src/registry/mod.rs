//! Model registry adapter
//!
//! Resolves `(model name, version)` to a runnable container image plus
//! optional resource hints. The adapter is pure lookup: no mutation, no side
//! effects. Positive resolutions are cached briefly; negative results are
//! never cached, so a freshly published model becomes schedulable without
//! waiting out a TTL.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Default TTL for cached positive resolutions
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Optional per-model resource hints published alongside the artifact
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHints {
    /// Recommended CPU multiplier over the workload's request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_multiplier: Option<f64>,

    /// Recommended memory multiplier over the workload's request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_multiplier: Option<f64>,
}

/// A successful registry resolution
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedModel {
    /// Container image reference serving this model version
    pub image: String,
    /// Resource hints, when the registry publishes them
    pub hints: Option<ResourceHints>,
}

/// Registry lookup interface
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Resolve a model identity to a runnable artifact.
    ///
    /// Version `""` or `"latest"` resolves to the most recent published
    /// version. Fails with [`Error::ModelNotFound`] for unknown identities
    /// and [`Error::RegistryUnavailable`] for reachability problems.
    async fn resolve(&self, name: &str, version: &str) -> Result<ResolvedModel, Error>;

    /// Lightweight reachability check for the health endpoint
    async fn probe(&self) -> Result<(), Error>;
}

// =============================================================================
// File-backed catalog
// =============================================================================

/// One published version of a model in the catalog
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CatalogVersion {
    version: String,
    image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hints: Option<ResourceHints>,
}

/// One model entry in the catalog; versions are listed oldest-first
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CatalogModel {
    name: String,
    versions: Vec<CatalogVersion>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Catalog {
    #[serde(default)]
    models: Vec<CatalogModel>,
}

/// Registry backed by a YAML model catalog loaded at startup.
///
/// Resolution is in-memory, so this implementation never reports
/// `RegistryUnavailable` after a successful load.
#[derive(Debug)]
pub struct FileModelRegistry {
    /// `(name, version)` to resolution
    entries: BTreeMap<(String, String), ResolvedModel>,
    /// name to most recently published version
    latest: BTreeMap<String, String>,
}

impl FileModelRegistry {
    /// Load a catalog from a YAML file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::registry_unavailable(format!("cannot read model catalog {path:?}: {e}"))
        })?;
        Self::load_from_str(&content)
    }

    /// Load a catalog from YAML content
    pub fn load_from_str(content: &str) -> Result<Self, Error> {
        let catalog: Catalog = serde_yaml::from_str(content)
            .map_err(|e| Error::serialization(format!("invalid model catalog: {e}")))?;

        let mut entries = BTreeMap::new();
        let mut latest = BTreeMap::new();

        for model in catalog.models {
            if model.name.is_empty() {
                return Err(Error::serialization("model catalog entry without a name"));
            }
            for version in &model.versions {
                entries.insert(
                    (model.name.clone(), version.version.clone()),
                    ResolvedModel {
                        image: version.image.clone(),
                        hints: version.hints.clone(),
                    },
                );
                // Versions are listed oldest-first; the last one published wins
                latest.insert(model.name.clone(), version.version.clone());
            }
        }

        Ok(Self { entries, latest })
    }

    /// An empty catalog: every lookup is NotFound
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            latest: BTreeMap::new(),
        }
    }

    /// Number of `(model, version)` entries in the catalog
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the catalog holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ModelRegistry for FileModelRegistry {
    async fn resolve(&self, name: &str, version: &str) -> Result<ResolvedModel, Error> {
        let version = if version.is_empty() || version == "latest" {
            self.latest
                .get(name)
                .ok_or_else(|| Error::model_not_found(name, version))?
                .clone()
        } else {
            version.to_string()
        };

        self.entries
            .get(&(name.to_string(), version.clone()))
            .cloned()
            .ok_or_else(|| Error::model_not_found(name, version))
    }

    async fn probe(&self) -> Result<(), Error> {
        Ok(())
    }
}

// =============================================================================
// Caching wrapper
// =============================================================================

struct CacheEntry {
    resolved: ResolvedModel,
    inserted_at: Instant,
}

/// Caches positive resolutions from an inner registry for a short TTL.
///
/// Negative results pass through uncached.
pub struct CachingRegistry<R> {
    inner: R,
    ttl: Duration,
    cache: DashMap<String, CacheEntry>,
}

impl<R: ModelRegistry> CachingRegistry<R> {
    /// Wrap a registry with the default TTL
    pub fn new(inner: R) -> Self {
        Self::with_ttl(inner, DEFAULT_CACHE_TTL)
    }

    /// Wrap a registry with an explicit TTL
    pub fn with_ttl(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: DashMap::new(),
        }
    }

    fn cache_key(name: &str, version: &str) -> String {
        format!("{name}:{version}")
    }
}

#[async_trait]
impl<R: ModelRegistry> ModelRegistry for CachingRegistry<R> {
    async fn resolve(&self, name: &str, version: &str) -> Result<ResolvedModel, Error> {
        let key = Self::cache_key(name, version);

        if let Some(entry) = self.cache.get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                debug!(model = %key, "registry cache hit");
                return Ok(entry.resolved.clone());
            }
        }

        let resolved = self.inner.resolve(name, version).await?;
        self.cache.insert(
            key,
            CacheEntry {
                resolved: resolved.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(resolved)
    }

    async fn probe(&self) -> Result<(), Error> {
        self.inner.probe().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
models:
  - name: llama-7b
    versions:
      - version: v1
        image: registry.example.com/llama-7b:v1
        hints:
          cpuMultiplier: 1.2
          memoryMultiplier: 1.5
      - version: v2
        image: registry.example.com/llama-7b:v2
  - name: bert-base
    versions:
      - version: v1
        image: registry.example.com/bert-base:v1
"#;

    fn catalog() -> FileModelRegistry {
        FileModelRegistry::load_from_str(CATALOG).expect("catalog parses")
    }

    // =========================================================================
    // Story: Version Resolution
    // =========================================================================

    #[tokio::test]
    async fn story_exact_version_resolves() {
        let registry = catalog();
        let resolved = registry.resolve("llama-7b", "v1").await.expect("v1 exists");
        assert_eq!(resolved.image, "registry.example.com/llama-7b:v1");
        assert_eq!(
            resolved.hints.expect("v1 has hints").cpu_multiplier,
            Some(1.2)
        );
    }

    /// Story: "latest" and the empty string resolve to the newest version
    #[tokio::test]
    async fn story_latest_resolves_to_newest_published() {
        let registry = catalog();

        let latest = registry.resolve("llama-7b", "latest").await.expect("latest");
        assert_eq!(latest.image, "registry.example.com/llama-7b:v2");

        let empty = registry.resolve("llama-7b", "").await.expect("empty");
        assert_eq!(empty.image, "registry.example.com/llama-7b:v2");
    }

    /// Story: unknown models and unknown versions are NotFound
    #[tokio::test]
    async fn story_unknown_identities_are_not_found() {
        let registry = catalog();

        let err = registry.resolve("nonexistent", "latest").await.unwrap_err();
        assert!(matches!(err, Error::ModelNotFound { .. }));
        assert!(!err.is_retryable());

        let err = registry.resolve("llama-7b", "v99").await.unwrap_err();
        assert!(matches!(err, Error::ModelNotFound { .. }));
    }

    #[tokio::test]
    async fn story_malformed_catalog_is_rejected() {
        let err = FileModelRegistry::load_from_str("models: [{versions: 7}]").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    // =========================================================================
    // Story: Positive Caching Only
    // =========================================================================

    /// Story: repeated lookups inside the TTL hit the cache
    #[tokio::test]
    async fn story_positive_results_are_cached() {
        let mut inner = MockModelRegistry::new();
        inner
            .expect_resolve()
            .times(1)
            .returning(|_, _| {
                Ok(ResolvedModel {
                    image: "img:v1".to_string(),
                    hints: None,
                })
            });

        let caching = CachingRegistry::with_ttl(inner, Duration::from_secs(60));
        for _ in 0..5 {
            let resolved = caching.resolve("llama-7b", "v1").await.expect("resolves");
            assert_eq!(resolved.image, "img:v1");
        }
    }

    /// Story: expired entries are resolved again
    #[tokio::test]
    async fn story_expired_entries_are_refreshed() {
        let mut inner = MockModelRegistry::new();
        inner.expect_resolve().times(2).returning(|_, _| {
            Ok(ResolvedModel {
                image: "img:v1".to_string(),
                hints: None,
            })
        });

        let caching = CachingRegistry::with_ttl(inner, Duration::ZERO);
        caching.resolve("llama-7b", "v1").await.expect("first");
        caching.resolve("llama-7b", "v1").await.expect("second");
    }

    /// Story: negative results are never cached
    ///
    /// A model published right after a failed lookup must resolve on the
    /// next attempt, so every miss goes to the inner registry.
    #[tokio::test]
    async fn story_negative_results_are_not_cached() {
        let mut inner = MockModelRegistry::new();
        inner
            .expect_resolve()
            .times(3)
            .returning(|name, version| Err(Error::model_not_found(name, version)));

        let caching = CachingRegistry::with_ttl(inner, Duration::from_secs(60));
        for _ in 0..3 {
            let err = caching.resolve("ghost", "v1").await.unwrap_err();
            assert!(matches!(err, Error::ModelNotFound { .. }));
        }
    }

    #[tokio::test]
    async fn story_distinct_versions_cache_separately() {
        let mut inner = MockModelRegistry::new();
        inner.expect_resolve().times(2).returning(|_, version| {
            Ok(ResolvedModel {
                image: format!("img:{version}"),
                hints: None,
            })
        });

        let caching = CachingRegistry::with_ttl(inner, Duration::from_secs(60));
        assert_eq!(caching.resolve("m", "v1").await.unwrap().image, "img:v1");
        assert_eq!(caching.resolve("m", "v2").await.unwrap().image, "img:v2");
        // Cached now
        assert_eq!(caching.resolve("m", "v1").await.unwrap().image, "img:v1");
    }
}
