// SPDX-License-Identifier: MIT

//! Bounded, time-expiring cache of validated workflow definitions
//!
//! Entries are keyed by file path and carry the fingerprint they were
//! validated from. A hit requires the current fingerprint to match and the
//! entry to be younger than the TTL; anything else reloads. Definitions that
//! fail validation are never stored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::loader::{Fingerprint, WorkflowLoader};
use super::types::WorkflowDefinition;
use crate::config::EngineConfig;
use crate::error::DefinitionError;

struct CacheEntry {
    fingerprint: Fingerprint,
    definition: Arc<WorkflowDefinition>,
    inserted: Instant,
    last_used: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<PathBuf, CacheEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Clone)]
pub struct DefinitionCache {
    inner: Arc<RwLock<CacheInner>>,
    capacity: usize,
    ttl: Duration,
}

impl DefinitionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner::default())),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.definition_cache_capacity,
            config.definition_cache_ttl(),
        )
    }

    /// Return the cached definition for `path`, loading and validating it on a miss
    pub async fn get_or_load<P: AsRef<Path>>(
        &self,
        path: P,
        loader: &WorkflowLoader,
    ) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        let path = path.as_ref();
        let fingerprint = Fingerprint::of(path)?;

        if let Some(def) = self.lookup(&fingerprint).await {
            return Ok(def);
        }

        let definition = Arc::new(loader.load_workflow(path)?);
        self.insert(fingerprint, definition.clone()).await;
        Ok(definition)
    }

    /// Fresh entry matching the fingerprint, if any
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<WorkflowDefinition>> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        let fresh = match inner.entries.get_mut(&fingerprint.path) {
            Some(entry)
                if entry.fingerprint == *fingerprint && entry.inserted.elapsed() < self.ttl =>
            {
                entry.last_used = tick;
                Some(entry.definition.clone())
            }
            Some(_) => {
                log::debug!(
                    "Cached definition for {} is stale",
                    fingerprint.path.display()
                );
                inner.entries.remove(&fingerprint.path);
                None
            }
            None => None,
        };

        match fresh {
            Some(def) => {
                inner.hits += 1;
                Some(def)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub async fn insert(&self, fingerprint: Fingerprint, definition: Arc<WorkflowDefinition>) {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        inner.tick += 1;
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            definition,
            inserted: Instant::now(),
            last_used: inner.tick,
        };
        inner.entries.insert(fingerprint.path, entry);

        while inner.entries.len() > self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(path, _)| path.clone());
            match oldest {
                Some(path) => {
                    log::debug!("Evicting cached definition {}", path.display());
                    inner.entries.remove(&path);
                }
                None => break,
            }
        }
    }

    pub async fn invalidate<P: AsRef<Path>>(&self, path: P) -> bool {
        self.inner
            .write()
            .await
            .entries
            .remove(path.as_ref())
            .is_some()
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len(),
        }
    }
}

impl Default for DefinitionCache {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn workflow_file(name: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "name: {}\nversion: 1\nsteps:\n  - id: done\n    type: terminate\n",
            name
        )
        .unwrap();
        file
    }

    #[tokio::test]
    async fn test_hit_skips_reload() {
        let cache = DefinitionCache::new(4, Duration::from_secs(60));
        let loader = WorkflowLoader::default();
        let file = workflow_file("cached");

        let first = cache.get_or_load(file.path(), &loader).await.unwrap();
        let second = cache.get_or_load(file.path(), &loader).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_changed_fingerprint_reloads() {
        let cache = DefinitionCache::new(4, Duration::from_secs(60));
        let loader = WorkflowLoader::default();
        let file = workflow_file("before");

        let first = cache.get_or_load(file.path(), &loader).await.unwrap();
        assert_eq!(first.name, "before");

        // A different length changes the fingerprint even within one mtime tick
        std::fs::write(
            file.path(),
            "name: after_change\nversion: 2\nsteps:\n  - id: done\n    type: terminate\n",
        )
        .unwrap();

        let second = cache.get_or_load(file.path(), &loader).await.unwrap();
        assert_eq!(second.name, "after_change");
    }

    #[tokio::test]
    async fn test_failed_validation_not_cached() {
        let cache = DefinitionCache::new(4, Duration::from_secs(60));
        let loader = WorkflowLoader::default();
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "name: broken\nversion: 1\nsteps: []\n").unwrap();

        assert!(cache.get_or_load(file.path(), &loader).await.is_err());
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = DefinitionCache::new(4, Duration::ZERO);
        let loader = WorkflowLoader::default();
        let file = workflow_file("short_lived");

        cache.get_or_load(file.path(), &loader).await.unwrap();
        cache.get_or_load(file.path(), &loader).await.unwrap();
        assert_eq!(cache.stats().await.hits, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = DefinitionCache::new(2, Duration::from_secs(60));
        let loader = WorkflowLoader::default();
        let a = workflow_file("a");
        let b = workflow_file("b");
        let c = workflow_file("c");

        cache.get_or_load(a.path(), &loader).await.unwrap();
        cache.get_or_load(b.path(), &loader).await.unwrap();
        // Touch a so b becomes least recently used
        cache.get_or_load(a.path(), &loader).await.unwrap();
        cache.get_or_load(c.path(), &loader).await.unwrap();

        assert_eq!(cache.stats().await.entries, 2);
        assert!(!cache.invalidate(b.path()).await);
        assert!(cache.invalidate(a.path()).await);
    }
}
