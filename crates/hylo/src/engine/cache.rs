use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use super::EngineArtifact;

/// Identity of one engine build: what was converted, how, and by which runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineCacheKey {
    pub segment_fingerprint: u64,
    pub config_digest: u64,
    pub runtime: String,
    pub version_tag: String,
}

type CachedBuild = Result<EngineArtifact, String>;
type EngineCacheEntry = Arc<OnceLock<CachedBuild>>;

/// Memoizes engine builds so retries and recompilations reuse finished work.
/// Concurrent requests for the same key build once.
#[derive(Default)]
pub struct EngineCache {
    entries: Mutex<HashMap<EngineCacheKey, EngineCacheEntry>>,
}

impl EngineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached result for `key`, building it with `build` on a miss.
    /// The flag reports whether the result came from the cache.
    pub fn get_or_build<F>(&self, key: EngineCacheKey, build: F) -> (CachedBuild, bool)
    where
        F: FnOnce() -> CachedBuild,
    {
        let cell = {
            let mut guard = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            guard
                .entry(key)
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone()
        };

        if let Some(existing) = cell.get() {
            return (existing.clone(), true);
        }

        let mut built_here = false;
        let result = cell.get_or_init(|| {
            built_here = true;
            build()
        });
        (result.clone(), !built_here)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|cell| cell.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
