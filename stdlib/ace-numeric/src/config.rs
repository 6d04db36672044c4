//! Engine configuration.
//!
//! Configuration is layered: defaults, then an optional TOML file, then
//! environment variables.
//!
//! ```toml
//! [pool]
//! max_workers = 4
//! prewarm = true
//!
//! [accelerated]
//! module_path = "kernels.wasm"
//! max_memory_pages = 1024
//!
//! [thresholds.reduction]
//! accelerated = 2000
//! parallel = 200000
//!
//! [chunking.matrix_multiply]
//! min_batch = 4
//! ```

use crate::{EngineError, EngineResult};
use ace_dispatch::{apply_env_thresholds, ChunkOverrides, ThresholdOverrides};
use ace_rts_arena::{ArenaConfig, DEFAULT_MAX_POOL_ENTRIES, DEFAULT_POOLING_THRESHOLD};
use ace_rts_pool::PoolConfig;
use ace_wasm::{LoaderConfig, DEFAULT_MAX_MEMORY_PAGES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Accelerated module and arena settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratedConfig {
    /// Use the accelerated module at all.
    pub enabled: bool,
    /// Module file; the bundled module is used when `None`.
    pub module_path: Option<PathBuf>,
    /// Linear memory limit in 64 KiB pages.
    pub max_memory_pages: u32,
    /// Allocations above this many bytes bypass the arena pool.
    pub pooling_threshold: usize,
    /// Idle pool entries kept before the least recently released is evicted.
    pub max_pool_entries: usize,
}

impl Default for AcceleratedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            module_path: None,
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
            pooling_threshold: DEFAULT_POOLING_THRESHOLD,
            max_pool_entries: DEFAULT_MAX_POOL_ENTRIES,
        }
    }
}

impl AcceleratedConfig {
    /// Loader settings derived from this configuration.
    #[must_use]
    pub fn loader(&self) -> LoaderConfig {
        LoaderConfig {
            module_path: self.module_path.clone(),
            max_memory_pages: self.max_memory_pages,
        }
    }

    /// Arena settings derived from this configuration.
    #[must_use]
    pub fn arena(&self) -> ArenaConfig {
        ArenaConfig {
            pooling_threshold: self.pooling_threshold,
            max_pool_entries: self.max_pool_entries,
        }
    }
}

/// Everything needed to build an [`Engine`](crate::Engine).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool.
    pub pool: PoolConfig,
    /// Accelerated module and arena.
    pub accelerated: AcceleratedConfig,
    /// Per-category strategy threshold overrides.
    pub thresholds: ThresholdOverrides,
    /// Per-category chunking overrides.
    pub chunking: ChunkOverrides,
}

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Apply `ACE_*` overrides from the process environment.
    pub fn apply_process_env(&mut self) {
        self.apply_env_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `ACE_*` overrides, looking variables up with `lookup`.
    ///
    /// | Variable | Effect |
    /// |----------|--------|
    /// | `ACE_MAX_WORKERS` | `pool.max_workers` |
    /// | `ACE_MIN_WORKERS` | `pool.min_workers` |
    /// | `ACE_DISABLE_ACCEL` | truthy value disables the accelerated module |
    /// | `ACE_ACCEL_MODULE` | `accelerated.module_path` |
    /// | `ACE_<CATEGORY>_ACCEL_MIN` | accelerated threshold of a category |
    /// | `ACE_<CATEGORY>_PARALLEL_MIN` | parallel threshold of a category |
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = env_usize(&lookup, "ACE_MAX_WORKERS") {
            self.pool.max_workers = n;
        }
        if let Some(n) = env_usize(&lookup, "ACE_MIN_WORKERS") {
            self.pool.min_workers = n;
        }
        if let Some(value) = lookup("ACE_DISABLE_ACCEL") {
            if is_truthy(&value) {
                self.accelerated.enabled = false;
            }
        }
        if let Some(path) = lookup("ACE_ACCEL_MODULE") {
            let path = path.trim();
            if !path.is_empty() {
                self.accelerated.module_path = Some(PathBuf::from(path));
            }
        }
        apply_env_thresholds(&mut self.thresholds, &lookup);
    }
}

fn env_usize<F>(lookup: &F, key: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key)?;
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %value, "config: ignoring non-numeric override");
            None
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
