//! # Runtime
//!
//! Startup order:
//! 1. Merge the persisted multi-pool config cache into the global cache
//! 2. Start the task system (stream allocators pick their banks from it)
//!
//! Shutdown reverses it: stop the task system so every stream allocator
//! records its banks, then write the cache back.

use std::path::Path;

use ember_core::memory::{config_cache, registry, MultiPoolConfigCache};
use ember_tasks::TaskSystem;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineResult;

/// The running engine core.
pub struct Runtime {
    config: EngineConfig,
    tasks: TaskSystem,
    stopped: bool,
}

impl Runtime {
    /// Loads the config cache and starts the task system.
    ///
    /// A missing or rejected cache file is not an error: the allocators
    /// simply start without pre-created banks.
    ///
    /// # Errors
    ///
    /// Fails if the task system cannot start.
    pub fn start(config: EngineConfig) -> EngineResult<Self> {
        if config.memory.persist_config_cache {
            load_config_cache(&config.memory.config_cache_path);
        }
        let tasks = TaskSystem::new(config.tasks.clone())?;
        info!(
            streams = tasks.stream_count(),
            allocators = registry().registered_count(),
            "runtime started"
        );
        Ok(Self {
            config,
            tasks,
            stopped: false,
        })
    }

    /// The task system.
    #[must_use]
    pub fn tasks(&self) -> &TaskSystem {
        &self.tasks
    }

    /// Configuration the runtime was started with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stops the task system and persists the config cache.
    ///
    /// # Errors
    ///
    /// Fails if the cache file cannot be written.
    pub fn shutdown(mut self) -> EngineResult<()> {
        self.stop()
    }

    fn stop(&mut self) -> EngineResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        // Joining the stream threads drops their allocators, which records
        // their banks into the cache.
        self.tasks.shutdown();
        registry().log_report();

        if self.config.memory.persist_config_cache {
            let path = &self.config.memory.config_cache_path;
            config_cache().lock().save(path)?;
        }
        info!("runtime stopped");
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            warn!(%error, "runtime shutdown failed");
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("tasks", &self.tasks)
            .field("stopped", &self.stopped)
            .finish()
    }
}

/// Merges the cache at `path` into the global cache.
fn load_config_cache(path: &Path) {
    if !path.exists() {
        debug!(path = %path.display(), "no multi-pool config cache yet");
        return;
    }
    match MultiPoolConfigCache::load(path) {
        Ok(loaded) => {
            let mut cache = config_cache().lock();
            for (name, configs) in loaded.iter() {
                cache.record(name, configs);
            }
            debug!(path = %path.display(), entries = loaded.len(), "multi-pool config cache loaded");
        }
        Err(error) => {
            warn!(path = %path.display(), %error, "ignoring multi-pool config cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::memory::PoolConfig;
    use std::env::temp_dir;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(tag: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        temp_dir().join(format!("ember_runtime_{tag}_{nanos}.dat"))
    }

    #[test]
    fn test_load_merges_into_global_cache() {
        let path = temp_path("merge");
        let mut cache = MultiPoolConfigCache::new();
        cache.record("runtime::merge", &[PoolConfig::new(64, 10)]);
        cache.save(&path).unwrap();

        load_config_cache(&path);
        assert_eq!(
            config_cache().lock().get("runtime::merge"),
            Some(&[PoolConfig::new(64, 10)][..])
        );
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_corrupt_cache_is_ignored() {
        let path = temp_path("corrupt");
        std::fs::write(&path, b"not a cache").unwrap();
        load_config_cache(&path);
        std::fs::remove_file(&path).ok();
    }
}
