//! # Engine Configuration
//!
//! One TOML file, every table optional:
//!
//! ```toml
//! [memory]
//! config_cache_path = ".multiPoolConfig.dat"
//! persist_config_cache = true
//!
//! [tasks]
//! stream_count = 8
//! idle_wait_ms = 5
//! slow_task_threshold_ms = 16
//!
//! [tasks.stream_allocator]
//! min_block_size = 16
//! bank_budget_bytes = 65536
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use ember_core::memory::DEFAULT_CONFIG_CACHE_FILE;
use ember_tasks::TaskSystemConfig;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Memory framework settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Where the multi-pool config cache lives.
    pub config_cache_path: PathBuf,
    /// Load the cache at startup and write it back at shutdown.
    pub persist_config_cache: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            config_cache_path: PathBuf::from(DEFAULT_CONFIG_CACHE_FILE),
            persist_config_cache: true,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `[memory]` table.
    pub memory: MemoryConfig,
    /// `[tasks]` table.
    pub tasks: TaskSystemConfig,
}

impl EngineConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] on malformed TOML or unknown value types.
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`EngineError::Io`] if the file cannot be read, otherwise as
    /// [`EngineConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serialises back to TOML.
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] if a value cannot be represented.
    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }
}
