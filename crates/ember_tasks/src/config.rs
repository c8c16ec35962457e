//! # Task System Configuration
//!
//! Loaded once at startup (usually from the `[tasks]` table of the engine
//! TOML file).

use std::thread;
use std::time::Duration;

use ember_core::MultiPoolSettings;
use serde::{Deserialize, Serialize};

use crate::error::{TaskError, TaskResult};

/// Smallest stream count: Main, IO and two workers.
pub const MIN_STREAMS: usize = 4;

/// Largest stream count: one bit per stream in an affinity mask.
pub const MAX_STREAMS: usize = 64;

/// Scheduler settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSystemConfig {
    /// Total streams including Main and IO. `None` means one per hardware
    /// thread (at least [`MIN_STREAMS`]).
    pub stream_count: Option<usize>,
    /// Longest an idle stream sleeps before re-checking for work and
    /// shutdown (ms).
    pub idle_wait_ms: u64,
    /// Slices running longer than this are reported as slow (ms).
    pub slow_task_threshold_ms: u64,
    /// Growth policy of every stream's private multi-pool.
    pub stream_allocator: MultiPoolSettings,
}

impl Default for TaskSystemConfig {
    fn default() -> Self {
        Self {
            stream_count: None,
            idle_wait_ms: 5,
            slow_task_threshold_ms: 16,
            stream_allocator: MultiPoolSettings::default(),
        }
    }
}

impl TaskSystemConfig {
    /// Config with an explicit stream count.
    #[must_use]
    pub fn with_streams(stream_count: usize) -> Self {
        Self {
            stream_count: Some(stream_count),
            ..Self::default()
        }
    }

    /// The stream count the system will build.
    #[must_use]
    pub fn resolved_stream_count(&self) -> usize {
        self.stream_count.unwrap_or_else(|| {
            thread::available_parallelism()
                .map_or(MIN_STREAMS, usize::from)
                .clamp(MIN_STREAMS, MAX_STREAMS)
        })
    }

    /// Idle wait as a duration.
    #[must_use]
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    /// Slow-task threshold as a duration.
    #[must_use]
    pub fn slow_task_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_task_threshold_ms)
    }

    /// Validates the settings and returns the stream count.
    ///
    /// # Errors
    ///
    /// Rejects stream counts outside `MIN_STREAMS..=MAX_STREAMS`, a zero
    /// idle wait and invalid allocator settings.
    pub fn validate(&self) -> TaskResult<usize> {
        let count = self.resolved_stream_count();
        if count < MIN_STREAMS {
            return Err(TaskError::TooFewStreams {
                requested: count,
                minimum: MIN_STREAMS,
            });
        }
        if count > MAX_STREAMS {
            return Err(TaskError::TooManyStreams {
                requested: count,
                maximum: MAX_STREAMS,
            });
        }
        if self.idle_wait_ms == 0 {
            return Err(TaskError::InvalidConfig("idle_wait_ms must be non-zero".into()));
        }
        self.stream_allocator.validate()?;
        Ok(count)
    }
}
