//! Orchestrator configuration.

use crate::context::settings::{self, ConfigError, Settings};

/// Default capacity of a task's progress channel.
pub const DEFAULT_PROGRESS_CAPACITY: usize = 1024;

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Maximum number of tasks of one stage running at the same time.
    pub max_parallel_tasks: usize,
    /// Cancel the rest of a stage after its first non-skippable failure.
    pub fail_fast: bool,
    /// Buffered progress notifications per task before new ones are dropped.
    pub progress_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            fail_fast: false,
            progress_capacity: DEFAULT_PROGRESS_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PIPELINE_MAX_PARALLEL`: concurrent tasks per stage (default: available parallelism)
    /// - `PIPELINE_FAIL_FAST`: cancel stage siblings after a failure (default: false)
    /// - `PROGRESS_CHANNEL_CAPACITY`: progress buffer per task (default: 1024)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_settings(&Settings::from_env())
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(max) = settings.get_parsed(settings::PIPELINE_MAX_PARALLEL)? {
            config.max_parallel_tasks = max;
        }
        config.fail_fast = settings.get_bool(settings::PIPELINE_FAIL_FAST, config.fail_fast)?;
        if let Some(capacity) = settings.get_parsed(settings::PROGRESS_CHANNEL_CAPACITY)? {
            config.progress_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_tasks == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_parallel_tasks must be greater than 0".to_string(),
            ));
        }

        if self.progress_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "progress_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_progress_capacity(mut self, capacity: usize) -> Self {
        self.progress_capacity = capacity;
        self
    }
}
