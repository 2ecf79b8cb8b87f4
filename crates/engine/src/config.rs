//! Engine configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::PlaywrightConfig;
use crate::error::{EngineError, EngineResult};
use crate::parser::ParseOptions;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory scanned for routine documents
    pub routines_dir: PathBuf,

    /// Directory receiving run-results.json
    pub output_dir: PathBuf,

    /// Scenarios executed at the same time, each on its own session
    pub max_concurrency: usize,

    /// Step execution settings
    pub executor: ExecutorConfig,

    /// Browser backend settings
    pub playwright: PlaywrightConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            routines_dir: PathBuf::from("routines"),
            output_dir: PathBuf::from("test-results"),
            max_concurrency: 1,
            executor: ExecutorConfig::default(),
            playwright: PlaywrightConfig::default(),
        }
    }
}

/// Step execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Timeout for steps that do not declare one
    pub default_timeout_ms: u64,

    /// Pause between retry attempts
    pub retry_backoff_ms: u64,

    /// Extra time granted to driver-side waits before the outer timer fires
    pub wait_grace_ms: u64,

    /// Longest wait for a session to be released before the runner moves on
    pub release_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
            retry_backoff_ms: 200,
            wait_grace_ms: 250,
            release_timeout_ms: 5000,
        }
    }
}

impl ExecutorConfig {
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            default_timeout: Duration::from_millis(self.default_timeout_ms),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> EngineResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> EngineResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_concurrency == 0 {
            return Err(EngineError::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.executor.default_timeout_ms == 0 {
            return Err(EngineError::Config("default_timeout_ms must be positive".to_string()));
        }
        if self.executor.release_timeout_ms == 0 {
            return Err(EngineError::Config("release_timeout_ms must be positive".to_string()));
        }
        if self.playwright.viewport_width == 0 || self.playwright.viewport_height == 0 {
            return Err(EngineError::Config("viewport dimensions must be positive".to_string()));
        }
        Ok(())
    }
}
