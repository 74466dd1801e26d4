//! Layered configuration
//!
//! Sources, lowest priority first:
//! 1. built-in defaults
//! 2. `stepwise.toml` in the working directory, or the file passed with `--config`
//! 3. environment variables such as `STEPWISE__EXECUTION__TIMEOUT_MS=500`
//!
//! A `.env` file is read into the environment before anything else.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::machine::vm::DEFAULT_MAX_CALL_DEPTH;

const DEFAULT_CONFIG_NAME: &str = "stepwise";
const ENV_PREFIX: &str = "STEPWISE";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub compiler: CompilerSettings,
    pub execution: ExecutionSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CompilerSettings {
    /// 0 disables the timeout
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutionSettings {
    /// 0 disables the timeout
    pub timeout_ms: u64,
    pub max_call_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Settings {
    /// Load with the default search path.
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::new()
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            compile_timeout: millis(self.compiler.timeout_ms),
            execution_timeout: millis(self.execution.timeout_ms),
            max_call_depth: self.execution.max_call_depth,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Builder for [`Settings`].
///
/// # Example
/// ```ignore
/// let settings = Settings::builder()
///     .config_path("ci/stepwise.toml")
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct SettingsBuilder {
    config_path: Option<PathBuf>,
    read_env: bool,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self {
            config_path: None,
            read_env: true,
        }
    }

    /// Use this file instead of searching for `stepwise.toml`. It must exist.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Ignore `.env` and `STEPWISE__*` variables.
    pub fn without_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    pub fn build(self) -> Result<Settings> {
        if self.read_env {
            // A missing .env file is fine.
            let _ = dotenvy::dotenv();
        }

        let mut builder = config::Config::builder()
            .set_default("compiler.timeout_ms", 10_000_u64)?
            .set_default("execution.timeout_ms", 0_u64)?
            .set_default("execution.max_call_depth", DEFAULT_MAX_CALL_DEPTH as u64)?
            .set_default("logging.filter", "info")?;

        builder = match &self.config_path {
            Some(path) => builder.add_source(config::File::from(path.as_path()).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_NAME).required(false)),
        };

        if self.read_env {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What a session needs from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub compile_timeout: Option<Duration>,
    pub execution_timeout: Option<Duration>,
    pub max_call_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            compile_timeout: Some(Duration::from_secs(10)),
            execution_timeout: None,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}
