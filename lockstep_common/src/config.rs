//! Configuration loading traits and types.
//!
//! Every lockstep binary reads its settings from TOML. This module holds the
//! pieces that do not depend on what is being configured: the error type,
//! the log level, the `[shared]` table and the blanket [`ConfigLoader`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use lockstep_common::config::{ConfigError, ConfigLoader, SharedConfig};
//! use serde::Deserialize;
//! use std::path::Path;
//!
//! #[derive(Debug, Deserialize)]
//! struct ObserverConfig {
//!     shared: SharedConfig,
//!     poll_ms: u64,
//! }
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = ObserverConfig::load(Path::new("observer.toml"))?;
//!     config.shared.validate()?;
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// File could not be read or TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log verbosity, spelled in lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-cycle tracing (never enable on an RT target).
    Trace,
    /// Lifecycle details: thread creation, barrier wiring.
    Debug,
    /// Start/stop and periodic diagnostic reports.
    #[default]
    Info,
    /// Overruns and recorded work failures.
    Warn,
    /// Fatal configuration or barrier errors only.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// The `[shared]` table present in every lockstep configuration file.
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "lockstep-demo"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Instance identifier, used as the root span name.
    pub service_name: String,
}

impl SharedConfig {
    /// Rejects an empty `service_name`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads a TOML file into any deserializable type.
///
/// - Missing file → [`ConfigError::FileNotFound`]
/// - Unreadable file or invalid TOML → [`ConfigError::ParseError`]
///
/// Semantic checks are left to the type's own `validate()`.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Read and parse `path`.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(format!("{}: {e}", path.display()))
            }
        })?;

        Self::parse(&content)
    }

    /// Parse TOML text that is already in memory.
    fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
