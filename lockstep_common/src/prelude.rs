//! Prelude module for common re-exports.
//!
//! ```rust
//! use lockstep_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, SharedConfig};
pub use crate::pipeline::{PipelineConfig, TaskEntry, TopologyKind};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{DEFAULT_CONFIG_PATH, DEFAULT_PERIOD_US, MAX_TASKS};
