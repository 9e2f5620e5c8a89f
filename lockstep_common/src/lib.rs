//! Lockstep Common Library
//!
//! This crate provides shared constants, configuration loading utilities and
//! the on-disk pipeline description for all lockstep workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Workspace-wide limits and defaults
//! - [`config`] - Configuration loading traits and types
//! - [`pipeline`] - TOML description of a task pipeline
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use lockstep_common::config::{ConfigLoader, SharedConfig};
//! use lockstep_common::pipeline::PipelineConfig;
//! ```

pub mod config;
pub mod consts;
pub mod pipeline;
pub mod prelude;
