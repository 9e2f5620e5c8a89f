//! Pipeline file loading tests.
//!
//! Exercises `ConfigLoader::load` against real files: the shipped example
//! configuration, a multi-task pipelined description and the error paths.

use lockstep_common::config::{ConfigError, ConfigLoader, LogLevel};
use lockstep_common::pipeline::{PipelineConfig, TopologyKind};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Write `content` as pipeline.toml in `dir` and return its path.
fn write_pipeline(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("pipeline.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_shipped_example_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../lockstep/config/pipeline.toml");
    let cfg = PipelineConfig::load(&path).expect("example config loads");
    cfg.validate().expect("example config validates");
    assert_eq!(cfg.tasks.len(), 4);
    assert_eq!(cfg.tasks[0].name, "sensor_read");
    assert_eq!(cfg.tasks[3].name, "actuator_write");
}

#[test]
fn test_full_pipelined_description() {
    let dir = TempDir::new().unwrap();
    let path = write_pipeline(
        dir.path(),
        r#"
[shared]
service_name = "rig-7"
log_level = "warn"

[pipeline]
period_us = 500
topology = "pipelined"
driver_priority = 95
lock_memory = true
cycle_limit = 2000
spin_iterations = 200
report_interval_ms = 250

[[tasks]]
name = "read"
priority = 90
affinity = [2, 3]
load_us = 40

[[tasks]]
name = "estimate"
priority = 89

[[tasks]]
name = "write"
priority = 88
fail_every = 100
"#,
    );

    let cfg = PipelineConfig::load(&path).unwrap();
    cfg.validate().unwrap();

    assert_eq!(cfg.shared.log_level, LogLevel::Warn);
    assert_eq!(cfg.pipeline.topology, TopologyKind::Pipelined);
    assert_eq!(cfg.pipeline.driver_priority, Some(95));
    assert!(cfg.pipeline.lock_memory);
    assert_eq!(cfg.pipeline.cycle_limit, Some(2000));
    assert_eq!(cfg.pipeline.spin_iterations, 200);
    assert_eq!(cfg.period_ns(), 500_000);
    assert_eq!(cfg.tasks[0].affinity.as_deref(), Some(&[2, 3][..]));
    assert_eq!(cfg.tasks[2].fail_every, 100);
}

#[test]
fn test_missing_shared_table_is_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = write_pipeline(dir.path(), "[[tasks]]\nname = \"a\"\npriority = 1\n");
    assert!(matches!(
        PipelineConfig::load(&path),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn test_unknown_pipeline_key_is_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = write_pipeline(
        dir.path(),
        "[shared]\nservice_name = \"x\"\n\n[pipeline]\nperiod_ms = 1\n",
    );
    assert!(matches!(
        PipelineConfig::load(&path),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn test_cycle_limit_zero_is_validation_error() {
    let dir = TempDir::new().unwrap();
    let path = write_pipeline(
        dir.path(),
        "[shared]\nservice_name = \"x\"\n\n[pipeline]\ncycle_limit = 0\n\n[[tasks]]\nname = \"a\"\npriority = 1\n",
    );
    let cfg = PipelineConfig::load(&path).unwrap();
    assert!(matches!(
        cfg.validate(),
        Err(ConfigError::ValidationError(_))
    ));
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    assert_eq!(
        PipelineConfig::load(&dir.path().join("absent.toml")).map(|_| ()),
        Err(ConfigError::FileNotFound)
    );
}
