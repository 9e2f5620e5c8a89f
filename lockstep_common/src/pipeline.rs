//! TOML description of a task pipeline.
//!
//! ```toml
//! [shared]
//! service_name = "lockstep-demo"
//!
//! [pipeline]
//! period_us = 1000
//! topology = "closed_chain"
//!
//! [[tasks]]
//! name = "sensor_read"
//! priority = 80
//! affinity = [2]
//! ```
//!
//! The file only describes timing and placement. What each task does is
//! supplied in code when the scheduler is built.

use crate::config::{ConfigError, SharedConfig};
use crate::consts::{DEFAULT_PERIOD_US, DEFAULT_REPORT_INTERVAL_MS, MAX_TASK_NAME_LEN, MAX_TASKS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How the barriers of a pipeline are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    /// The first task drives the period and the last task's exit barrier is
    /// the first task's entry barrier (strict lockstep).
    #[default]
    ClosedChain,
    /// A separate driver thread releases the first task every period;
    /// consecutive cycles may overlap along the chain.
    Pipelined,
}

/// The `[pipeline]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSection {
    /// Cycle period [µs].
    #[serde(default = "default_period_us")]
    pub period_us: u64,

    /// Barrier wiring.
    #[serde(default)]
    pub topology: TopologyKind,

    /// Priority of the external driver thread (pipelined topology only).
    /// Defaults to the highest task priority.
    #[serde(default)]
    pub driver_priority: Option<i32>,

    /// Call `mlockall(MCL_CURRENT | MCL_FUTURE)` before starting threads.
    #[serde(default)]
    pub lock_memory: bool,

    /// Stop releasing cycles after this many (unbounded when absent).
    #[serde(default)]
    pub cycle_limit: Option<u64>,

    /// Spin iterations before a barrier waiter blocks (0 = block at once).
    #[serde(default)]
    pub spin_iterations: u32,

    /// Interval between diagnostic reports [ms].
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            period_us: DEFAULT_PERIOD_US,
            topology: TopologyKind::default(),
            driver_priority: None,
            lock_memory: false,
            cycle_limit: None,
            spin_iterations: 0,
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
        }
    }
}

fn default_period_us() -> u64 {
    DEFAULT_PERIOD_US
}

fn default_report_interval_ms() -> u64 {
    DEFAULT_REPORT_INTERVAL_MS
}

/// One `[[tasks]]` entry. Order in the file is execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEntry {
    /// Task name, unique within the pipeline.
    pub name: String,

    /// Real-time priority (SCHED_FIFO range on Linux).
    pub priority: i32,

    /// CPUs the task thread may run on.
    #[serde(default)]
    pub affinity: Option<Vec<usize>>,

    /// Synthetic busy time per cycle [µs] (demo workload).
    #[serde(default)]
    pub load_us: u64,

    /// Inject a work failure every N cycles (0 = never).
    #[serde(default)]
    pub fail_every: u64,
}

/// A complete pipeline description file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Common settings.
    pub shared: SharedConfig,

    /// Timing and wiring.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Tasks in execution order.
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

impl PipelineConfig {
    /// Semantic checks that TOML parsing cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        let p = &self.pipeline;
        if p.period_us == 0 {
            return Err(invalid("pipeline.period_us must be > 0"));
        }
        if p.report_interval_ms == 0 {
            return Err(invalid("pipeline.report_interval_ms must be > 0"));
        }
        if p.cycle_limit == Some(0) {
            return Err(invalid("pipeline.cycle_limit must be > 0 when set"));
        }
        if p.driver_priority.is_some() && p.topology != TopologyKind::Pipelined {
            return Err(invalid(
                "pipeline.driver_priority is only used by the pipelined topology",
            ));
        }

        if self.tasks.is_empty() {
            return Err(invalid("at least one [[tasks]] entry is required"));
        }
        if self.tasks.len() > MAX_TASKS {
            return Err(invalid(&format!(
                "{} tasks configured, maximum is {MAX_TASKS}",
                self.tasks.len()
            )));
        }

        let mut names = HashSet::with_capacity(self.tasks.len());
        for (idx, task) in self.tasks.iter().enumerate() {
            if task.name.is_empty() || task.name.len() > MAX_TASK_NAME_LEN {
                return Err(invalid(&format!(
                    "tasks[{idx}].name must be 1..={MAX_TASK_NAME_LEN} bytes"
                )));
            }
            if !names.insert(task.name.as_str()) {
                return Err(invalid(&format!("duplicate task name '{}'", task.name)));
            }
            if let Some(cpus) = &task.affinity {
                if cpus.is_empty() {
                    return Err(invalid(&format!(
                        "tasks[{idx}].affinity must list at least one CPU"
                    )));
                }
            }
            if task.load_us >= p.period_us {
                tracing::warn!(
                    task = %task.name,
                    load_us = task.load_us,
                    period_us = p.period_us,
                    "task load exceeds the cycle period; every cycle will overrun"
                );
            }
        }

        Ok(())
    }

    /// Period in nanoseconds.
    pub fn period_ns(&self) -> u64 {
        self.pipeline.period_us.saturating_mul(1_000)
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::ValidationError(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;

    const MINIMAL: &str = r#"
[shared]
service_name = "unit"

[[tasks]]
name = "sensor_read"
priority = 80
"#;

    #[test]
    fn minimal_file_uses_defaults() {
        let cfg = PipelineConfig::parse(MINIMAL).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.pipeline.period_us, DEFAULT_PERIOD_US);
        assert_eq!(cfg.pipeline.topology, TopologyKind::ClosedChain);
        assert_eq!(cfg.pipeline.cycle_limit, None);
        assert_eq!(cfg.period_ns(), DEFAULT_PERIOD_US * 1_000);
        assert_eq!(cfg.tasks[0].affinity, None);
    }

    #[test]
    fn topology_names_are_snake_case() {
        let text = MINIMAL.replace(
            "[[tasks]]",
            "[pipeline]\ntopology = \"pipelined\"\ndriver_priority = 90\n\n[[tasks]]",
        );
        let cfg = PipelineConfig::parse(&text).unwrap();
        assert_eq!(cfg.pipeline.topology, TopologyKind::Pipelined);
        assert_eq!(cfg.pipeline.driver_priority, Some(90));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn driver_priority_requires_pipelined_topology() {
        let text = MINIMAL.replace("[[tasks]]", "[pipeline]\ndriver_priority = 90\n\n[[tasks]]");
        let cfg = PipelineConfig::parse(&text).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn unknown_task_field_is_rejected() {
        let text = format!("{MINIMAL}deadline_us = 10\n");
        assert!(matches!(
            PipelineConfig::parse(&text),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let text = format!("{MINIMAL}\n[[tasks]]\nname = \"sensor_read\"\npriority = 70\n");
        let cfg = PipelineConfig::parse(&text).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn zero_period_and_empty_affinity_are_rejected() {
        let mut cfg = PipelineConfig::parse(MINIMAL).unwrap();
        cfg.pipeline.period_us = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::parse(MINIMAL).unwrap();
        cfg.tasks[0].affinity = Some(Vec::new());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_task_list_is_rejected() {
        let cfg = PipelineConfig::parse("[shared]\nservice_name = \"unit\"\n").unwrap();
        assert!(cfg.validate().is_err());
    }
}
