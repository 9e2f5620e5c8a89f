//! System-wide constants for the lockstep workspace.
//!
//! Single source of truth for all numeric limits and default paths.
//! Imported by all crates; values are never duplicated elsewhere.

use static_assertions::const_assert;

/// Maximum number of tasks in one pipeline.
pub const MAX_TASKS: usize = 63;

/// Maximum number of parties on a single barrier.
///
/// A closed chain uses two-party barriers; a single barrier shared by the
/// whole pipeline plus an external driver needs `MAX_TASKS + 1`.
pub const MAX_BARRIER_PARTIES: usize = MAX_TASKS + 1;

/// Capacity of the recorded work-failure queue (oldest entries are dropped).
pub const FAILURE_QUEUE_CAPACITY: usize = 128;

/// Maximum length in bytes of a recorded failure description.
pub const FAILURE_DESCRIPTION_CAPACITY: usize = 160;

/// Maximum task name length in bytes.
pub const MAX_TASK_NAME_LEN: usize = 48;

/// Kernel limit for thread names, excluding the trailing NUL.
pub const THREAD_NAME_MAX: usize = 15;

/// Default stack size for task threads [bytes].
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Default cycle period in microseconds (1 kHz = 1000 µs).
pub const DEFAULT_PERIOD_US: u64 = 1000;

/// Default diagnostics report interval of the demo binary [ms].
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 1000;

/// Stack bytes touched after `mlockall` so the first cycles never page-fault.
pub const PREFAULT_STACK_BYTES: usize = 256 * 1024;

/// List of online CPUs (kernel CPU list format).
pub const SYSFS_CPU_ONLINE: &str = "/sys/devices/system/cpu/online";

/// List of CPUs isolated from the general scheduler (`isolcpus=`).
pub const SYSFS_CPU_ISOLATED: &str = "/sys/devices/system/cpu/isolated";

/// Default configuration file of the demo binary.
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

const_assert!(MAX_BARRIER_PARTIES > MAX_TASKS);
const_assert!(FAILURE_QUEUE_CAPACITY > 0);
const_assert!(FAILURE_DESCRIPTION_CAPACITY >= 32);
const_assert!(DEFAULT_STACK_SIZE >= 64 * 1024);
const_assert!(PREFAULT_STACK_BYTES < DEFAULT_STACK_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert!(MAX_TASKS > 0 && MAX_TASKS <= 256);
        assert!(DEFAULT_PERIOD_US > 0);
        assert!(DEFAULT_REPORT_INTERVAL_MS > 0);
    }

    #[test]
    fn thread_name_limit_matches_kernel() {
        // TASK_COMM_LEN is 16 including the terminating NUL.
        assert_eq!(THREAD_NAME_MAX + 1, 16);
    }
}
