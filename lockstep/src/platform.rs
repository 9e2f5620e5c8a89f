//! Host OS capabilities used by the scheduler.
//!
//! [`Platform`] is the only place that touches thread creation, real-time
//! policy and memory locking. With the `rt` feature [`DefaultPlatform`] is
//! [`PosixPlatform`], which sets policy, priority and affinity in the pthread
//! creation attributes. Without it, [`SimulatedPlatform`] runs the same
//! bodies on plain `std::thread`s, validating priorities without applying them.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::PosixPlatform;

use crate::error::ConfigurationError;
use crate::params::{PriorityParameters, SchedPolicy};
use crate::topology::CpuAffinity;
use lockstep_common::consts::THREAD_NAME_MAX;
use nix::errno::Errno;
use std::fmt;
use std::ops::RangeInclusive;

/// Body executed on a spawned thread.
pub type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

/// Everything the platform needs to create one thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadSpec<'a> {
    pub name: &'a str,
    pub priority: PriorityParameters,
    pub affinity: Option<&'a CpuAffinity>,
    pub stack_size: usize,
}

/// Failure reported while joining a host thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// The body unwound past the thread boundary.
    Panicked,
    /// `pthread_join` failed.
    Os(Errno),
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panicked => f.write_str("thread body panicked"),
            Self::Os(errno) => write!(f, "pthread_join failed: {errno}"),
        }
    }
}

impl std::error::Error for JoinError {}

/// A running OS thread.
pub trait HostThread: Send {
    /// Wait for the thread body to return.
    fn join(self: Box<Self>) -> Result<(), JoinError>;
}

/// OS capability layer.
pub trait Platform: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Valid priorities for `policy`.
    fn priority_range(&self, policy: SchedPolicy)
    -> Result<RangeInclusive<i32>, ConfigurationError>;

    /// CPUs that affinity sets may name.
    fn online_cpus(&self) -> Result<Vec<usize>, ConfigurationError>;

    /// Lock current and future pages into RAM.
    fn lock_memory(&self) -> Result<(), ConfigurationError>;

    /// Create a thread already running under `spec`'s policy, priority and affinity.
    fn spawn(
        &self,
        spec: &ThreadSpec<'_>,
        body: ThreadBody,
    ) -> Result<Box<dyn HostThread>, ConfigurationError>;
}

/// Platform selected at compile time.
#[cfg(all(feature = "rt", target_os = "linux"))]
pub type DefaultPlatform = PosixPlatform;

/// Platform selected at compile time.
#[cfg(not(all(feature = "rt", target_os = "linux")))]
pub type DefaultPlatform = SimulatedPlatform;

/// Truncate `name` to the kernel's thread name limit on a char boundary.
pub(crate) fn kernel_thread_name(name: &str) -> &str {
    if name.len() <= THREAD_NAME_MAX {
        return name;
    }
    let mut end = THREAD_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// `std::thread` backend. Priorities and affinity are validated by the
/// scheduler but not applied, so pipelines run unprivileged.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedPlatform;

impl SimulatedPlatform {
    pub const fn new() -> Self {
        Self
    }
}

/// Range reported by Linux for both `SCHED_FIFO` and `SCHED_RR`.
const SIMULATED_PRIORITY_RANGE: RangeInclusive<i32> = 1..=99;

struct StdHostThread(std::thread::JoinHandle<()>);

impl HostThread for StdHostThread {
    fn join(self: Box<Self>) -> Result<(), JoinError> {
        self.0.join().map_err(|_| JoinError::Panicked)
    }
}

impl Platform for SimulatedPlatform {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn priority_range(
        &self,
        _policy: SchedPolicy,
    ) -> Result<RangeInclusive<i32>, ConfigurationError> {
        Ok(SIMULATED_PRIORITY_RANGE)
    }

    fn online_cpus(&self) -> Result<Vec<usize>, ConfigurationError> {
        let n = std::thread::available_parallelism().map_or(1, |n| n.get());
        Ok((0..n).collect())
    }

    fn lock_memory(&self) -> Result<(), ConfigurationError> {
        tracing::debug!("simulated platform: mlockall skipped");
        Ok(())
    }

    fn spawn(
        &self,
        spec: &ThreadSpec<'_>,
        body: ThreadBody,
    ) -> Result<Box<dyn HostThread>, ConfigurationError> {
        let handle = std::thread::Builder::new()
            .name(kernel_thread_name(spec.name).to_owned())
            .stack_size(spec.stack_size)
            .spawn(body)
            .map_err(|e| ConfigurationError::ThreadCreate {
                thread: spec.name.to_owned(),
                errno: e.raw_os_error().map_or(Errno::UnknownErrno, Errno::from_raw),
            })?;
        Ok(Box::new(StdHostThread(handle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn thread_names_are_truncated_to_kernel_limit() {
        assert_eq!(kernel_thread_name("short"), "short");
        assert_eq!(kernel_thread_name("exactly_15_byte"), "exactly_15_byte");
        assert_eq!(kernel_thread_name("state_estimate_stage"), "state_estimate_");
        // 'é' is two bytes and straddles the limit.
        assert_eq!(kernel_thread_name("abcdefghijklmné"), "abcdefghijklmn");
    }

    #[test]
    fn simulated_platform_runs_body_and_joins() {
        let platform = SimulatedPlatform::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let spec = ThreadSpec {
            name: "sim_worker",
            priority: PriorityParameters::new(50),
            affinity: None,
            stack_size: 256 * 1024,
        };
        let handle = platform
            .spawn(&spec, Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        handle.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn simulated_platform_reports_linux_range() {
        let platform = SimulatedPlatform::new();
        for policy in [SchedPolicy::Fifo, SchedPolicy::RoundRobin] {
            assert_eq!(platform.priority_range(policy).unwrap(), 1..=99);
        }
        assert!(!platform.online_cpus().unwrap().is_empty());
        assert!(platform.lock_memory().is_ok());
    }

    #[test]
    fn panicking_body_surfaces_on_join() {
        let spec = ThreadSpec {
            name: "boom",
            priority: PriorityParameters::new(1),
            affinity: None,
            stack_size: 256 * 1024,
        };
        let handle = SimulatedPlatform
            .spawn(&spec, Box::new(|| panic!("body failure")))
            .unwrap();
        assert_eq!(handle.join(), Err(JoinError::Panicked));
    }
}
