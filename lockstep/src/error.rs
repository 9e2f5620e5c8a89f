//! Error taxonomy of the barrier scheduler.
//!
//! - [`ConfigurationError`]: fatal, raised by `build()`/`start()`.
//! - [`BarrierMisuseError`]: fatal programming error (topology bug).
//! - Work failures and deadline overruns are recoverable and live in
//!   [`crate::diagnostics`], not here.

use crate::params::SchedPolicy;
use crate::scheduler::SchedulerState;
use crate::thread::ThreadState;
use nix::errno::Errno;
use thiserror::Error;

/// Invalid pipeline description or an OS refusal to provide RT scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// The pipeline has no tasks.
    #[error("pipeline has no tasks")]
    NoTasks,

    /// More tasks than `MAX_TASKS`.
    #[error("{count} tasks configured, maximum is {max}")]
    TooManyTasks { count: usize, max: usize },

    /// No period was given, or it was zero.
    #[error("cycle period must be > 0 ns")]
    ZeroPeriod,

    /// The period does not fit in `u64` nanoseconds.
    #[error("cycle period of {secs} s exceeds the u64 nanosecond range")]
    PeriodTooLong { secs: u64 },

    /// A cycle limit of zero would never release a cycle.
    #[error("cycle limit must be > 0")]
    ZeroCycleLimit,

    /// Empty, oversized or duplicate task name.
    #[error("task name '{name}' is invalid: {reason}")]
    InvalidTaskName { name: String, reason: &'static str },

    /// Priority outside the platform range for the policy.
    #[error("priority {priority} for '{thread}' is outside the {policy} range {min}..={max}")]
    PriorityOutOfRange {
        thread: String,
        priority: i32,
        policy: SchedPolicy,
        min: i32,
        max: i32,
    },

    /// The platform could not report the priority range of a policy.
    #[error("cannot query the {policy} priority range: {errno}")]
    PriorityQuery { policy: SchedPolicy, errno: Errno },

    /// An affinity set with no CPUs.
    #[error("affinity for '{thread}' lists no CPUs")]
    EmptyAffinity { thread: String },

    /// Affinity names a CPU that is not online.
    #[error("CPU {cpu} requested by '{thread}' is not online")]
    CpuNotOnline { thread: String, cpu: usize },

    /// The CPU list could not be read or parsed.
    #[error("CPU topology unavailable: {0}")]
    Topology(String),

    /// The OS refused the real-time policy (missing CAP_SYS_NICE / rtprio limit).
    #[error(
        "permission denied applying {policy} priority {priority} to '{thread}' \
         (requires CAP_SYS_NICE or an rtprio rlimit)"
    )]
    PrivilegeDenied {
        thread: String,
        policy: SchedPolicy,
        priority: i32,
    },

    /// Any other thread creation failure.
    #[error("failed to create thread '{thread}': {errno}")]
    ThreadCreate { thread: String, errno: Errno },

    /// `mlockall` failed.
    #[error("mlockall(MCL_CURRENT | MCL_FUTURE) failed: {0}")]
    MemoryLock(Errno),
}

/// A barrier used outside its declared party structure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarrierMisuseError {
    /// A thread beyond the enrolled parties called `wait()`.
    #[error("barrier '{barrier}' already has {parties} enrolled parties; rejected an extra caller")]
    ExtraParty { barrier: String, parties: usize },

    /// Party count outside `1..=MAX_BARRIER_PARTIES`.
    #[error("barrier '{barrier}' party count must be within 1..={max}, got {parties}")]
    PartyCount {
        barrier: String,
        parties: usize,
        max: usize,
    },

    /// Initial arrivals would release the first generation without any thread.
    #[error("barrier '{barrier}' built with {initial} initial arrivals for {parties} parties")]
    InitialArrivals {
        barrier: String,
        initial: usize,
        parties: usize,
    },
}

/// Outcome of a barrier wait that did not release normally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarrierError {
    /// Fatal misuse; see [`BarrierMisuseError`].
    #[error(transparent)]
    Misuse(#[from] BarrierMisuseError),

    /// The barrier was poison-released for shutdown.
    #[error("barrier poisoned for shutdown")]
    Poisoned,
}

/// Error returned by the scheduler control surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    BarrierMisuse(#[from] BarrierMisuseError),

    /// Lifecycle transitions are one-directional.
    #[error("invalid scheduler transition {from} -> {to}")]
    InvalidTransition {
        from: SchedulerState,
        to: SchedulerState,
    },

    /// `start()` on a thread that is not in the `Created` state.
    #[error("thread '{name}' cannot be started from state {state}")]
    ThreadNotStartable { name: String, state: ThreadState },

    /// The OS reported an error joining a task thread.
    #[error("thread '{name}' could not be joined: {reason}")]
    ThreadJoin { name: String, reason: String },
}

/// Convenience alias.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misuse_converts_into_barrier_and_scheduler_errors() {
        let misuse = BarrierMisuseError::ExtraParty {
            barrier: "entry[1]".into(),
            parties: 2,
        };
        let wait: BarrierError = misuse.clone().into();
        assert_eq!(wait, BarrierError::Misuse(misuse.clone()));

        let sched: SchedulerError = misuse.into();
        assert!(sched.to_string().contains("entry[1]"));
    }

    #[test]
    fn privilege_error_names_thread_and_policy() {
        let err = ConfigurationError::PrivilegeDenied {
            thread: "control".into(),
            policy: SchedPolicy::Fifo,
            priority: 80,
        };
        let msg = err.to_string();
        assert!(msg.contains("control"));
        assert!(msg.contains("SCHED_FIFO"));
        assert!(msg.contains("80"));
    }

    #[test]
    fn transition_error_display() {
        let err = SchedulerError::InvalidTransition {
            from: SchedulerState::Terminated,
            to: SchedulerState::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid scheduler transition Terminated -> Running"
        );
    }
}
