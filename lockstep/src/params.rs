//! Scheduling parameters: priority/policy of a thread and the pipeline period.

use crate::error::ConfigurationError;
use std::fmt;
use std::num::NonZeroU64;
use std::time::Duration;

/// Real-time scheduling class applied to a task thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchedPolicy {
    /// `SCHED_FIFO`: run until blocked or preempted by a higher priority.
    #[default]
    Fifo,
    /// `SCHED_RR`: like FIFO, time-sliced among equal priorities.
    RoundRobin,
}

impl SchedPolicy {
    /// The `libc` policy constant.
    pub const fn as_raw(self) -> libc::c_int {
        match self {
            Self::Fifo => libc::SCHED_FIFO,
            Self::RoundRobin => libc::SCHED_RR,
        }
    }

    /// Inverse of [`as_raw`](Self::as_raw); `None` for non-RT policies.
    pub fn from_raw(raw: libc::c_int) -> Option<Self> {
        match raw {
            libc::SCHED_FIFO => Some(Self::Fifo),
            libc::SCHED_RR => Some(Self::RoundRobin),
            _ => None,
        }
    }
}

impl fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fifo => "SCHED_FIFO",
            Self::RoundRobin => "SCHED_RR",
        })
    }
}

/// Static priority of one real-time thread.
///
/// The value is checked against the platform range when the scheduler is
/// built, never clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriorityParameters {
    priority: i32,
    policy: SchedPolicy,
}

impl PriorityParameters {
    /// `SCHED_FIFO` at `priority`.
    pub const fn new(priority: i32) -> Self {
        Self {
            priority,
            policy: SchedPolicy::Fifo,
        }
    }

    /// Same priority under another policy.
    pub const fn with_policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub const fn priority(&self) -> i32 {
        self.priority
    }

    pub const fn policy(&self) -> SchedPolicy {
        self.policy
    }
}

/// Cadence of the pipeline's driving task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicParameters {
    period_ns: NonZeroU64,
    start_time_ns: Option<u64>,
}

impl PeriodicParameters {
    /// A period of `period_ns` nanoseconds anchored at `start()` time.
    pub fn new(period_ns: u64) -> Result<Self, ConfigurationError> {
        let period_ns = NonZeroU64::new(period_ns).ok_or(ConfigurationError::ZeroPeriod)?;
        Ok(Self {
            period_ns,
            start_time_ns: None,
        })
    }

    /// Convenience constructor; fails for zero and for periods beyond `u64` ns.
    pub fn from_duration(period: Duration) -> Result<Self, ConfigurationError> {
        let ns = u64::try_from(period.as_nanos()).map_err(|_| ConfigurationError::PeriodTooLong {
            secs: period.as_secs(),
        })?;
        Self::new(ns)
    }

    /// Anchor the schedule at an absolute monotonic timestamp.
    ///
    /// The first cycle is released at `start_time_ns + period`.
    pub const fn with_start_time(mut self, start_time_ns: u64) -> Self {
        self.start_time_ns = Some(start_time_ns);
        self
    }

    pub const fn period_ns(&self) -> u64 {
        self.period_ns.get()
    }

    pub const fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns.get())
    }

    pub const fn start_time_ns(&self) -> Option<u64> {
        self.start_time_ns
    }
}
