//! # Lockstep
//!
//! Barrier-scheduled real-time task pipeline.
//!
//! A fixed, ordered set of tasks (sensor read, estimation, control, actuator
//! output, ...) runs once per cycle, each on its own real-time thread, in
//! strict order enforced by rendezvous barriers. The cadence comes from an
//! absolute-deadline period driver; late releases and late completions are
//! reported as overruns, never corrected.
//!
//! ## Modules
//!
//! - [`barrier`]: cyclic generation barrier with misuse detection and poison release
//! - [`clock`]: monotonic clocks (`clock_nanosleep`, std, manual)
//! - [`period`]: period driver and cadence statistics
//! - [`platform`]: OS capability layer (pthread RT attributes / simulation)
//! - [`thread`]: real-time thread handle with cooperative stop
//! - [`task`]: `Work` trait, task specs and the per-task run loop
//! - [`scheduler`]: the barrier scheduler
//! - [`sequential`]: single-threaded scheduler for simulation and tests
//! - [`diagnostics`]: per-task counters and the failure queue
//! - [`topology`]: CPU lists and affinity sets
//!
//! ## Example
//!
//! ```no_run
//! use lockstep::prelude::*;
//!
//! let mut scheduler = BarrierScheduler::builder()
//!     .period(PeriodicParameters::new(1_000_000)?)
//!     .task(TaskSpec::from_fn("read", PriorityParameters::new(80), |_| Ok(())))
//!     .task(TaskSpec::from_fn("write", PriorityParameters::new(79), |_| Ok(())))
//!     .build()?;
//! scheduler.start()?;
//! scheduler.wait_for_cycles(1_000, std::time::Duration::from_secs(2));
//! scheduler.stop()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod barrier;
pub mod clock;
pub mod diagnostics;
pub mod error;
pub mod params;
pub mod period;
pub mod platform;
pub mod scheduler;
pub mod sequential;
pub mod task;
pub mod thread;
pub mod topology;

pub mod prelude {
    pub use crate::barrier::{Barrier, BarrierWaitResult, WaitStrategy};
    pub use crate::clock::{ManualClock, MonotonicClock, StdClock, SystemClock};
    pub use crate::diagnostics::{FailureKind, TaskSnapshot, WorkFailure};
    pub use crate::error::{
        BarrierError, BarrierMisuseError, ConfigurationError, SchedulerError, SchedulerResult,
    };
    pub use crate::params::{PeriodicParameters, PriorityParameters, SchedPolicy};
    pub use crate::period::PeriodSnapshot;
    pub use crate::platform::{DefaultPlatform, Platform, SimulatedPlatform};
    pub use crate::scheduler::{BarrierScheduler, SchedulerState, Topology};
    pub use crate::sequential::SequentialScheduler;
    pub use crate::task::{CycleContext, TaskSpec, Work, WorkResult};
    pub use crate::topology::CpuAffinity;
}
