//! Single-threaded scheduler.
//!
//! Runs the same [`Work`](crate::task::Work) units in pipeline order on the
//! caller's thread, one [`run_cycle`](SequentialScheduler::run_cycle) per
//! cycle. Failure capture and diagnostics match [`BarrierScheduler`], so task
//! logic can be exercised deterministically before going multi-threaded.
//!
//! [`BarrierScheduler`]: crate::scheduler::BarrierScheduler

use crate::clock::{MonotonicClock, SystemClock};
use crate::diagnostics::{Diagnostics, TaskSnapshot, WorkFailure};
use crate::error::ConfigurationError;
use crate::params::PeriodicParameters;
use crate::task::{CycleContext, Outcome, TaskSpec, Work, cleanup_guarded, execute_guarded, validate_tasks};
use std::sync::Arc;

struct Stage {
    work: Box<dyn Work>,
    initialized: bool,
}

pub struct SequentialScheduler {
    stages: Vec<Stage>,
    period: PeriodicParameters,
    clock: Arc<dyn MonotonicClock>,
    anchor_ns: u64,
    cycle: u64,
    diagnostics: Arc<Diagnostics>,
    shut_down: bool,
}

impl SequentialScheduler {
    /// Priorities and affinities of `tasks` are ignored.
    pub fn new(tasks: Vec<TaskSpec>, period: PeriodicParameters) -> Result<Self, ConfigurationError> {
        validate_tasks(&tasks)?;
        let names = tasks.iter().map(|t| Arc::from(t.name.as_str())).collect();
        let clock: Arc<dyn MonotonicClock> = Arc::new(SystemClock::default());
        let anchor_ns = period.start_time_ns().unwrap_or_else(|| clock.now_ns());
        Ok(Self {
            stages: tasks
                .into_iter()
                .map(|t| Stage {
                    work: t.work,
                    initialized: false,
                })
                .collect(),
            period,
            clock,
            anchor_ns,
            cycle: 0,
            diagnostics: Arc::new(Diagnostics::new(names)),
            shut_down: false,
        })
    }

    /// Replace the clock used for execution timing; re-anchors the schedule.
    pub fn with_clock(mut self, clock: Arc<dyn MonotonicClock>) -> Self {
        self.anchor_ns = self.period.start_time_ns().unwrap_or_else(|| clock.now_ns());
        self.clock = clock;
        self
    }

    /// Cycles run so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Run every stage once, in order. Returns the cycle number.
    pub fn run_cycle(&mut self) -> u64 {
        if self.shut_down {
            return self.cycle;
        }
        self.cycle += 1;
        let period_ns = self.period.period_ns();
        let intended_start_ns = self
            .anchor_ns
            .saturating_add(self.cycle.saturating_mul(period_ns));

        for (index, stage) in self.stages.iter_mut().enumerate() {
            let ctx = CycleContext {
                cycle: self.cycle,
                order_index: index,
                intended_start_ns,
                period_ns,
            };
            let started = self.clock.now_ns();
            match execute_guarded(stage.work.as_mut(), &mut stage.initialized, &ctx) {
                Outcome::Skipped => continue,
                Outcome::Completed => {}
                Outcome::Failed(kind, description) => {
                    self.diagnostics
                        .record_failure(index, self.cycle, kind, description);
                }
            }
            let elapsed = self.clock.now_ns().saturating_sub(started);
            self.diagnostics.task(index).record_execution(elapsed);
        }
        self.cycle
    }

    pub fn run_cycles(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.run_cycle();
        }
    }

    /// Run `cleanup` on every initialized stage. Later cycles are no-ops.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for (index, stage) in self.stages.iter_mut().enumerate() {
            if stage.initialized {
                cleanup_guarded(stage.work.as_mut(), index);
            }
        }
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        self.diagnostics.clone()
    }

    pub fn task_snapshots(&self) -> Vec<TaskSnapshot> {
        self.diagnostics.task_snapshots()
    }

    pub fn drain_failures(&self) -> Vec<WorkFailure> {
        self.diagnostics.failures().drain()
    }
}

impl Drop for SequentialScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
