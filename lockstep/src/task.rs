//! Task wrapper: one unit of work bound to its place in the pipeline.
//!
//! Per cycle a task (1) waits for the period if it drives the pipeline,
//! (2) waits on its entry barrier, (3) leaves without touching the exit
//! barrier if stop was requested, (4) runs its work with errors and panics
//! captured, (5) waits on its exit barrier. A failed cycle still reaches (5).

use crate::barrier::{Barrier, WaitStrategy};
use crate::clock::MonotonicClock;
use crate::diagnostics::{Diagnostics, FailureKind, describe};
use crate::error::{BarrierError, ConfigurationError};
use crate::params::PriorityParameters;
use crate::period::PeriodDriver;
use crate::thread::StopToken;
use crate::topology::CpuAffinity;
use lockstep_common::consts::{MAX_TASK_NAME_LEN, MAX_TASKS};
use std::any::Any;
use std::collections::HashSet;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Error returned by work.
pub type WorkError = Box<dyn Error + Send + Sync + 'static>;

/// Result of one work call.
pub type WorkResult = Result<(), WorkError>;

/// What a task knows about the cycle it is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleContext {
    /// 1-based cycle number.
    pub cycle: u64,
    pub order_index: usize,
    /// `anchor + cycle * period` [ns].
    pub intended_start_ns: u64,
    pub period_ns: u64,
}

impl CycleContext {
    /// Completion deadline of this cycle [ns].
    pub fn deadline_ns(&self) -> u64 {
        self.intended_start_ns.saturating_add(self.period_ns)
    }
}

/// A unit of work executed once per cycle on its task thread.
pub trait Work: Send {
    /// Called before the first `execute`, and again every cycle until it
    /// returns `true`. Cycles are skipped while it returns `false`.
    fn initialize(&mut self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &CycleContext) -> WorkResult;

    /// Called once on the task thread when the run loop ends.
    fn cleanup(&mut self) {}
}

/// Adapts a closure to [`Work`].
pub struct FnWork<F>(pub F);

impl<F> Work for FnWork<F>
where
    F: FnMut(&CycleContext) -> WorkResult + Send,
{
    fn execute(&mut self, ctx: &CycleContext) -> WorkResult {
        (self.0)(ctx)
    }
}

/// Declaration of one pipeline stage, in execution order.
pub struct TaskSpec {
    pub name: String,
    pub priority: PriorityParameters,
    pub affinity: Option<CpuAffinity>,
    pub work: Box<dyn Work>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, priority: PriorityParameters, work: impl Work + 'static) -> Self {
        Self {
            name: name.into(),
            priority,
            affinity: None,
            work: Box::new(work),
        }
    }

    /// A task whose work is a closure.
    pub fn from_fn<F>(name: impl Into<String>, priority: PriorityParameters, f: F) -> Self
    where
        F: FnMut(&CycleContext) -> WorkResult + Send + 'static,
    {
        Self::new(name, priority, FnWork(f))
    }

    pub fn with_affinity(mut self, affinity: CpuAffinity) -> Self {
        self.affinity = Some(affinity);
        self
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}

/// Count and name checks shared by both schedulers.
pub(crate) fn validate_tasks(tasks: &[TaskSpec]) -> Result<(), ConfigurationError> {
    if tasks.is_empty() {
        return Err(ConfigurationError::NoTasks);
    }
    if tasks.len() > MAX_TASKS {
        return Err(ConfigurationError::TooManyTasks {
            count: tasks.len(),
            max: MAX_TASKS,
        });
    }
    let mut seen = HashSet::with_capacity(tasks.len());
    for task in tasks {
        let reason = if task.name.trim().is_empty() {
            Some("empty")
        } else if task.name.len() > MAX_TASK_NAME_LEN {
            Some("too long")
        } else if task.name.contains('\0') {
            Some("contains NUL")
        } else if !seen.insert(task.name.as_str()) {
            Some("duplicate")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ConfigurationError::InvalidTaskName {
                name: task.name.clone(),
                reason,
            });
        }
    }
    Ok(())
}

/// Outcome of one guarded work call.
#[derive(Debug)]
pub(crate) enum Outcome {
    Completed,
    /// `initialize` has not succeeded yet; work was not run.
    Skipped,
    Failed(FailureKind, crate::diagnostics::FailureDescription),
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Run `initialize` (until it succeeds) and `execute`, converting errors and
/// panics into an [`Outcome`].
pub(crate) fn execute_guarded(work: &mut dyn Work, initialized: &mut bool, ctx: &CycleContext) -> Outcome {
    if !*initialized {
        match panic::catch_unwind(AssertUnwindSafe(|| work.initialize())) {
            Ok(true) => *initialized = true,
            Ok(false) => return Outcome::Skipped,
            Err(payload) => {
                return Outcome::Failed(
                    FailureKind::Panic,
                    describe(&format_args!("initialize panicked: {}", panic_message(&*payload))),
                );
            }
        }
    }
    match panic::catch_unwind(AssertUnwindSafe(|| work.execute(ctx))) {
        Ok(Ok(())) => Outcome::Completed,
        Ok(Err(e)) => Outcome::Failed(FailureKind::Error, describe(&e)),
        Err(payload) => Outcome::Failed(
            FailureKind::Panic,
            describe(&format_args!("panicked: {}", panic_message(&*payload))),
        ),
    }
}

pub(crate) fn cleanup_guarded(work: &mut dyn Work, index: usize) {
    if panic::catch_unwind(AssertUnwindSafe(|| work.cleanup())).is_err() {
        tracing::warn!(task = index, "work cleanup panicked");
    }
}

/// Cycle release logic held by the pipeline's driving party.
pub(crate) struct CycleDriver {
    period: PeriodDriver,
    limit: Option<u64>,
}

impl CycleDriver {
    pub(crate) fn new(period: PeriodDriver, limit: Option<u64>) -> Self {
        Self { period, limit }
    }

    /// Wait for the next period and check the gate. `false` once the cycle
    /// limit has been released.
    pub(crate) fn release(&mut self, gate: &Barrier) -> bool {
        if self.limit.is_some_and(|limit| self.period.cycle() >= limit) {
            return false;
        }
        self.period.wait_for_next_period();
        // The upstream party should already be parked at the gate.
        if gate.number_waiting() + 1 < gate.parties() {
            self.period.stats().record_late_gate();
        }
        true
    }
}

/// State shared by every party of one pipeline.
pub(crate) struct PipelineShared {
    pub(crate) diagnostics: Arc<Diagnostics>,
    pub(crate) barriers: Vec<Arc<Barrier>>,
    pub(crate) wait_strategy: WaitStrategy,
}

impl PipelineShared {
    /// Record a fatal misuse and release everyone so the pipeline winds down.
    pub(crate) fn abort(&self, error: crate::error::BarrierMisuseError) {
        tracing::error!("{error}; poisoning pipeline");
        self.diagnostics.set_fatal(error);
        for barrier in &self.barriers {
            barrier.poison();
        }
    }

    /// `true` if the caller passed the barrier.
    pub(crate) fn pass(&self, barrier: &Barrier) -> bool {
        match barrier.wait_with(self.wait_strategy) {
            Ok(_) => true,
            Err(BarrierError::Poisoned) => false,
            Err(BarrierError::Misuse(e)) => {
                self.abort(e);
                false
            }
        }
    }
}

/// Run loop of a dedicated driver thread (pipelined topology).
pub(crate) fn run_driver(mut driver: CycleDriver, gate: Arc<Barrier>, shared: Arc<PipelineShared>, stop: &StopToken) {
    while !stop.is_stop_requested() && driver.release(&gate) {
        if !shared.pass(&gate) {
            break;
        }
    }
}

/// Run loop of one task thread.
pub(crate) struct TaskRunner {
    index: usize,
    work: Box<dyn Work>,
    initialized: bool,
    entry: Arc<Barrier>,
    exit: Arc<Barrier>,
    driver: Option<CycleDriver>,
    shared: Arc<PipelineShared>,
    clock: Arc<dyn MonotonicClock>,
    period_ns: u64,
    anchor_ns: u64,
    cycle: u64,
}

impl TaskRunner {
    pub(crate) fn new(
        index: usize,
        work: Box<dyn Work>,
        entry: Arc<Barrier>,
        exit: Arc<Barrier>,
        shared: Arc<PipelineShared>,
        clock: Arc<dyn MonotonicClock>,
        period_ns: u64,
    ) -> Self {
        Self {
            index,
            work,
            initialized: false,
            entry,
            exit,
            driver: None,
            shared,
            clock,
            period_ns,
            anchor_ns: 0,
            cycle: 0,
        }
    }

    /// Fix the schedule anchor, and hand over the driver if this task drives.
    pub(crate) fn arm(&mut self, anchor_ns: u64, driver: Option<CycleDriver>) {
        self.anchor_ns = anchor_ns;
        self.driver = driver;
    }

    pub(crate) fn run(mut self, stop: &StopToken) {
        let diagnostics = self.shared.diagnostics.clone();
        let stats = diagnostics.task(self.index);
        stats.set_active(true);

        loop {
            if stop.is_stop_requested() {
                break;
            }
            if let Some(driver) = self.driver.as_mut() {
                if !driver.release(&self.entry) {
                    break;
                }
            }
            if !self.shared.pass(&self.entry) || stop.is_stop_requested() {
                break;
            }

            self.cycle += 1;
            self.run_cycle(&diagnostics);

            if !self.shared.pass(&self.exit) {
                break;
            }
        }

        if self.initialized {
            cleanup_guarded(self.work.as_mut(), self.index);
        }
        stats.set_active(false);
    }

    fn run_cycle(&mut self, diagnostics: &Diagnostics) {
        let ctx = CycleContext {
            cycle: self.cycle,
            order_index: self.index,
            intended_start_ns: self
                .anchor_ns
                .saturating_add(self.cycle.saturating_mul(self.period_ns)),
            period_ns: self.period_ns,
        };
        let stats = diagnostics.task(self.index);
        let started = self.clock.now_ns();

        match execute_guarded(self.work.as_mut(), &mut self.initialized, &ctx) {
            Outcome::Skipped => return,
            Outcome::Completed => {}
            Outcome::Failed(kind, description) => {
                diagnostics.record_failure(self.index, self.cycle, kind, description);
            }
        }

        let finished = self.clock.now_ns();
        stats.record_execution(finished.saturating_sub(started));
        let deadline = ctx.deadline_ns();
        if finished > deadline {
            stats.record_overrun(finished - deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::FailureKind;

    struct Flaky {
        init_attempts: u32,
        calls: u32,
    }

    impl Work for Flaky {
        fn initialize(&mut self) -> bool {
            self.init_attempts += 1;
            self.init_attempts >= 3
        }

        fn execute(&mut self, ctx: &CycleContext) -> WorkResult {
            self.calls += 1;
            match ctx.cycle {
                2 => Err("sensor timeout".into()),
                3 => panic!("index out of range"),
                _ => Ok(()),
            }
        }
    }

    fn ctx(cycle: u64) -> CycleContext {
        CycleContext {
            cycle,
            order_index: 0,
            intended_start_ns: cycle * 1_000,
            period_ns: 1_000,
        }
    }

    fn spec(name: &str) -> TaskSpec {
        TaskSpec::from_fn(name, PriorityParameters::new(10), |_| Ok(()))
    }

    #[test]
    fn initialize_retried_until_true() {
        let mut work = Flaky { init_attempts: 0, calls: 0 };
        let mut initialized = false;
        assert!(matches!(execute_guarded(&mut work, &mut initialized, &ctx(1)), Outcome::Skipped));
        assert!(matches!(execute_guarded(&mut work, &mut initialized, &ctx(1)), Outcome::Skipped));
        assert!(matches!(execute_guarded(&mut work, &mut initialized, &ctx(1)), Outcome::Completed));
        assert!(initialized);
        assert_eq!(work.init_attempts, 3);
        assert_eq!(work.calls, 1);
    }

    #[test]
    fn errors_and_panics_become_failures() {
        let mut work = Flaky { init_attempts: 5, calls: 0 };
        let mut initialized = true;
        match execute_guarded(&mut work, &mut initialized, &ctx(2)) {
            Outcome::Failed(FailureKind::Error, text) => assert_eq!(text.as_str(), "sensor timeout"),
            other => panic!("unexpected {other:?}"),
        }
        match execute_guarded(&mut work, &mut initialized, &ctx(3)) {
            Outcome::Failed(FailureKind::Panic, text) => {
                assert!(text.contains("index out of range"));
            }
            other => panic!("unexpected {other:?}"),
        }
        // The work stays usable after a panic.
        assert!(matches!(execute_guarded(&mut work, &mut initialized, &ctx(4)), Outcome::Completed));
    }

    #[test]
    fn misuse_poisons_every_pipeline_barrier() {
        use std::sync::Arc;

        let shared = Arc::new(PipelineShared {
            diagnostics: Arc::new(Diagnostics::new(vec![Arc::from("solo")])),
            barriers: vec![
                Arc::new(Barrier::labeled("entry[0]", 1, 0).unwrap()),
                Arc::new(Barrier::labeled("exit", 2, 0).unwrap()),
            ],
            wait_strategy: WaitStrategy::Block,
        });
        assert!(shared.pass(&shared.barriers[0]));

        let intruder = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.pass(&shared.barriers[0]))
        };
        assert!(!intruder.join().unwrap());
        assert!(shared.barriers.iter().all(|b| b.is_poisoned()));
        assert!(matches!(
            shared.diagnostics.fatal_error(),
            Some(crate::error::BarrierMisuseError::ExtraParty { parties: 1, .. })
        ));
        // Poisoned barriers turn every later wait away.
        assert!(!shared.pass(&shared.barriers[1]));
    }

    #[test]
    fn deadline_is_intended_start_plus_period() {
        assert_eq!(ctx(7).deadline_ns(), 8_000);
    }

    #[test]
    fn task_validation() {
        assert_eq!(validate_tasks(&[]), Err(ConfigurationError::NoTasks));
        assert!(validate_tasks(&[spec("a"), spec("b")]).is_ok());
        assert!(matches!(
            validate_tasks(&[spec("a"), spec("a")]),
            Err(ConfigurationError::InvalidTaskName { reason: "duplicate", .. })
        ));
        assert!(matches!(
            validate_tasks(&[spec(" ")]),
            Err(ConfigurationError::InvalidTaskName { reason: "empty", .. })
        ));
        let long = "x".repeat(MAX_TASK_NAME_LEN + 1);
        assert!(matches!(
            validate_tasks(&[spec(&long)]),
            Err(ConfigurationError::InvalidTaskName { reason: "too long", .. })
        ));
        let many: Vec<_> = (0..=MAX_TASKS).map(|i| spec(&format!("t{i}"))).collect();
        assert!(matches!(
            validate_tasks(&many),
            Err(ConfigurationError::TooManyTasks { .. })
        ));
    }
}
