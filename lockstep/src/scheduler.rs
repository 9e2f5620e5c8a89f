//! Barrier scheduler: owns the pipeline, its barriers and its threads.
//!
//! # Wiring
//!
//! Task `i` waits on `barriers[i]` before its work. Its exit barrier is the
//! next task's entry barrier.
//!
//! - [`Topology::ClosedChain`]: the last task's exit barrier is the first
//!   task's entry barrier, pre-loaded with one arrival so cycle 1 can start.
//!   Task 0 holds the period driver. Cycle `k + 1` cannot begin before the
//!   last task finished cycle `k`.
//! - [`Topology::Pipelined`]: a separate driver thread releases task 0
//!   through a start barrier; the last task exits through a one-party
//!   terminal barrier. Stages of consecutive cycles may overlap.
//!
//! # Lifecycle
//!
//! `Built -> Running -> Stopping -> Terminated`, one-directional.

use crate::barrier::{Barrier, WaitStrategy};
use crate::clock::{MonotonicClock, SystemClock};
use crate::diagnostics::{Diagnostics, TaskSnapshot, WorkFailure};
use crate::error::{BarrierMisuseError, ConfigurationError, SchedulerError, SchedulerResult};
use crate::params::{PeriodicParameters, PriorityParameters};
use crate::period::{PeriodDriver, PeriodSnapshot};
use crate::platform::{DefaultPlatform, Platform};
use crate::task::{CycleDriver, PipelineShared, TaskRunner, TaskSpec, run_driver, validate_tasks};
use crate::thread::{RealtimeThread, ThreadState};
use crate::topology::CpuAffinity;
use lockstep_common::consts::DEFAULT_STACK_SIZE;
use lockstep_common::pipeline::TopologyKind;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Thread name of the pipelined driver.
const DRIVER_THREAD_NAME: &str = "driver";

/// Poll interval of [`BarrierScheduler::wait_for_cycles`].
const CYCLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Built,
    Running,
    Stopping,
    Terminated,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How barriers connect the tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    #[default]
    ClosedChain,
    Pipelined,
}

impl From<TopologyKind> for Topology {
    fn from(kind: TopologyKind) -> Self {
        match kind {
            TopologyKind::ClosedChain => Self::ClosedChain,
            TopologyKind::Pipelined => Self::Pipelined,
        }
    }
}

/// Barriers of a pipeline: task `i` enters through `barriers[i]`.
struct Wiring {
    barriers: Vec<Arc<Barrier>>,
}

impl Wiring {
    fn new(topology: Topology, tasks: usize) -> Result<Self, BarrierMisuseError> {
        let mut barriers = Vec::with_capacity(tasks + 1);
        match (topology, tasks) {
            (Topology::ClosedChain, 1) => {
                barriers.push(Barrier::labeled("entry[0]", 1, 0)?);
                barriers.push(Barrier::labeled("terminal", 1, 0)?);
            }
            (Topology::ClosedChain, n) => {
                barriers.push(Barrier::labeled("entry[0]", 2, 1)?);
                for i in 1..n {
                    barriers.push(Barrier::labeled(format!("entry[{i}]"), 2, 0)?);
                }
            }
            (Topology::Pipelined, n) => {
                barriers.push(Barrier::labeled("start", 2, 0)?);
                for i in 1..n {
                    barriers.push(Barrier::labeled(format!("entry[{i}]"), 2, 0)?);
                }
                barriers.push(Barrier::labeled("terminal", 1, 0)?);
            }
        }
        Ok(Self {
            barriers: barriers.into_iter().map(Arc::new).collect(),
        })
    }

    fn entry(&self, task: usize) -> Arc<Barrier> {
        self.barriers[task].clone()
    }

    /// Next barrier, wrapping to `entry[0]` in a closed chain of two or more.
    fn exit(&self, task: usize) -> Arc<Barrier> {
        self.barriers[(task + 1) % self.barriers.len()].clone()
    }
}

fn check_priority(
    platform: &dyn Platform,
    thread: &str,
    priority: PriorityParameters,
) -> Result<(), ConfigurationError> {
    let range = platform.priority_range(priority.policy())?;
    if range.contains(&priority.priority()) {
        Ok(())
    } else {
        Err(ConfigurationError::PriorityOutOfRange {
            thread: thread.to_owned(),
            priority: priority.priority(),
            policy: priority.policy(),
            min: *range.start(),
            max: *range.end(),
        })
    }
}

/// Builder for [`BarrierScheduler`].
pub struct BarrierSchedulerBuilder {
    tasks: Vec<TaskSpec>,
    period: Option<PeriodicParameters>,
    topology: Topology,
    driver_priority: Option<PriorityParameters>,
    platform: Option<Arc<dyn Platform>>,
    clock: Option<Arc<dyn MonotonicClock>>,
    cycle_limit: Option<u64>,
    lock_memory: bool,
    wait_strategy: WaitStrategy,
    stack_size: usize,
}

impl Default for BarrierSchedulerBuilder {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            period: None,
            topology: Topology::default(),
            driver_priority: None,
            platform: None,
            clock: None,
            cycle_limit: None,
            lock_memory: false,
            wait_strategy: WaitStrategy::Block,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl BarrierSchedulerBuilder {
    /// Append a task; tasks execute in the order they are added.
    pub fn task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn tasks(mut self, tasks: impl IntoIterator<Item = TaskSpec>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    pub fn period(mut self, period: PeriodicParameters) -> Self {
        self.period = Some(period);
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Priority of the pipelined driver thread. Defaults to the highest task
    /// priority. Ignored by a closed chain.
    pub fn driver_priority(mut self, priority: PriorityParameters) -> Self {
        self.driver_priority = Some(priority);
        self
    }

    pub fn platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn MonotonicClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Stop releasing cycles after `cycles`.
    pub fn cycle_limit(mut self, cycles: u64) -> Self {
        self.cycle_limit = Some(cycles);
        self
    }

    /// `mlockall` before any task thread is created.
    pub fn lock_memory(mut self, lock: bool) -> Self {
        self.lock_memory = lock;
        self
    }

    pub fn wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Validate the description and wire the barriers. No thread is created.
    pub fn build(self) -> SchedulerResult<BarrierScheduler> {
        validate_tasks(&self.tasks)?;
        let period = self.period.ok_or(ConfigurationError::ZeroPeriod)?;
        if self.cycle_limit == Some(0) {
            return Err(ConfigurationError::ZeroCycleLimit.into());
        }

        let platform = self
            .platform
            .unwrap_or_else(|| Arc::new(DefaultPlatform::default()) as Arc<dyn Platform>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::default()) as Arc<dyn MonotonicClock>);

        for task in &self.tasks {
            check_priority(&*platform, &task.name, task.priority)?;
        }

        let driver_priority = match self.topology {
            Topology::ClosedChain => {
                if self.driver_priority.is_some() {
                    warn!("driver priority ignored: closed chain is driven by its first task");
                }
                self.tasks[0].priority
            }
            Topology::Pipelined => {
                let priority = self.driver_priority.unwrap_or_else(|| {
                    self.tasks
                        .iter()
                        .map(|t| t.priority)
                        .max_by_key(|p| p.priority())
                        .unwrap_or(self.tasks[0].priority)
                });
                check_priority(&*platform, DRIVER_THREAD_NAME, priority)?;
                priority
            }
        };

        if self.tasks.iter().any(|t| t.affinity.is_some()) {
            let online = platform.online_cpus()?;
            for task in &self.tasks {
                let Some(affinity) = &task.affinity else { continue };
                if affinity.is_empty() {
                    return Err(ConfigurationError::EmptyAffinity {
                        thread: task.name.clone(),
                    }
                    .into());
                }
                if let Some(&cpu) = affinity.cpus().iter().find(|c| !online.contains(c)) {
                    return Err(ConfigurationError::CpuNotOnline {
                        thread: task.name.clone(),
                        cpu,
                    }
                    .into());
                }
            }
        }

        let wiring = Wiring::new(self.topology, self.tasks.len())?;
        let names: Vec<Arc<str>> = self.tasks.iter().map(|t| Arc::from(t.name.as_str())).collect();
        let shared = Arc::new(PipelineShared {
            diagnostics: Arc::new(Diagnostics::new(names.clone())),
            barriers: wiring.barriers.clone(),
            wait_strategy: self.wait_strategy,
        });

        let pending = self
            .tasks
            .into_iter()
            .zip(names)
            .enumerate()
            .map(|(i, (task, name))| PendingTask {
                name,
                priority: task.priority,
                affinity: task.affinity,
                runner: TaskRunner::new(
                    i,
                    task.work,
                    wiring.entry(i),
                    wiring.exit(i),
                    shared.clone(),
                    clock.clone(),
                    period.period_ns(),
                ),
            })
            .collect();

        Ok(BarrierScheduler {
            state: SchedulerState::Built,
            topology: self.topology,
            period,
            driver_priority,
            platform,
            clock,
            cycle_limit: self.cycle_limit,
            lock_memory: self.lock_memory,
            stack_size: self.stack_size,
            shared,
            pending,
            threads: Vec::new(),
            driver: None,
        })
    }
}

/// A task waiting for `start()` to give it a thread.
struct PendingTask {
    name: Arc<str>,
    priority: PriorityParameters,
    affinity: Option<CpuAffinity>,
    runner: TaskRunner,
}

/// Runs a fixed, ordered set of tasks in lockstep, one real-time thread each.
pub struct BarrierScheduler {
    state: SchedulerState,
    topology: Topology,
    period: PeriodicParameters,
    driver_priority: PriorityParameters,
    platform: Arc<dyn Platform>,
    clock: Arc<dyn MonotonicClock>,
    cycle_limit: Option<u64>,
    lock_memory: bool,
    stack_size: usize,
    shared: Arc<PipelineShared>,
    pending: Vec<PendingTask>,
    threads: Vec<RealtimeThread>,
    driver: Option<RealtimeThread>,
}

impl BarrierScheduler {
    pub fn builder() -> BarrierSchedulerBuilder {
        BarrierSchedulerBuilder::default()
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SchedulerState::Running
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn period(&self) -> PeriodicParameters {
        self.period
    }

    pub fn task_count(&self) -> usize {
        self.shared.diagnostics.task_count()
    }

    fn cycle_driver(&self, anchor_ns: u64) -> CycleDriver {
        let period = PeriodDriver::with_stats(
            self.clock.clone(),
            self.period,
            anchor_ns,
            self.shared.diagnostics.period_stats().clone(),
        );
        CycleDriver::new(period, self.cycle_limit)
    }

    /// Create the task threads (ascending order, pipelined driver last).
    ///
    /// On any failure, threads already started are stopped and joined, the
    /// scheduler is `Terminated` and the error is returned.
    pub fn start(&mut self) -> SchedulerResult<()> {
        if self.state != SchedulerState::Built {
            return Err(SchedulerError::InvalidTransition {
                from: self.state,
                to: SchedulerState::Running,
            });
        }

        if self.lock_memory {
            if let Err(e) = self.platform.lock_memory() {
                error!("memory lock failed: {e}");
                let _ = self.shutdown();
                return Err(e.into());
            }
        }

        let anchor_ns = self
            .period
            .start_time_ns()
            .unwrap_or_else(|| self.clock.now_ns());
        let driver = self.cycle_driver(anchor_ns);
        let (mut task0_driver, thread_driver) = match self.topology {
            Topology::ClosedChain => (Some(driver), None),
            Topology::Pipelined => (None, Some(driver)),
        };

        for (i, task) in mem::take(&mut self.pending).into_iter().enumerate() {
            let mut runner = task.runner;
            runner.arm(anchor_ns, if i == 0 { task0_driver.take() } else { None });
            let thread = RealtimeThread::new(&*task.name, task.priority, move |stop| runner.run(&stop))
                .with_affinity(task.affinity)
                .with_stack_size(self.stack_size);
            self.threads.push(thread);
        }

        if let Some(driver) = thread_driver {
            let gate = self.shared.barriers[0].clone();
            let shared = self.shared.clone();
            let thread = RealtimeThread::new(DRIVER_THREAD_NAME, self.driver_priority, move |stop| {
                run_driver(driver, gate, shared, &stop)
            })
            .with_stack_size(self.stack_size);
            self.driver = Some(thread);
        }

        let platform = self.platform.clone();
        let spawned = self
            .threads
            .iter_mut()
            .chain(self.driver.as_mut())
            .try_for_each(|thread| thread.start(&*platform));

        if let Err(e) = spawned {
            error!("pipeline start failed, rolling back: {e}");
            let _ = self.shutdown();
            return Err(e);
        }

        self.state = SchedulerState::Running;
        info!(
            tasks = self.threads.len(),
            topology = ?self.topology,
            period_ns = self.period.period_ns(),
            platform = self.platform.name(),
            "pipeline started"
        );
        Ok(())
    }

    /// Stop flags, poison release, join (descending, driver last).
    fn shutdown(&mut self) -> SchedulerResult<()> {
        self.state = SchedulerState::Stopping;
        for thread in self.threads.iter_mut().chain(self.driver.as_mut()) {
            thread.request_stop();
        }
        for barrier in &self.shared.barriers {
            barrier.poison();
        }

        let mut first_error = None;
        for thread in self.threads.iter_mut().rev().chain(self.driver.as_mut()) {
            if let Err(e) = thread.join() {
                warn!("{e}");
                first_error.get_or_insert(e);
            }
        }
        self.pending.clear();
        self.state = SchedulerState::Terminated;
        first_error.map_or(Ok(()), Err)
    }

    /// Stop the pipeline and join every thread.
    ///
    /// Returns the fatal barrier misuse recorded while running, if any. A
    /// built but never started scheduler terminates directly; a terminated
    /// one is left as is.
    pub fn stop(&mut self) -> SchedulerResult<()> {
        match self.state {
            SchedulerState::Terminated => return Ok(()),
            SchedulerState::Built => {
                self.pending.clear();
                self.state = SchedulerState::Terminated;
                info!("pipeline discarded before start");
                return Ok(());
            }
            SchedulerState::Running | SchedulerState::Stopping => {}
        }

        info!("stopping pipeline");
        let joined = self.shutdown();
        info!(cycles = self.completed_cycles(), "pipeline stopped");

        if let Some(fatal) = self.fatal_error() {
            return Err(fatal.into());
        }
        joined
    }

    /// Poll until the last task completed `cycles` cycles. `false` on timeout.
    pub fn wait_for_cycles(&self, cycles: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.completed_cycles() >= cycles {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(CYCLE_POLL_INTERVAL);
        }
    }

    // ─── Diagnostics ────────────────────────────────────────────────

    /// Shared handle for an observer thread.
    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        self.shared.diagnostics.clone()
    }

    pub fn task_diagnostics(&self, index: usize) -> Option<TaskSnapshot> {
        self.shared.diagnostics.task_snapshot(index)
    }

    pub fn task_snapshots(&self) -> Vec<TaskSnapshot> {
        self.shared.diagnostics.task_snapshots()
    }

    pub fn period_stats(&self) -> PeriodSnapshot {
        self.shared.diagnostics.period_snapshot()
    }

    /// Take every queued work failure, oldest first.
    pub fn drain_failures(&self) -> Vec<WorkFailure> {
        self.shared.diagnostics.failures().drain()
    }

    pub fn dropped_failures(&self) -> u64 {
        self.shared.diagnostics.failures().dropped()
    }

    /// Cycles completed by the last task.
    pub fn completed_cycles(&self) -> u64 {
        let last = self.shared.diagnostics.task_count().saturating_sub(1);
        self.shared
            .diagnostics
            .task_snapshot(last)
            .map_or(0, |s| s.executions)
    }

    /// Release count of every barrier, in wiring order.
    pub fn barrier_generations(&self) -> Vec<u64> {
        self.shared.barriers.iter().map(|b| b.generation()).collect()
    }

    /// Arrivals parked at each barrier, in wiring order.
    pub fn barrier_waiting(&self) -> Vec<usize> {
        self.shared.barriers.iter().map(|b| b.number_waiting()).collect()
    }

    pub fn fatal_error(&self) -> Option<BarrierMisuseError> {
        self.shared.diagnostics.fatal_error()
    }

    /// Lifecycle state of each task thread, in task order.
    pub fn thread_states(&self) -> Vec<ThreadState> {
        if self.threads.is_empty() {
            return vec![ThreadState::Created; self.pending.len()];
        }
        self.threads.iter().map(RealtimeThread::state).collect()
    }
}

impl fmt::Debug for BarrierScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierScheduler")
            .field("state", &self.state)
            .field("topology", &self.topology)
            .field("period", &self.period)
            .field("tasks", &self.task_count())
            .finish_non_exhaustive()
    }
}

impl Drop for BarrierScheduler {
    fn drop(&mut self) {
        if self.state == SchedulerState::Running {
            if let Err(e) = self.stop() {
                error!("pipeline stop on drop failed: {e}");
            }
        }
    }
}
