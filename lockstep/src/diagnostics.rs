//! Per-task counters, the work-failure queue and the fatal-error slot.
//!
//! Counters are atomics written by the owning task thread and read by any
//! observer. The failure queue is only touched on the failure path.

use crate::error::BarrierMisuseError;
use crate::period::{PeriodSnapshot, PeriodStats};
use lockstep_common::consts::{FAILURE_DESCRIPTION_CAPACITY, FAILURE_QUEUE_CAPACITY};
use parking_lot::Mutex;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Fixed-capacity failure text.
pub type FailureDescription = heapless::String<FAILURE_DESCRIPTION_CAPACITY>;

/// How a work call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// `execute` (or `initialize`) returned an error.
    Error,
    /// The work panicked; the panic was caught at the task boundary.
    Panic,
}

/// One recorded work failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkFailure {
    pub task_index: usize,
    pub task_name: Arc<str>,
    pub cycle: u64,
    pub kind: FailureKind,
    pub description: FailureDescription,
}

/// `fmt::Write` adapter that silently truncates at capacity, on a char boundary.
struct Truncating<'a, const N: usize>(&'a mut heapless::String<N>);

impl<const N: usize> fmt::Write for Truncating<'_, N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for ch in s.chars() {
            if self.0.push(ch).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Render `msg` into a failure description, truncating if needed.
pub(crate) fn describe(msg: &dyn fmt::Display) -> FailureDescription {
    let mut text = FailureDescription::new();
    let _ = write!(Truncating(&mut text), "{msg}");
    text
}

/// Per-task counters. Cache-line aligned so neighbouring tasks never share a line.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct TaskStats {
    executions: AtomicU64,
    overruns: AtomicU64,
    last_overrun_ns: AtomicU64,
    max_overrun_ns: AtomicU64,
    failures: AtomicU64,
    last_exec_ns: AtomicU64,
    max_exec_ns: AtomicU64,
    active: AtomicBool,
}

static_assertions::const_assert!(std::mem::align_of::<TaskStats>() == 64);

impl TaskStats {
    pub(crate) fn record_execution(&self, exec_ns: u64) {
        self.executions.fetch_add(1, Ordering::Release);
        self.last_exec_ns.store(exec_ns, Ordering::Relaxed);
        self.max_exec_ns.fetch_max(exec_ns, Ordering::Relaxed);
    }

    pub(crate) fn record_overrun(&self, overrun_ns: u64) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
        self.last_overrun_ns.store(overrun_ns, Ordering::Relaxed);
        self.max_overrun_ns.fetch_max(overrun_ns, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Acquire)
    }
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub index: usize,
    pub name: Arc<str>,
    pub executions: u64,
    pub overruns: u64,
    pub last_overrun_ns: u64,
    pub max_overrun_ns: u64,
    pub failures: u64,
    pub last_exec_ns: u64,
    pub max_exec_ns: u64,
    /// The task's run loop is live (set and cleared by its own thread).
    pub active: bool,
}

/// Bounded failure queue; the oldest record is dropped when full.
#[derive(Debug, Default)]
pub struct FailureLog {
    queue: Mutex<heapless::Deque<WorkFailure, FAILURE_QUEUE_CAPACITY>>,
    dropped: AtomicU64,
}

impl FailureLog {
    pub fn push(&self, failure: WorkFailure) {
        let mut queue = self.queue.lock();
        if queue.is_full() {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        let _ = queue.push_back(failure);
    }

    /// Take every queued record, oldest first.
    pub fn drain(&self) -> Vec<WorkFailure> {
        let mut queue = self.queue.lock();
        std::iter::from_fn(|| queue.pop_front()).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Everything an observer can poll about a running pipeline.
#[derive(Debug)]
pub struct Diagnostics {
    names: Vec<Arc<str>>,
    tasks: Vec<TaskStats>,
    period: Arc<PeriodStats>,
    failures: FailureLog,
    fatal: Mutex<Option<BarrierMisuseError>>,
}

impl Diagnostics {
    pub fn new(names: Vec<Arc<str>>) -> Self {
        let tasks = names.iter().map(|_| TaskStats::default()).collect();
        Self {
            names,
            tasks,
            period: Arc::new(PeriodStats::new()),
            failures: FailureLog::default(),
            fatal: Mutex::new(None),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_name(&self, index: usize) -> Option<&Arc<str>> {
        self.names.get(index)
    }

    pub(crate) fn task(&self, index: usize) -> &TaskStats {
        &self.tasks[index]
    }

    pub fn period_stats(&self) -> &Arc<PeriodStats> {
        &self.period
    }

    pub fn period_snapshot(&self) -> PeriodSnapshot {
        self.period.snapshot()
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    pub fn task_snapshot(&self, index: usize) -> Option<TaskSnapshot> {
        let s = self.tasks.get(index)?;
        Some(TaskSnapshot {
            index,
            name: self.names[index].clone(),
            executions: s.executions.load(Ordering::Acquire),
            overruns: s.overruns.load(Ordering::Relaxed),
            last_overrun_ns: s.last_overrun_ns.load(Ordering::Relaxed),
            max_overrun_ns: s.max_overrun_ns.load(Ordering::Relaxed),
            failures: s.failures.load(Ordering::Relaxed),
            last_exec_ns: s.last_exec_ns.load(Ordering::Relaxed),
            max_exec_ns: s.max_exec_ns.load(Ordering::Relaxed),
            active: s.active.load(Ordering::Acquire),
        })
    }

    pub fn task_snapshots(&self) -> Vec<TaskSnapshot> {
        (0..self.tasks.len())
            .filter_map(|i| self.task_snapshot(i))
            .collect()
    }

    /// Count and queue one failure of task `index`.
    pub(crate) fn record_failure(
        &self,
        index: usize,
        cycle: u64,
        kind: FailureKind,
        description: FailureDescription,
    ) {
        self.tasks[index].record_failure();
        self.failures.push(WorkFailure {
            task_index: index,
            task_name: self.names[index].clone(),
            cycle,
            kind,
            description,
        });
    }

    /// Keep the first fatal error; later ones are consequences of it.
    pub(crate) fn set_fatal(&self, error: BarrierMisuseError) {
        self.fatal.lock().get_or_insert(error);
    }

    pub fn fatal_error(&self) -> Option<BarrierMisuseError> {
        self.fatal.lock().clone()
    }
}
