//! Monotonic time sources.
//!
//! All timestamps are nanoseconds on one monotonic timeline. The period
//! driver sleeps to *absolute* deadlines so wake-up errors never accumulate.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// A monotonic clock with absolute-deadline sleep.
pub trait MonotonicClock: Send + Sync {
    /// Current time [ns].
    fn now_ns(&self) -> u64;

    /// Block until `now_ns() >= deadline_ns`. Returns immediately for past deadlines.
    fn sleep_until_ns(&self, deadline_ns: u64);
}

/// `CLOCK_MONOTONIC` with `clock_nanosleep(TIMER_ABSTIME)`.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixClock;

#[cfg(target_os = "linux")]
impl PosixClock {
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
impl MonotonicClock for PosixClock {
    fn now_ns(&self) -> u64 {
        use nix::time::{ClockId, clock_gettime};
        // CLOCK_MONOTONIC is always supported on Linux.
        clock_gettime(ClockId::CLOCK_MONOTONIC).map_or(0, |ts| {
            u64::try_from(Duration::from(ts).as_nanos()).unwrap_or(u64::MAX)
        })
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        use nix::errno::Errno;
        use nix::sys::time::TimeSpec;
        use nix::time::{ClockId, ClockNanosleepFlags, clock_nanosleep};

        let deadline = TimeSpec::from(Duration::from_nanos(deadline_ns));
        loop {
            match clock_nanosleep(
                ClockId::CLOCK_MONOTONIC,
                ClockNanosleepFlags::TIMER_ABSTIME,
                &deadline,
            ) {
                Err(Errno::EINTR) => continue,
                _ => return,
            }
        }
    }
}

/// Portable fallback built on [`Instant`] and `thread::sleep`.
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    epoch: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for StdClock {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        loop {
            let now = self.now_ns();
            if now >= deadline_ns {
                return;
            }
            std::thread::sleep(Duration::from_nanos(deadline_ns - now));
        }
    }
}

/// Clock used when none is configured.
#[cfg(target_os = "linux")]
pub type SystemClock = PosixClock;

/// Clock used when none is configured.
#[cfg(not(target_os = "linux"))]
pub type SystemClock = StdClock;

/// Manually driven clock for deterministic tests and simulation.
///
/// By default `sleep_until_ns` never blocks: it jumps time forward to the
/// deadline, so a pipeline driven by this clock runs as fast as its tasks
/// allow while the period arithmetic stays exact. Work can call
/// [`advance`](Self::advance) to simulate execution time.
///
/// A [`stepped`](Self::stepped) clock instead parks sleepers until another
/// thread moves time past their deadline, which makes the interleaving of
/// the driving task with the rest of a threaded pipeline reproducible. Every
/// pending sleep must be released this way before the pipeline is stopped.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    stepped: bool,
    sleepers: AtomicUsize,
    tick: Mutex<()>,
    ticked: Condvar,
}

impl ManualClock {
    pub const fn new(start_ns: u64) -> Self {
        Self::with_mode(start_ns, false)
    }

    /// A clock whose sleeps block until time is moved by another thread.
    pub const fn stepped(start_ns: u64) -> Self {
        Self::with_mode(start_ns, true)
    }

    const fn with_mode(start_ns: u64, stepped: bool) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
            stepped,
            sleepers: AtomicUsize::new(0),
            tick: Mutex::new(()),
            ticked: Condvar::new(),
        }
    }

    /// Move time forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let ns = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        self.now.fetch_add(ns, Ordering::AcqRel);
        self.wake_sleepers();
    }

    /// Move time forward to `ns`. Never moves backwards.
    pub fn set(&self, ns: u64) {
        self.now.fetch_max(ns, Ordering::AcqRel);
        self.wake_sleepers();
    }

    /// Threads currently parked in `sleep_until_ns` (stepped clocks only).
    pub fn sleepers(&self) -> usize {
        self.sleepers.load(Ordering::Acquire)
    }

    fn wake_sleepers(&self) {
        if self.stepped {
            let _tick = self.tick.lock();
            self.ticked.notify_all();
        }
    }
}

impl MonotonicClock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        if !self.stepped {
            self.now.fetch_max(deadline_ns, Ordering::AcqRel);
            return;
        }
        let mut tick = self.tick.lock();
        self.sleepers.fetch_add(1, Ordering::AcqRel);
        while self.now_ns() < deadline_ns {
            self.ticked.wait(&mut tick);
        }
        self.sleepers.fetch_sub(1, Ordering::AcqRel);
    }
}
