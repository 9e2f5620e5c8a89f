//! Period driver: absolute-deadline cadence with overrun accounting.
//!
//! `next = last + period`, always. A late call records `now - next` as an
//! overrun and returns without sleeping; the schedule is never shifted and
//! missed cycles are never replayed.

use crate::clock::MonotonicClock;
use crate::params::PeriodicParameters;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of one [`PeriodDriver::wait_for_next_period`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodWake {
    /// 1-based cycle number released by this wake.
    pub cycle: u64,
    /// Scheduled release time [ns].
    pub intended_ns: u64,
    /// Clock reading after the wait [ns].
    pub actual_ns: u64,
    /// `Some(now - intended)` if the deadline had already passed on entry.
    pub overrun_ns: Option<u64>,
}

/// Lock-free cadence statistics, shared with observers.
#[derive(Debug, Default)]
pub struct PeriodStats {
    cycles: AtomicU64,
    overruns: AtomicU64,
    last_overrun_ns: AtomicU64,
    max_overrun_ns: AtomicU64,
    max_latency_ns: AtomicU64,
    sum_latency_ns: AtomicU64,
    late_gates: AtomicU64,
}

/// Point-in-time copy of [`PeriodStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeriodSnapshot {
    pub cycles: u64,
    pub overruns: u64,
    pub last_overrun_ns: u64,
    pub max_overrun_ns: u64,
    /// Worst wake-up latency after a successful sleep.
    pub max_latency_ns: u64,
    pub sum_latency_ns: u64,
    /// Releases at which the upstream party had not reached the gate yet.
    pub late_gates: u64,
}

impl PeriodSnapshot {
    /// Mean wake-up latency over the cycles that slept.
    pub fn avg_latency_ns(&self) -> u64 {
        let slept = self.cycles.saturating_sub(self.overruns);
        if slept == 0 {
            0
        } else {
            self.sum_latency_ns / slept
        }
    }
}

impl PeriodStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    fn record_overrun(&self, overrun_ns: u64) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
        self.last_overrun_ns.store(overrun_ns, Ordering::Relaxed);
        self.max_overrun_ns.fetch_max(overrun_ns, Ordering::Relaxed);
    }

    fn record_latency(&self, latency_ns: u64) {
        self.sum_latency_ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.max_latency_ns.fetch_max(latency_ns, Ordering::Relaxed);
    }

    pub(crate) fn record_late_gate(&self) {
        self.late_gates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PeriodSnapshot {
        PeriodSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            last_overrun_ns: self.last_overrun_ns.load(Ordering::Relaxed),
            max_overrun_ns: self.max_overrun_ns.load(Ordering::Relaxed),
            max_latency_ns: self.max_latency_ns.load(Ordering::Relaxed),
            sum_latency_ns: self.sum_latency_ns.load(Ordering::Relaxed),
            late_gates: self.late_gates.load(Ordering::Relaxed),
        }
    }
}

/// Releases one cycle per call on an absolute schedule.
pub struct PeriodDriver {
    clock: Arc<dyn MonotonicClock>,
    period_ns: u64,
    last_wake_ns: u64,
    cycle: u64,
    stats: Arc<PeriodStats>,
}

impl PeriodDriver {
    /// First release is at `anchor_ns + period`.
    pub fn new(clock: Arc<dyn MonotonicClock>, params: PeriodicParameters, anchor_ns: u64) -> Self {
        Self::with_stats(clock, params, anchor_ns, Arc::new(PeriodStats::new()))
    }

    pub fn with_stats(
        clock: Arc<dyn MonotonicClock>,
        params: PeriodicParameters,
        anchor_ns: u64,
        stats: Arc<PeriodStats>,
    ) -> Self {
        Self {
            clock,
            period_ns: params.period_ns(),
            last_wake_ns: anchor_ns,
            cycle: 0,
            stats,
        }
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    /// Cycles released so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Intended time of the most recent release (the anchor before the first).
    pub fn last_wake_ns(&self) -> u64 {
        self.last_wake_ns
    }

    pub fn stats(&self) -> &Arc<PeriodStats> {
        &self.stats
    }

    /// Sleep until the next release time, or record an overrun if it passed.
    pub fn wait_for_next_period(&mut self) -> PeriodWake {
        let next = self.last_wake_ns.saturating_add(self.period_ns);
        let now = self.clock.now_ns();

        let (actual_ns, overrun_ns) = if now > next {
            let overrun = now - next;
            self.stats.record_overrun(overrun);
            (now, Some(overrun))
        } else {
            self.clock.sleep_until_ns(next);
            let woke = self.clock.now_ns();
            self.stats.record_latency(woke.saturating_sub(next));
            (woke, None)
        };

        self.last_wake_ns = next;
        self.cycle += 1;
        self.stats.record_cycle();

        PeriodWake {
            cycle: self.cycle,
            intended_ns: next,
            actual_ns,
            overrun_ns,
        }
    }
}
