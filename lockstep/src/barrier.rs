//! Cyclic rendezvous barrier.
//!
//! A generation counter guarded by a `parking_lot` mutex/condvar pair. A
//! waiter sleeps until the generation moves past the one it arrived in, so a
//! slow arriver can never be swept into the next cycle's rendezvous.
//!
//! Parties are enrolled by thread identity on first arrival; once all
//! `parties` slots are taken, any other thread calling [`Barrier::wait`] is
//! rejected with [`BarrierMisuseError::ExtraParty`].

use crate::error::{BarrierError, BarrierMisuseError};
use lockstep_common::consts::MAX_BARRIER_PARTIES;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

/// How a non-final arriver waits for release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// Park on the condvar immediately.
    #[default]
    Block,
    /// Poll the generation `spins` times before parking.
    SpinThenBlock { spins: u32 },
}

impl WaitStrategy {
    /// `0` spins means [`WaitStrategy::Block`].
    pub const fn from_spins(spins: u32) -> Self {
        if spins == 0 {
            Self::Block
        } else {
            Self::SpinThenBlock { spins }
        }
    }
}

/// Successful release of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult {
    /// `parties - 1` for the first arriver down to `0` for the last.
    pub arrival_index: usize,
    /// Generation reached by this release.
    pub generation: u64,
}

impl BarrierWaitResult {
    /// The last arriver, whose call tripped the release.
    pub const fn is_leader(&self) -> bool {
        self.arrival_index == 0
    }
}

struct BarrierState {
    generation: u64,
    arrived: usize,
    poisoned: bool,
    enrolled: heapless::Vec<ThreadId, MAX_BARRIER_PARTIES>,
}

pub struct Barrier {
    label: String,
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
    // Lock-free mirrors for observers and spinning waiters.
    generation: AtomicU64,
    waiting: AtomicUsize,
    poisoned: AtomicBool,
}

static_assertions::assert_impl_all!(Barrier: Send, Sync);

impl Barrier {
    /// A barrier for `parties` threads.
    ///
    /// Party identity is fixed at first arrival and kept for the barrier's
    /// whole life: the first `parties` distinct threads to call
    /// [`wait`](Self::wait) are its parties in every generation.
    pub fn new(parties: usize) -> Result<Self, BarrierMisuseError> {
        Self::labeled("barrier", parties, 0)
    }

    /// A barrier whose first generation already counts `initial` arrivals.
    pub fn with_initial_arrivals(parties: usize, initial: usize) -> Result<Self, BarrierMisuseError> {
        Self::labeled("barrier", parties, initial)
    }

    /// Fully specified constructor; `label` appears in misuse errors.
    pub fn labeled(
        label: impl Into<String>,
        parties: usize,
        initial: usize,
    ) -> Result<Self, BarrierMisuseError> {
        let label = label.into();
        if parties == 0 || parties > MAX_BARRIER_PARTIES {
            return Err(BarrierMisuseError::PartyCount {
                barrier: label,
                parties,
                max: MAX_BARRIER_PARTIES,
            });
        }
        if initial >= parties {
            return Err(BarrierMisuseError::InitialArrivals {
                barrier: label,
                initial,
                parties,
            });
        }
        Ok(Self {
            label,
            parties,
            state: Mutex::new(BarrierState {
                generation: 0,
                arrived: initial,
                poisoned: false,
                enrolled: heapless::Vec::new(),
            }),
            released: Condvar::new(),
            generation: AtomicU64::new(0),
            waiting: AtomicUsize::new(initial),
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Completed releases so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Arrivals counted in the current generation. Never blocks.
    pub fn number_waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// [`wait_with`](Self::wait_with) using [`WaitStrategy::Block`].
    ///
    /// Fails with [`BarrierMisuseError::ExtraParty`] for a thread that is not
    /// one of the enrolled parties, in any generation.
    pub fn wait(&self) -> Result<BarrierWaitResult, BarrierError> {
        self.wait_with(WaitStrategy::Block)
    }

    /// Arrive and block until the current generation is released.
    ///
    /// The calling thread is enrolled on its first arrival. Once all slots
    /// are taken, other threads are rejected, including fresh threads after
    /// the original parties have exited.
    pub fn wait_with(&self, strategy: WaitStrategy) -> Result<BarrierWaitResult, BarrierError> {
        let mut st = self.state.lock();
        if st.poisoned {
            return Err(BarrierError::Poisoned);
        }
        self.enroll(&mut st, thread::current().id())?;

        let arrived_before = st.arrived;
        st.arrived += 1;

        if st.arrived == self.parties {
            st.arrived = 0;
            st.generation += 1;
            self.waiting.store(0, Ordering::Release);
            self.generation.store(st.generation, Ordering::Release);
            self.released.notify_all();
            return Ok(BarrierWaitResult {
                arrival_index: 0,
                generation: st.generation,
            });
        }

        self.waiting.store(st.arrived, Ordering::Release);
        let arrived_in = st.generation;
        let arrival_index = self.parties - 1 - arrived_before;

        if let WaitStrategy::SpinThenBlock { spins } = strategy {
            MutexGuard::unlocked(&mut st, || {
                for _ in 0..spins {
                    if self.generation.load(Ordering::Acquire) != arrived_in
                        || self.poisoned.load(Ordering::Acquire)
                    {
                        break;
                    }
                    std::hint::spin_loop();
                }
            });
        }

        while st.generation == arrived_in && !st.poisoned {
            self.released.wait(&mut st);
        }

        // A release that happened before poisoning still counts.
        if st.generation != arrived_in {
            Ok(BarrierWaitResult {
                arrival_index,
                generation: arrived_in + 1,
            })
        } else {
            Err(BarrierError::Poisoned)
        }
    }

    /// Wake every waiter with [`BarrierError::Poisoned`] and fail all later waits.
    ///
    /// The generation is left unchanged.
    pub fn poison(&self) {
        let mut st = self.state.lock();
        st.poisoned = true;
        self.poisoned.store(true, Ordering::Release);
        self.released.notify_all();
    }

    fn enroll(&self, st: &mut BarrierState, me: ThreadId) -> Result<(), BarrierMisuseError> {
        if st.enrolled.contains(&me) {
            return Ok(());
        }
        if st.enrolled.len() >= self.parties || st.enrolled.push(me).is_err() {
            return Err(BarrierMisuseError::ExtraParty {
                barrier: self.label.clone(),
                parties: self.parties,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("label", &self.label)
            .field("parties", &self.parties)
            .field("generation", &self.generation())
            .field("waiting", &self.number_waiting())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn single_party_releases_immediately() {
        let b = Barrier::new(1).unwrap();
        for expected in 1..=3 {
            let r = b.wait().unwrap();
            assert!(r.is_leader());
            assert_eq!(r.generation, expected);
        }
        assert_eq!(b.generation(), 3);
        assert_eq!(b.number_waiting(), 0);
    }

    #[test]
    fn zero_parties_rejected() {
        assert!(matches!(
            Barrier::new(0),
            Err(BarrierMisuseError::PartyCount { parties: 0, .. })
        ));
        assert!(Barrier::new(MAX_BARRIER_PARTIES + 1).is_err());
    }

    #[test]
    fn initial_arrivals_must_leave_a_slot() {
        assert!(matches!(
            Barrier::with_initial_arrivals(2, 2),
            Err(BarrierMisuseError::InitialArrivals { initial: 2, parties: 2, .. })
        ));
    }

    #[test]
    fn initial_arrival_lets_first_generation_through() {
        let b = Barrier::with_initial_arrivals(2, 1).unwrap();
        assert_eq!(b.number_waiting(), 1);
        let r = b.wait().unwrap();
        assert_eq!(r.generation, 1);
        assert!(r.is_leader());
        assert_eq!(b.number_waiting(), 0);
    }

    #[test]
    fn two_parties_rendezvous() {
        let b = Arc::new(Barrier::labeled("pair", 2, 0).unwrap());
        let peer = {
            let b = b.clone();
            thread::spawn(move || b.wait().unwrap())
        };
        let mine = b.wait().unwrap();
        let theirs = peer.join().unwrap();
        assert_eq!(mine.generation, 1);
        assert_eq!(theirs.generation, 1);
        let mut indices = [mine.arrival_index, theirs.arrival_index];
        indices.sort_unstable();
        assert_eq!(indices, [0, 1]);
    }

    #[test]
    fn poison_wakes_blocked_waiter_without_advancing() {
        let b = Arc::new(Barrier::new(2).unwrap());
        let waiter = {
            let b = b.clone();
            thread::spawn(move || b.wait())
        };
        while b.number_waiting() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        b.poison();
        assert_eq!(waiter.join().unwrap(), Err(BarrierError::Poisoned));
        assert_eq!(b.generation(), 0);
        assert!(b.is_poisoned());
        assert_eq!(b.wait(), Err(BarrierError::Poisoned));
    }

    #[test]
    fn spin_then_block_releases() {
        let b = Arc::new(Barrier::new(2).unwrap());
        let peer = {
            let b = b.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    b.wait_with(WaitStrategy::SpinThenBlock { spins: 500 }).unwrap();
                }
            })
        };
        for _ in 0..100 {
            b.wait_with(WaitStrategy::from_spins(10)).unwrap();
        }
        peer.join().unwrap();
        assert_eq!(b.generation(), 100);
    }

    #[test]
    fn from_spins_zero_blocks() {
        assert_eq!(WaitStrategy::from_spins(0), WaitStrategy::Block);
        assert_eq!(
            WaitStrategy::from_spins(7),
            WaitStrategy::SpinThenBlock { spins: 7 }
        );
    }
}
