//! Barrier integration tests.
//!
//! Release/generation properties for arbitrary party counts, misuse
//! detection by thread identity and poison release under contention.

use lockstep::barrier::{Barrier, WaitStrategy};
use lockstep::error::{BarrierError, BarrierMisuseError};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ── Helpers ─────────────────────────────────────────────────────────

/// Run `parties` threads through `rounds` generations; returns every
/// `(generation, arrival_index)` observed.
fn run_rounds(parties: usize, rounds: u64, strategy: WaitStrategy) -> (Arc<Barrier>, Vec<(u64, usize)>) {
    let barrier = Arc::new(Barrier::new(parties).unwrap());
    let handles: Vec<_> = (0..parties)
        .map(|_| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                (1..=rounds)
                    .map(|round| {
                        let r = barrier.wait_with(strategy).unwrap();
                        assert_eq!(r.generation, round, "swept into the wrong generation");
                        (r.generation, r.arrival_index)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let observed = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    (barrier, observed)
}

// ── Properties ──────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_generation_releases_all_parties_once(
        parties in 1usize..=6,
        rounds in 1u64..=25,
        spins in prop_oneof![Just(0u32), 1u32..200],
    ) {
        let (barrier, observed) = run_rounds(parties, rounds, WaitStrategy::from_spins(spins));

        prop_assert_eq!(barrier.generation(), rounds);
        prop_assert_eq!(barrier.number_waiting(), 0);

        let mut per_generation: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (generation, index) in observed {
            per_generation.entry(generation).or_default().push(index);
        }
        prop_assert_eq!(per_generation.len() as u64, rounds);
        for (_, mut indices) in per_generation {
            indices.sort_unstable();
            prop_assert_eq!(indices, (0..parties).collect::<Vec<_>>());
        }
    }
}

// ── Misuse ──────────────────────────────────────────────────────────

#[test]
fn extra_thread_is_rejected_once_parties_are_enrolled() {
    let barrier = Arc::new(Barrier::labeled("pair", 2, 0).unwrap());
    let peer = {
        let b = barrier.clone();
        thread::spawn(move || b.wait().unwrap())
    };
    barrier.wait().unwrap();
    peer.join().unwrap();

    let intruder = {
        let b = barrier.clone();
        thread::spawn(move || b.wait())
    };
    assert_eq!(
        intruder.join().unwrap(),
        Err(BarrierError::Misuse(BarrierMisuseError::ExtraParty {
            barrier: "pair".into(),
            parties: 2,
        }))
    );
    // The rejected call did not count as an arrival.
    assert_eq!(barrier.number_waiting(), 0);
    assert_eq!(barrier.generation(), 1);
}

#[test]
fn party_identity_outlives_the_generation() {
    let barrier = Arc::new(Barrier::labeled("stage", 2, 0).unwrap());
    let round = |barrier: &Arc<Barrier>| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let b = barrier.clone();
                thread::spawn(move || b.wait())
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    };

    assert!(round(&barrier).iter().all(Result::is_ok));
    assert_eq!(barrier.generation(), 1);

    // The first two threads have exited, but they still own both slots.
    let expected = Err(BarrierError::Misuse(BarrierMisuseError::ExtraParty {
        barrier: "stage".into(),
        parties: 2,
    }));
    assert_eq!(round(&barrier), vec![expected.clone(), expected]);
    assert_eq!(barrier.generation(), 1);
    assert_eq!(barrier.number_waiting(), 0);
}

#[test]
fn single_party_barrier_rejects_second_thread() {
    let barrier = Arc::new(Barrier::new(1).unwrap());
    barrier.wait().unwrap();
    let other = {
        let b = barrier.clone();
        thread::spawn(move || b.wait())
    };
    assert!(matches!(
        other.join().unwrap(),
        Err(BarrierError::Misuse(BarrierMisuseError::ExtraParty { parties: 1, .. }))
    ));
}

// ── Shutdown ────────────────────────────────────────────────────────

#[test]
fn poison_releases_every_blocked_party() {
    let barrier = Arc::new(Barrier::new(4).unwrap());
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let b = barrier.clone();
            thread::spawn(move || b.wait_with(WaitStrategy::SpinThenBlock { spins: 1_000 }))
        })
        .collect();
    while barrier.number_waiting() < 3 {
        thread::sleep(Duration::from_millis(1));
    }

    barrier.poison();
    for w in waiters {
        assert_eq!(w.join().unwrap(), Err(BarrierError::Poisoned));
    }
    assert_eq!(barrier.generation(), 0);
}

#[test]
fn number_waiting_tracks_arrivals() {
    let barrier = Arc::new(Barrier::new(3).unwrap());
    assert_eq!(barrier.number_waiting(), 0);
    let first = {
        let b = barrier.clone();
        thread::spawn(move || b.wait().unwrap())
    };
    while barrier.number_waiting() < 1 {
        thread::sleep(Duration::from_millis(1));
    }
    let second = {
        let b = barrier.clone();
        thread::spawn(move || b.wait().unwrap())
    };
    while barrier.number_waiting() < 2 {
        thread::sleep(Duration::from_millis(1));
    }
    let leader = barrier.wait().unwrap();
    assert!(leader.is_leader());
    assert_eq!(first.join().unwrap().arrival_index, 2);
    assert_eq!(second.join().unwrap().arrival_index, 1);
    assert_eq!(barrier.number_waiting(), 0);
}
