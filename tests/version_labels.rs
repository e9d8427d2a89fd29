//! Concurrency tests for the version label store.
//!
//! Labels are shared by every search and mutation thread; these tests hammer
//! the CAS paths from many threads at once.

use proptest::prelude::*;
use spann::{PostingStatus, VersionLabelStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

// =============================================================================
// Count increments
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// T threads incrementing one label K times each end at (T * K) mod 256.
    #[test]
    fn concurrent_increments_are_not_lost(threads in 1usize..8, per_thread in 1usize..=200) {
        let store = VersionLabelStore::new(4, 16).expect("store");
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..per_thread {
                        store.increment_count(2).expect("label is live");
                    }
                });
            }
        });

        prop_assert_eq!(store.count(2) as usize, (threads * per_thread) % 256);
        prop_assert_eq!(store.count(1), 0);
        prop_assert_eq!(store.count(3), 0);
        prop_assert_eq!(store.status(2), Some(PostingStatus::Normal));
    }
}

#[test]
fn increments_stop_after_delete() {
    let store = VersionLabelStore::new(1, 4).expect("store");
    assert_eq!(store.increment_count(0), Some(1));
    assert!(store.mark_deleted(0));
    assert_eq!(store.increment_count(0), None);
    assert_eq!(store.count(0), 1);
}

// =============================================================================
// Status transitions
// =============================================================================

#[test]
fn delete_wins_over_concurrent_split_and_merge() {
    const IDS: usize = 512;
    let store = VersionLabelStore::new(IDS, IDS).expect("store");
    let barrier = Barrier::new(4);
    let delete_wins = AtomicUsize::new(0);

    thread::scope(|s| {
        s.spawn(|| {
            barrier.wait();
            for id in 0..IDS as u32 {
                if store.mark_deleted(id) {
                    delete_wins.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        s.spawn(|| {
            barrier.wait();
            for id in 0..IDS as u32 {
                store.mark_splitting(id);
            }
        });
        s.spawn(|| {
            barrier.wait();
            for id in (0..IDS as u32).rev() {
                store.mark_merging(id);
            }
        });
        s.spawn(|| {
            barrier.wait();
            for id in 0..IDS as u32 {
                store.increment_count(id);
            }
        });
    });

    // Every delete succeeds exactly once and nothing resurrects a deleted id.
    assert_eq!(delete_wins.load(Ordering::Relaxed), IDS);
    assert_eq!(store.deleted_count(), IDS);
    assert_eq!(store.live_count(), 0);
    for id in 0..IDS as u32 {
        assert!(store.is_deleted(id));
        assert!(!store.mark_splitting(id));
        assert!(!store.mark_merging(id));
        assert!(!store.mark_deleted(id));
    }
}

#[test]
fn concurrent_growth_hands_out_disjoint_ranges() {
    let store = VersionLabelStore::new(0, 10_000).expect("store");
    let begins: Vec<u32> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| store.add_batch(100).expect("capacity")))
            .collect();
        handles.into_iter().map(|h| h.join().expect("join")).collect()
    });

    let mut sorted = begins.clone();
    sorted.sort_unstable();
    for (i, begin) in sorted.iter().enumerate() {
        assert_eq!(*begin as usize, i * 100);
    }
    assert_eq!(store.total_count(), 800);
}

#[test]
fn growth_past_capacity_is_an_error() {
    let store = VersionLabelStore::new(10, 12).expect("store");
    let err = store.add_batch(3).expect_err("over capacity");
    assert!(matches!(err, spann::SpannError::CapacityExceeded { requested: 13, capacity: 12 }));
    assert_eq!(store.total_count(), 10);
}
