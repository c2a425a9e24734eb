//! Integration tests for the hazard-pointer list.

use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicUsize};

use crossbeam_utils::thread;
use quiesce::List;
use rand::Rng;

#[test]
fn scenario_insert_erase_find_reinsert() {
    let mut list = List::new();
    for k in [5, 3, 8, 1] {
        assert!(list.insert(k, k * 10));
    }
    let keys: Vec<i32> = list.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![1, 3, 5, 8]);

    assert!(list.erase(&3));
    let keys: Vec<i32> = list.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![1, 5, 8]);
    assert_eq!(list.len(), 3);
    assert!(!list.find(&3, |_, _| ()));
    assert!(list.find(&8, |_, v| assert_eq!(*v, 80)));

    assert!(list.insert(3, 30));
    let keys: Vec<i32> = list.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![1, 3, 5, 8]);
}

#[test]
fn duplicate_insert_fails_without_mutation() {
    let list = List::new();
    assert!(list.insert(1, "first"));
    assert!(!list.insert(1, "second"));
    assert_eq!(list.len(), 1);
    assert!(list.find(&1, |_, v| assert_eq!(*v, "first")));
}

#[test]
fn erase_after_insert_round_trip() {
    let list = List::new();
    assert!(list.insert(42, ()));
    assert_eq!(list.len(), 1);
    assert!(list.erase(&42));
    assert!(!list.find(&42, |_, _| ()));
    assert!(!list.erase(&42));
    assert_eq!(list.len(), 0);
    assert!(list.is_empty());
}

#[test]
fn insert_and_runs_init_only_on_success() {
    let list = List::new();
    let ran = AtomicUsize::new(0);

    assert!(list.insert_and(9, 90, |_, v| {
        assert_eq!(*v, 90);
        ran.fetch_add(1, SeqCst);
    }));
    assert_eq!(ran.load(SeqCst), 1);

    assert!(!list.insert_and(9, 91, |_, _| {
        ran.fetch_add(1, SeqCst);
    }));
    assert_eq!(ran.load(SeqCst), 1);
}

#[test]
fn ensure_inserts_then_visits_existing() {
    let list = List::new();
    assert!(list.ensure(7, 70, |inserted, _, v| {
        assert!(inserted);
        assert_eq!(*v, 70);
    }));
    assert!(!list.ensure(7, 99, |inserted, _, v| {
        assert!(!inserted);
        assert_eq!(*v, 70);
    }));
    assert_eq!(list.len(), 1);
}

#[test]
fn erase_with_visits_removed_entry() {
    let list = List::new();
    list.insert(3, "gone");
    let visited = AtomicUsize::new(0);
    assert!(list.erase_with(&3, |_, v| {
        assert_eq!(*v, "gone");
        visited.fetch_add(1, SeqCst);
    }));
    assert_eq!(visited.load(SeqCst), 1);
}

#[test]
fn clear_empties_the_list() {
    let list = List::new();
    for k in 0..100 {
        list.insert(k, k);
    }
    list.clear();
    assert!(list.is_empty());
    assert_eq!(list.len(), 0);
    assert!(list.insert(5, 5));
}

#[test]
fn concurrent_distinct_inserts_all_land() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 400;

    let list = List::new();
    thread::scope(|scope| {
        for t in 0..THREADS {
            let list = &list;
            scope.spawn(move |_| {
                for i in 0..PER_THREAD {
                    assert!(list.insert(t * PER_THREAD + i, t));
                }
            });
        }
    })
    .unwrap();

    // All threads joined: the counter and the physical chain agree now.
    assert_eq!(list.len(), THREADS * PER_THREAD);
    for k in 0..THREADS * PER_THREAD {
        assert!(list.contains(&k));
    }
}

#[test]
fn racing_inserts_have_one_winner_per_key() {
    const THREADS: usize = 8;
    let list = List::new();

    for round in 0..64usize {
        let winners = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|_| {
                    if list.insert(round, ()) {
                        winners.fetch_add(1, SeqCst);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(winners.load(SeqCst), 1);
    }
    assert_eq!(list.len(), 64);
}

#[test]
fn racing_erases_have_one_winner_per_key() {
    const THREADS: usize = 4;
    let list = List::new();

    for round in 0..64usize {
        assert!(list.insert(round, round));
        let removed = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|_| {
                    if list.erase(&round) {
                        removed.fetch_add(1, SeqCst);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(removed.load(SeqCst), 1);
        assert!(!list.contains(&round));
    }
    assert_eq!(list.len(), 0);
}

const LIVE: u64 = 0x600D_F00D;

struct Canary(u64);

impl Drop for Canary {
    fn drop(&mut self) {
        // Poison on disposal so a use-after-free read is loud.
        self.0 = 0xDEAD_0000;
    }
}

#[test]
fn readers_never_observe_disposed_values() {
    let list = List::new();
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..4 {
            let list = &list;
            let stop = &stop;
            scope.spawn(move |_| {
                while !stop.load(Relaxed) {
                    list.find(&1u32, |_, v: &Canary| assert_eq!(v.0, LIVE));
                }
            });
        }

        let writers: Vec<_> = (0..2)
            .map(|_| {
                let list = &list;
                scope.spawn(move |_| {
                    for _ in 0..2_000 {
                        list.insert(1u32, Canary(LIVE));
                        list.erase(&1u32);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, Relaxed);
    })
    .unwrap();
}

#[test]
fn quiescent_iteration_is_strictly_sorted() {
    let mut list = List::new();

    thread::scope(|scope| {
        for _ in 0..4 {
            let list = &list;
            scope.spawn(move |_| {
                let mut rng = rand::thread_rng();
                for _ in 0..1_000 {
                    // Duplicates across threads are expected to lose.
                    list.insert(rng.gen_range(0..10_000u32), ());
                }
            });
        }
    })
    .unwrap();

    let keys: Vec<u32> = list.iter().map(|(k, _)| *k).collect();
    assert!(!keys.is_empty());
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(keys.len(), list.len());
}

#[test]
fn mixed_churn_settles_consistently() {
    const KEYS: usize = 128;
    let list = List::new();

    thread::scope(|scope| {
        for t in 0..4 {
            let list = &list;
            scope.spawn(move |_| {
                let mut rng = rand::thread_rng();
                for _ in 0..3_000 {
                    let k = rng.gen_range(0..KEYS);
                    if rng.gen_bool(0.5) {
                        list.insert(k, t);
                    } else {
                        list.erase(&k);
                    }
                }
            });
        }
    })
    .unwrap();

    // The counter tracks logical membership; once every thread has joined
    // it must agree with what lookups see.
    let present = (0..KEYS).filter(|k| list.contains(k)).count();
    assert_eq!(present, list.len());
}
