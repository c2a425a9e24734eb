//! Integration tests for the hash map and hash set.

use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::AtomicUsize;

use crossbeam_utils::thread;
use quiesce::{HashMap, HashSet};
use rand::Rng;

#[test]
fn map_basic_operations() {
    let map = HashMap::new();
    assert!(map.is_empty());

    assert!(map.insert("a", 1));
    assert!(map.insert("b", 2));
    assert!(!map.insert("a", 3));

    assert!(map.contains_key(&"a"));
    assert!(map.find(&"b", |_, v| assert_eq!(*v, 2)));
    assert_eq!(map.len(), 2);

    assert!(map.remove(&"a"));
    assert!(!map.remove(&"a"));
    assert_eq!(map.len(), 1);
}

#[test]
fn insert_with_builds_value_lazily() {
    let map = HashMap::new();
    let built = AtomicUsize::new(0);

    assert!(map.insert_with(1, || {
        built.fetch_add(1, SeqCst);
        "constructed"
    }));
    assert_eq!(built.load(SeqCst), 1);

    // Present key: the constructor must not run at all.
    assert!(!map.insert_with(1, || {
        built.fetch_add(1, SeqCst);
        "wasted"
    }));
    assert_eq!(built.load(SeqCst), 1);
    assert!(map.find(&1, |_, v| assert_eq!(*v, "constructed")));
}

#[test]
fn ensure_and_remove_with() {
    let map = HashMap::new();
    assert!(map.ensure(9, 90, |inserted, _, _| assert!(inserted)));
    assert!(!map.ensure(9, 91, |inserted, _, v| {
        assert!(!inserted);
        assert_eq!(*v, 90);
    }));

    let visited = AtomicUsize::new(0);
    assert!(map.remove_with(&9, |_, v| {
        assert_eq!(*v, 90);
        visited.fetch_add(1, SeqCst);
    }));
    assert_eq!(visited.load(SeqCst), 1);
    assert!(map.is_empty());
}

#[test]
fn map_clear_and_iter() {
    let mut map = HashMap::with_capacity(16);
    for k in 0..500u32 {
        assert!(map.insert(k, k * 2));
    }
    assert_eq!(map.len(), 500);
    assert_eq!(map.iter().count(), 500);

    let mut keys: Vec<u32> = map.iter().map(|(k, _)| *k).collect();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), 500);

    map.clear();
    assert!(map.is_empty());
    assert_eq!(map.iter().count(), 0);
}

#[test]
fn map_concurrent_mixed_workload() {
    const KEYS: u32 = 512;
    let map = HashMap::with_capacity(64);

    thread::scope(|scope| {
        for t in 0..4 {
            let map = &map;
            scope.spawn(move |_| {
                let mut rng = rand::thread_rng();
                for _ in 0..5_000 {
                    let k = rng.gen_range(0..KEYS);
                    match rng.gen_range(0..3) {
                        0 => {
                            map.insert(k, t);
                        }
                        1 => {
                            map.remove(&k);
                        }
                        _ => {
                            map.find(&k, |_, _| ());
                        }
                    }
                }
            });
        }
    })
    .unwrap();

    // Quiescent again: the summed counters agree with lookups.
    let present = (0..KEYS).filter(|k| map.contains_key(k)).count();
    assert_eq!(present, map.len());
}

#[test]
fn map_concurrent_distinct_inserts() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 1_000;

    let map = HashMap::with_capacity(256);
    thread::scope(|scope| {
        for t in 0..THREADS {
            let map = &map;
            scope.spawn(move |_| {
                for i in 0..PER_THREAD {
                    assert!(map.insert(t * PER_THREAD + i, ()));
                }
            });
        }
    })
    .unwrap();

    assert_eq!(map.len(), THREADS * PER_THREAD);
    for k in 0..THREADS * PER_THREAD {
        assert!(map.contains_key(&k));
    }
}

#[test]
fn set_basic_operations() {
    let set = HashSet::new();
    assert!(set.insert(10));
    assert!(!set.insert(10));
    assert!(set.contains(&10));
    assert!(set.get(&10, |v| assert_eq!(*v, 10)));
    assert_eq!(set.len(), 1);

    assert!(set.remove(&10));
    assert!(!set.remove(&10));
    assert!(set.is_empty());
}

#[test]
fn set_concurrent_single_winner() {
    const THREADS: usize = 8;
    let set = HashSet::new();

    for round in 0..64usize {
        let winners = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|_| {
                    if set.insert(round) {
                        winners.fetch_add(1, SeqCst);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(winners.load(SeqCst), 1);
    }
    assert_eq!(set.len(), 64);
}

#[test]
fn set_clear_and_iter() {
    let mut set = HashSet::with_capacity(8);
    for v in 0..200u32 {
        set.insert(v);
    }
    assert_eq!(set.iter().count(), 200);

    set.clear();
    assert!(set.is_empty());
    assert_eq!(set.iter().count(), 0);
}
