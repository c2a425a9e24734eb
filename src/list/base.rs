//! The hazard-pointer list engine.

use std::borrow::Borrow;
use std::cmp::Ordering::{Equal, Greater, Less};
use std::marker::PhantomData;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::Arc;

use crate::atomic::{Atomic, Owned, Shared};
use crate::backoff::Backoff;
use crate::counter::Counter;
use crate::garbage::Garbage;
use crate::hazard::{Domain, Guards};

use super::{drop_node, Node};

/// Guard-slot roles during a traversal.
const PREV: usize = 0;
const CUR: usize = 1;
const NEXT: usize = 2;

/// A sorted lock-free linked list protected by hazard pointers.
///
/// Keys are unique: an [`insert`] of a present key fails without mutating
/// anything. `insert`, [`erase`] and [`find`] on one key are linearizable
/// with respect to each other; no snapshot consistency is promised across
/// keys.
///
/// Search is linear, so a bare list suits small key populations; [`HashMap`]
/// shards many of them to keep chains short.
///
/// # Examples
///
/// ```
/// use quiesce::List;
///
/// let list = List::new();
/// assert!(list.insert(3, "three"));
/// assert!(!list.insert(3, "again"));
/// assert!(list.find(&3, |_, v| assert_eq!(*v, "three")));
/// assert!(list.erase(&3));
/// assert!(!list.contains(&3));
/// ```
///
/// [`insert`]: struct.List.html#method.insert
/// [`erase`]: struct.List.html#method.erase
/// [`find`]: struct.List.html#method.find
/// [`HashMap`]: ../struct.HashMap.html
pub struct List<K, V> {
    head: Atomic<Node<K, V>>,
    domain: Arc<Domain>,
    count: Counter,
}

/// Where a search ended up: the slot that pointed at `cur`, the node itself,
/// and its successor at the time of the lookup.
///
/// Only valid as long as nothing relinks around it; every CAS that consumes
/// a position expects the exact unmarked words recorded here and restarts
/// the search when it lost a race instead.
struct Position<'g, K, V> {
    prev: &'g Atomic<Node<K, V>>,
    cur: Shared<'g, Node<K, V>>,
    next: Shared<'g, Node<K, V>>,
}

impl<K, V> List<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates an empty list with its own reclamation domain.
    pub fn new() -> Self {
        Self::with_domain(Arc::new(Domain::new()))
    }

    /// Creates an empty list protected by `domain`.
    ///
    /// Containers that share nodes across many lists (such as a bucket
    /// array) share a single domain this way.
    pub fn with_domain(domain: Arc<Domain>) -> Self {
        List {
            head: Atomic::null(),
            domain,
            count: Counter::new(),
        }
    }

    /// The reclamation domain protecting this list.
    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    /// Hands a physically unlinked node to the reclamation domain.
    unsafe fn retire(&self, node: Shared<'_, Node<K, V>>) {
        self.domain
            .retire(Garbage::new(node.as_raw() as *mut Node<K, V>, drop_node::<K, V>));
    }

    /// Walks the chain looking for `key`.
    ///
    /// Returns whether the key was found, plus the position to link or
    /// unlink at. On the way it finishes the physical unlink of any
    /// logically deleted node it crosses, retiring it; whenever a
    /// validation load disagrees with the recorded position the walk backs
    /// off and restarts from the head.
    fn search<'g, Q>(&'g self, key: &Q, guards: &'g Guards<'_>) -> (bool, Position<'g, K, V>)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let backoff = Backoff::new();

        'retry: loop {
            let mut prev: &'g Atomic<Node<K, V>> = &self.head;
            let mut cur = guards.protect(CUR, prev);

            loop {
                let cur_ref = match unsafe { cur.as_ref() } {
                    Some(r) => r,
                    None => {
                        // Ran off the tail: insertion point is after `prev`.
                        return (
                            false,
                            Position {
                                prev,
                                cur: Shared::null(),
                                next: Shared::null(),
                            },
                        );
                    }
                };

                let next = guards.protect(NEXT, &cur_ref.next);

                // `prev` must still point at the unmarked `cur`; a marked or
                // redirected edge means the position is stale.
                if prev.load(Acquire, guards) != cur {
                    backoff.spin();
                    continue 'retry;
                }

                if next.is_marked() {
                    // `cur` is logically deleted. Finish the unlink for
                    // whoever marked it, then take over its successor.
                    match prev.compare_and_set(cur, next.with_mark(false), Release, guards) {
                        Ok(()) => {
                            unsafe { self.retire(cur) };
                            guards.copy(CUR, NEXT);
                            cur = next.with_mark(false);
                        }
                        Err(_) => {
                            backoff.spin();
                            continue 'retry;
                        }
                    }
                } else {
                    match cur_ref.key.borrow().cmp(key) {
                        Less => {
                            prev = &cur_ref.next;
                            guards.copy(PREV, CUR);
                            guards.copy(CUR, NEXT);
                            cur = next;
                        }
                        Equal => return (true, Position { prev, cur, next }),
                        Greater => return (false, Position { prev, cur, next }),
                    }
                }
            }
        }
    }

    /// Inserts `key` → `value` if the key is absent.
    ///
    /// Returns `true` on success and `false` if the key was already present,
    /// in which case nothing is mutated and the value is dropped.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.insert_and(key, value, |_, _| ())
    }

    /// Inserts like [`insert`], then calls `init` on the freshly linked
    /// entry — still under the traversal's protection — exactly once.
    ///
    /// `init` runs only if the insertion succeeded. Concurrent readers may
    /// already see the entry while `init` runs, so any fields it touches
    /// must be synchronized on their own (atomics or locks inside `V`).
    ///
    /// [`insert`]: struct.List.html#method.insert
    pub fn insert_and<F>(&self, key: K, value: V, init: F) -> bool
    where
        F: FnOnce(&K, &V),
    {
        let guards = self.domain.guards();
        let mut new = Owned::new(Node::new(key, value));

        loop {
            let (found, pos) = self.search(&new.key, &guards);
            if found {
                // Caller still owned the node; dropping it here leaks
                // nothing and runs the key/value destructors.
                return false;
            }

            new.next.store(pos.cur, Relaxed);
            match pos.prev.compare_and_set_owned(pos.cur, new, Release, &guards) {
                Ok(linked) => {
                    let node = unsafe { linked.deref() };
                    self.count.inc();
                    init(&node.key, &node.value);
                    return true;
                }
                Err((_, returned)) => {
                    // The node was never published; clear its next field and
                    // try again from a fresh search.
                    new = returned;
                    new.next.store(Shared::null(), Relaxed);
                }
            }
        }
    }

    /// Inserts `key` → `value`, or visits the existing entry if the key is
    /// present.
    ///
    /// Returns `true` if a new entry was inserted. The visitor receives
    /// `true` and the new entry on insertion, or `false` and the existing
    /// entry (with `value` dropped) otherwise.
    pub fn ensure<F>(&self, key: K, value: V, visit: F) -> bool
    where
        F: FnOnce(bool, &K, &V),
    {
        let guards = self.domain.guards();
        let mut new = Owned::new(Node::new(key, value));

        loop {
            let (found, pos) = self.search(&new.key, &guards);
            if found {
                let node = unsafe { pos.cur.deref() };
                visit(false, &node.key, &node.value);
                return false;
            }

            new.next.store(pos.cur, Relaxed);
            match pos.prev.compare_and_set_owned(pos.cur, new, Release, &guards) {
                Ok(linked) => {
                    let node = unsafe { linked.deref() };
                    self.count.inc();
                    visit(true, &node.key, &node.value);
                    return true;
                }
                Err((_, returned)) => {
                    new = returned;
                    new.next.store(Shared::null(), Relaxed);
                }
            }
        }
    }

    /// Removes the entry for `key`, if any.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.erase_with(key, |_, _| ())
    }

    /// Removes the entry for `key`, visiting it after the removal won.
    ///
    /// Deletion is two-phase. Marking the entry's outgoing edge decides the
    /// race: exactly one concurrent eraser of a key observes `true`. The
    /// physical unlink may then lose to a neighbor — in that case the entry
    /// stays transiently reachable (marked) and the next traversal that
    /// crosses it finishes the job.
    pub fn erase_with<Q, F>(&self, key: &Q, visit: F) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnOnce(&K, &V),
    {
        let guards = self.domain.guards();
        let backoff = Backoff::new();

        loop {
            let (found, pos) = self.search(key, &guards);
            if !found {
                return false;
            }
            let cur_ref = unsafe { pos.cur.deref() };

            // Logical deletion: mark the edge, conditional on the exact
            // unmarked successor the search recorded.
            if cur_ref
                .next
                .compare_and_set(pos.next, pos.next.with_mark(true), AcqRel, &guards)
                .is_err()
            {
                backoff.spin();
                continue;
            }

            // Physical unlink. Losing here is fine: a later traversal will
            // swing the pointer and retire the node instead.
            if pos
                .prev
                .compare_and_set(pos.cur, pos.next, Release, &guards)
                .is_ok()
            {
                unsafe { self.retire(pos.cur) };
            }

            // The guard set still protects the node, retired or not.
            self.count.dec();
            visit(&cur_ref.key, &cur_ref.value);
            return true;
        }
    }

    /// Looks up `key` and visits the entry while it is protected.
    ///
    /// The visitor sees the entry through shared references; concurrent
    /// visitors of one entry are not mutually excluded, so read-modify-write
    /// of the value needs its own synchronization inside `V`.
    pub fn find<Q, F>(&self, key: &Q, visit: F) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnOnce(&K, &V),
    {
        let guards = self.domain.guards();
        let (found, pos) = self.search(key, &guards);
        if found {
            let node = unsafe { pos.cur.deref() };
            visit(&node.key, &node.value);
        }
        found
    }

    /// Returns `true` if `key` has a live entry.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find(key, |_, _| ())
    }

    /// Removes every entry by repeatedly erasing the head.
    ///
    /// Each step is lock-free but the whole sweep is not atomic: concurrent
    /// inserts may land behind the sweep. Meant for teardown.
    pub fn clear(&self) {
        let guards = self.domain.guards();
        let backoff = Backoff::new();

        loop {
            let head = guards.protect(CUR, &self.head);
            let head_ref = match unsafe { head.as_ref() } {
                Some(r) => r,
                None => return,
            };
            let next = guards.protect(NEXT, &head_ref.next);
            if next.is_marked() {
                // Another eraser won the mark; finish its unlink so the
                // sweep keeps making progress.
                if self
                    .head
                    .compare_and_set(head, next.with_mark(false), Release, &guards)
                    .is_ok()
                {
                    unsafe { self.retire(head) };
                } else {
                    backoff.spin();
                }
                continue;
            }

            if head_ref
                .next
                .compare_and_set(next, next.with_mark(true), AcqRel, &guards)
                .is_err()
            {
                backoff.spin();
                continue;
            }
            if self
                .head
                .compare_and_set(head, next, Release, &guards)
                .is_ok()
            {
                unsafe { self.retire(head) };
            }
            self.count.dec();
        }
    }

    /// Returns `true` if the chain is empty.
    ///
    /// Unlike [`len`], this reads the structure itself and is exact.
    ///
    /// [`len`]: struct.List.html#method.len
    pub fn is_empty(&self) -> bool {
        self.head.is_null(Relaxed)
    }

    /// Number of live entries.
    ///
    /// Counted at the logical insert/erase points, so it may transiently
    /// disagree with the physical chain while an unlink is still pending;
    /// the two agree whenever no operation is in flight.
    pub fn len(&self) -> usize {
        self.count.get()
    }

    /// Iterates over the chain in key order.
    ///
    /// Requires exclusive access: there is no way to protect an unbounded
    /// walk with a bounded set of hazard slots, so iteration is only
    /// offered once no other thread can mutate the list. Entries whose
    /// physical unlink is still pending are yielded marked-as-is.
    pub fn iter(&mut self) -> Iter<'_, K, V> {
        Iter {
            cur: self.head.raw(Relaxed),
            _marker: PhantomData,
        }
    }
}

impl<K, V> Default for List<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        List::new()
    }
}

impl<K, V> Drop for List<K, V> {
    fn drop(&mut self) {
        // Exclusive access: free the chain directly. Nodes already retired
        // are not on the chain and are disposed when the domain goes.
        let mut cur = self.head.raw(Relaxed);
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.raw(Relaxed);
        }
    }
}

/// A quiescent iterator over a [`List`].
///
/// [`List`]: struct.List.html
pub struct Iter<'a, K, V> {
    cur: *const Node<K, V>,
    _marker: PhantomData<&'a List<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        let node = unsafe { &*self.cur };
        self.cur = node.next.raw(Relaxed);
        Some((&node.key, &node.value))
    }
}
