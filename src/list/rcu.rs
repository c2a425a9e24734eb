//! The RCU list engine.

use std::borrow::Borrow;
use std::cmp::Ordering::{Equal, Greater, Less};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::atomic::{Atomic, Owned, Shared};
use crate::backoff::Backoff;
use crate::counter::Counter;
use crate::garbage::Garbage;
use crate::rcu::{self, ReadGuard};

use super::{drop_node, Node};

/// Policy for the reentrant-lock check run before disposing operations.
///
/// Erasing and clearing must not happen inside a read-side critical section
/// the caller already holds: the erase defers disposal behind a grace period
/// the caller's own lock is blocking. The default policy turns that misuse
/// into a panic at the call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeadlockCheck {
    /// Panic when a disposing operation runs under the caller's read lock.
    Enforce,
    /// Skip the check; disposal is silently delayed until the lock drops.
    Skip,
}

/// A sorted lock-free linked list protected by RCU.
///
/// The same contract as [`List`], with reclamation flipped around: readers
/// run inside a read-side critical section ([`rcu::read_lock`]) instead of
/// publishing per-node hazards, and removed nodes wait out a grace period
/// before disposal. Mutating calls take the read lock internally for the
/// bounded duration of their search-and-CAS loop.
///
/// Unlike the hazard-pointer engine, a traversal here never helps finish a
/// physical unlink: an unlink that loses its race rolls the logical mark
/// back and retries, so no node stays marked behind a stalled eraser.
///
/// # Examples
///
/// ```
/// use quiesce::{rcu, RcuList};
///
/// let list = RcuList::new();
/// list.insert(1, "one");
///
/// let guard = rcu::read_lock();
/// if let Some((_, v)) = list.get(&1, &guard) {
///     assert_eq!(*v, "one");
/// }
/// ```
///
/// [`List`]: struct.List.html
/// [`rcu::read_lock`]: ../rcu/fn.read_lock.html
pub struct RcuList<K, V> {
    head: Atomic<Node<K, V>>,
    count: Counter,
    deadlock: DeadlockCheck,
}

struct Position<'g, K, V> {
    prev: &'g Atomic<Node<K, V>>,
    cur: Shared<'g, Node<K, V>>,
    next: Shared<'g, Node<K, V>>,
}

impl<K, V> RcuList<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates an empty list with the default deadlock policy.
    pub fn new() -> Self {
        Self::with_deadlock_check(DeadlockCheck::Enforce)
    }

    /// Creates an empty list with the given deadlock policy.
    pub fn with_deadlock_check(deadlock: DeadlockCheck) -> Self {
        RcuList {
            head: Atomic::null(),
            count: Counter::new(),
            deadlock,
        }
    }

    fn check_deadlock(&self) {
        if self.deadlock == DeadlockCheck::Enforce {
            assert!(
                !rcu::is_locked(),
                "rcu: disposing operation inside a read-side critical section"
            );
        }
    }

    /// Walks the chain looking for `key`; caller holds the read lock.
    ///
    /// Restarts after a back-off whenever the recorded edge moved or the
    /// current node turns out to be logically deleted — the winner's unlink
    /// (or rollback) is always just ahead, so waiting is enough.
    fn search<'g, Q>(&'g self, key: &Q, guard: &'g ReadGuard) -> (bool, Position<'g, K, V>)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let backoff = Backoff::new();

        'retry: loop {
            let mut prev: &'g Atomic<Node<K, V>> = &self.head;
            let mut cur = prev.load(Acquire, guard);

            loop {
                let cur_ref = match unsafe { cur.as_ref() } {
                    Some(r) => r,
                    None => {
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

                let next = cur_ref.next.load(Acquire, guard);
                if prev.load(Acquire, guard) != cur || next.is_marked() {
                    backoff.spin();
                    continue 'retry;
                }

                match cur_ref.key.borrow().cmp(key) {
                    Less => {
                        prev = &cur_ref.next;
                        cur = next;
                    }
                    Equal => return (true, Position { prev, cur, next }),
                    Greater => return (false, Position { prev, cur, next }),
                }
            }
        }
    }

    /// Two-phase removal of `pos.cur`; caller holds the read lock.
    ///
    /// Returns `true` only when both the mark and the physical unlink
    /// landed. If the unlink loses, the mark is rolled back so other
    /// traversals never wait on a node nobody is going to remove.
    fn unlink<'g>(&self, pos: &Position<'g, K, V>, guard: &'g ReadGuard) -> bool {
        let cur_ref = unsafe { pos.cur.deref() };

        if cur_ref
            .next
            .compare_and_set(pos.next, pos.next.with_mark(true), AcqRel, guard)
            .is_err()
        {
            return false;
        }

        if pos
            .prev
            .compare_and_set(pos.cur, pos.next, Release, guard)
            .is_ok()
        {
            return true;
        }

        // No other thread touches a marked edge, so the rollback cannot
        // race with anything.
        let _rolled_back = cur_ref
            .next
            .compare_and_set(pos.next.with_mark(true), pos.next, Release, guard);
        debug_assert!(_rolled_back.is_ok());
        false
    }

    /// Inserts `key` → `value` if the key is absent.
    ///
    /// Takes the read lock internally for the duration of the attempt.
    /// Returns `true` on success and `false` if the key was present.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.insert_and(key, value, |_, _| ())
    }

    /// Inserts like [`insert`], then calls `init` on the freshly linked
    /// entry exactly once, inside the same critical section.
    ///
    /// Concurrent readers may already see the entry while `init` runs; any
    /// fields it touches must carry their own synchronization.
    ///
    /// [`insert`]: struct.RcuList.html#method.insert
    pub fn insert_and<F>(&self, key: K, value: V, init: F) -> bool
    where
        F: FnOnce(&K, &V),
    {
        let guard = rcu::read_lock();
        let mut new = Owned::new(Node::new(key, value));

        loop {
            let (found, pos) = self.search(&new.key, &guard);
            if found {
                return false;
            }

            new.next.store(pos.cur, Relaxed);
            match pos.prev.compare_and_set_owned(pos.cur, new, Release, &guard) {
                Ok(linked) => {
                    let node = unsafe { linked.deref() };
                    self.count.inc();
                    init(&node.key, &node.value);
                    return true;
                }
                Err((_, returned)) => {
                    new = returned;
                    new.next.store(Shared::null(), Relaxed);
                }
            }
        }
    }

    /// Inserts `key` → `value`, or visits the existing entry if present.
    ///
    /// Returns `true` if a new entry was inserted; the visitor's first
    /// argument says which case it is seeing.
    pub fn ensure<F>(&self, key: K, value: V, visit: F) -> bool
    where
        F: FnOnce(bool, &K, &V),
    {
        let guard = rcu::read_lock();
        let mut new = Owned::new(Node::new(key, value));

        loop {
            let (found, pos) = self.search(&new.key, &guard);
            if found {
                let node = unsafe { pos.cur.deref() };
                visit(false, &node.key, &node.value);
                return false;
            }

            new.next.store(pos.cur, Relaxed);
            match pos.prev.compare_and_set_owned(pos.cur, new, Release, &guard) {
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
    ///
    /// # Panics
    ///
    /// Panics if called inside the caller's own read-side critical section
    /// and the policy is [`DeadlockCheck::Enforce`].
    ///
    /// [`DeadlockCheck::Enforce`]: enum.DeadlockCheck.html#variant.Enforce
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.erase_with(key, |_, _| ())
    }

    /// Removes the entry for `key`, visiting it after the removal.
    ///
    /// The visitor runs once the read lock is released: the node is already
    /// unlinked and owned by this call, and only then is it retired, so
    /// in-flight readers can finish with it before disposal.
    ///
    /// # Panics
    ///
    /// Panics under [`DeadlockCheck::Enforce`] if the caller holds the read
    /// lock.
    ///
    /// [`DeadlockCheck::Enforce`]: enum.DeadlockCheck.html#variant.Enforce
    pub fn erase_with<Q, F>(&self, key: &Q, visit: F) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnOnce(&K, &V),
    {
        self.check_deadlock();
        let backoff = Backoff::new();

        loop {
            let removed: *mut Node<K, V>;
            {
                let guard = rcu::read_lock();
                let (found, pos) = self.search(key, &guard);
                if !found {
                    return false;
                }
                if !self.unlink(&pos, &guard) {
                    drop(guard);
                    backoff.spin();
                    continue;
                }
                removed = pos.cur.as_raw() as *mut Node<K, V>;
            }

            // Unlinked and ours; readers that still see it are what the
            // grace period is for.
            let node = unsafe { &*removed };
            self.count.dec();
            visit(&node.key, &node.value);
            unsafe { rcu::retire(Garbage::new(removed, drop_node::<K, V>)) };
            return true;
        }
    }

    /// Removes the entry for `key` and hands it to the caller instead of
    /// disposing it.
    ///
    /// The caller must already hold the read lock and passes it in as a
    /// witness. The returned handle owns the unlinked node; dropping (or
    /// [`release`]ing) it — outside the critical section — feeds the node
    /// to deferred reclamation, after which a [`synchronize`] makes the
    /// disposal observable.
    ///
    /// [`release`]: struct.Extracted.html#method.release
    /// [`synchronize`]: ../rcu/fn.synchronize.html
    pub fn extract<Q>(&self, key: &Q, guard: &ReadGuard) -> Option<Extracted<K, V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let backoff = Backoff::new();

        loop {
            let (found, pos) = self.search(key, guard);
            if !found {
                return None;
            }
            if !self.unlink(&pos, guard) {
                backoff.spin();
                continue;
            }
            self.count.dec();
            return Some(Extracted {
                node: pos.cur.as_raw() as *mut Node<K, V>,
            });
        }
    }

    /// Looks up `key` and visits the entry inside an internal critical
    /// section.
    pub fn find<Q, F>(&self, key: &Q, visit: F) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnOnce(&K, &V),
    {
        let guard = rcu::read_lock();
        let (found, pos) = self.search(key, &guard);
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

    /// Looks up `key` and returns references valid for the caller's
    /// critical section.
    pub fn get<'g, Q>(&'g self, key: &Q, guard: &'g ReadGuard) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (found, pos) = self.search(key, guard);
        if found {
            let node = unsafe { pos.cur.deref() };
            Some((&node.key, &node.value))
        } else {
            None
        }
    }

    /// Removes every entry by repeatedly erasing the head.
    ///
    /// # Panics
    ///
    /// Panics under [`DeadlockCheck::Enforce`] if the caller holds the read
    /// lock.
    ///
    /// [`DeadlockCheck::Enforce`]: enum.DeadlockCheck.html#variant.Enforce
    pub fn clear(&self) {
        self.check_deadlock();
        let backoff = Backoff::new();

        loop {
            let removed: *mut Node<K, V>;
            {
                let guard = rcu::read_lock();
                let head = self.head.load(Acquire, &guard);
                let head_ref = match unsafe { head.as_ref() } {
                    Some(r) => r,
                    None => return,
                };
                let next = head_ref.next.load(Acquire, &guard);
                if next.is_marked() {
                    drop(guard);
                    backoff.spin();
                    continue;
                }

                if head_ref
                    .next
                    .compare_and_set_weak(next, next.with_mark(true), AcqRel, &guard)
                    .is_err()
                {
                    drop(guard);
                    backoff.spin();
                    continue;
                }
                if self
                    .head
                    .compare_and_set_weak(head, next, Release, &guard)
                    .is_err()
                {
                    let _rolled_back =
                        head_ref
                            .next
                            .compare_and_set(next.with_mark(true), next, Release, &guard);
                    debug_assert!(_rolled_back.is_ok());
                    drop(guard);
                    backoff.spin();
                    continue;
                }
                removed = head.as_raw() as *mut Node<K, V>;
            }

            self.count.dec();
            unsafe { rcu::retire(Garbage::new(removed, drop_node::<K, V>)) };
        }
    }

    /// Returns `true` if the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_null(Relaxed)
    }

    /// Number of live entries; see [`List::len`] for the consistency
    /// caveat.
    ///
    /// [`List::len`]: struct.List.html#method.len
    pub fn len(&self) -> usize {
        self.count.get()
    }

    /// Iterates over the chain in key order under the caller's read guard.
    ///
    /// No snapshot consistency: entries inserted or erased mid-iteration
    /// may or may not appear, and entries whose physical unlink is pending
    /// are yielded as-is.
    pub fn iter<'g>(&'g self, guard: &'g ReadGuard) -> RcuIter<'g, K, V> {
        RcuIter {
            cur: self.head.load(Acquire, guard),
            guard,
        }
    }
}

impl<K, V> Default for RcuList<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        RcuList::new()
    }
}

impl<K, V> Drop for RcuList<K, V> {
    fn drop(&mut self) {
        // Exclusive access: free the chain directly. Already-retired nodes
        // are off the chain, waiting on their grace period.
        let mut cur = self.head.raw(Relaxed);
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.raw(Relaxed);
        }
    }
}

/// An entry removed by [`RcuList::extract`]: unlinked, not yet disposed.
///
/// The holder owns the node, so the accessors are safe whether or not the
/// read lock is still held; concurrent readers that found the node before
/// the unlink may also still be reading it. Dropping the handle retires the
/// node into deferred reclamation.
///
/// [`RcuList::extract`]: struct.RcuList.html#method.extract
pub struct Extracted<K, V> {
    node: *mut Node<K, V>,
}

unsafe impl<K: Send, V: Send> Send for Extracted<K, V> {}

impl<K, V> Extracted<K, V> {
    /// The removed entry's key.
    pub fn key(&self) -> &K {
        unsafe { &(*self.node).key }
    }

    /// The removed entry's value.
    pub fn value(&self) -> &V {
        unsafe { &(*self.node).value }
    }

    /// Hands the node to deferred reclamation.
    ///
    /// Equivalent to dropping the handle; spelled out so call sites can
    /// mark where in the protocol the hand-off happens. Call it after
    /// leaving the critical section — a following [`synchronize`] then
    /// guarantees the disposer has run.
    ///
    /// [`synchronize`]: ../rcu/fn.synchronize.html
    pub fn release(self) {
        drop(self);
    }
}

impl<K, V> Drop for Extracted<K, V> {
    fn drop(&mut self) {
        // Releasing inside a critical section does not corrupt anything,
        // but the caller's own lock would stall the grace period.
        debug_assert!(
            !rcu::is_locked(),
            "rcu: extracted node released inside a read-side critical section"
        );
        unsafe { rcu::retire(Garbage::new(self.node, drop_node::<K, V>)) };
    }
}

/// An iterator over an [`RcuList`], valid within one read-side critical
/// section.
///
/// [`RcuList`]: struct.RcuList.html
pub struct RcuIter<'g, K, V> {
    cur: Shared<'g, Node<K, V>>,
    guard: &'g ReadGuard,
}

impl<'g, K, V> Iterator for RcuIter<'g, K, V> {
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = unsafe { self.cur.as_ref() }?;
        self.cur = node.next.load(Acquire, self.guard).with_mark(false);
        Some((&node.key, &node.value))
    }
}
