//! Hazard-pointer memory reclamation.
//!
//! Michael.  Hazard Pointers: Safe Memory Reclamation for Lock-Free Objects.
//! IEEE TPDS 2004.
//!
//! A [`Domain`] owns a global list of publication slots. Before a thread
//! dereferences a node it publishes the node's address in one of its slots
//! and re-validates the source location; a thread that has retired a node
//! only frees it once no slot anywhere publishes its address. Slots are
//! never unlinked while the domain lives: each thread keeps the ones it
//! claimed (the per-thread state, slots included, is handed to a later
//! thread when thread ids recycle), so the list only grows to the
//! high-water mark of registered threads.
//!
//! [`Domain`]: struct.Domain.html

use std::cell::{Cell, UnsafeCell};
use std::collections::HashSet;
use std::mem;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize};

use thread_local::ThreadLocal;

use crate::atomic::{Atomic, Protection, Shared};
use crate::garbage::Garbage;

/// Number of publication slots in one [`Guards`] set.
///
/// Three is what a sorted-list traversal needs live at once: the previous
/// node, the current node and its successor.
///
/// [`Guards`]: struct.Guards.html
pub const GUARD_SLOTS: usize = 3;

/// Default cap on slots lent to a single thread at a time.
const DEFAULT_MAX_SLOTS: usize = 16;

/// Default number of retired entries that triggers a scan.
const DEFAULT_SCAN_THRESHOLD: usize = 64;

/// One publication slot in the global hazard list.
struct Slot {
    /// Address currently protected by the owning thread; zero when clear.
    protected: AtomicUsize,
    /// The next slot in the global list.
    next: AtomicPtr<Slot>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            protected: AtomicUsize::new(0),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

/// Per-thread hazard state: claimed slots, how many are lent out to live
/// guard sets, and the local retired list.
struct Local {
    slots: UnsafeCell<Vec<*const Slot>>,
    lent: Cell<usize>,
    retired: UnsafeCell<Vec<Garbage>>,
}

// Only the owning thread touches a `Local`; the `ThreadLocal` container
// needs `Send` to move it to the domain's destructor after threads exit.
unsafe impl Send for Local {}

impl Local {
    fn new() -> Self {
        Local {
            slots: UnsafeCell::new(Vec::new()),
            lent: Cell::new(0),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

/// A hazard-pointer reclamation domain.
///
/// Every container that shares nodes must share the domain that protects
/// them; a [`HashMap`]'s buckets, for instance, all hold one `Domain` behind
/// an `Arc`. Retired nodes are disposed by the retiring thread once a scan
/// proves no slot publishes their address, or at the latest when the domain
/// itself is dropped.
///
/// [`HashMap`]: ../map/struct.HashMap.html
pub struct Domain {
    head: AtomicPtr<Slot>,
    locals: ThreadLocal<Local>,
    max_slots: usize,
    scan_threshold: usize,
}

impl Domain {
    /// Creates a domain with default slot and scan limits.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SLOTS, DEFAULT_SCAN_THRESHOLD)
    }

    /// Creates a domain that lends at most `max_slots` slots to one thread
    /// and scans once `scan_threshold` retired entries accumulate.
    pub fn with_capacity(max_slots: usize, scan_threshold: usize) -> Self {
        assert!(max_slots >= GUARD_SLOTS, "domain too small for one guard set");
        assert!(scan_threshold >= 1, "scan threshold must be positive");
        Domain {
            head: AtomicPtr::new(std::ptr::null_mut()),
            locals: ThreadLocal::new(),
            max_slots,
            scan_threshold,
        }
    }

    fn local(&self) -> &Local {
        self.locals.get_or(Local::new)
    }

    /// Claims a fresh slot for the current thread by pushing it onto the
    /// global list. Claimed slots stay with the thread's state for the life
    /// of the domain, so this runs a bounded number of times per thread.
    fn claim_slot(&self) -> *const Slot {
        let fresh = Box::into_raw(Box::new(Slot::new()));
        let mut head = self.head.load(Acquire);
        loop {
            unsafe { (*fresh).next.store(head, Relaxed) };
            match self.head.compare_exchange(head, fresh, AcqRel, Acquire) {
                Ok(_) => return fresh,
                Err(h) => head = h,
            }
        }
    }

    /// Acquires a set of [`GUARD_SLOTS`] publication slots for a traversal.
    ///
    /// Guard sets must be dropped in the reverse order of acquisition.
    ///
    /// # Panics
    ///
    /// Panics if the acquisition would exceed the per-thread slot cap — that
    /// is a caller bug (too many simultaneously live guard sets, typically a
    /// visitor recursing into the same domain too deeply), not a condition
    /// that retrying can fix.
    ///
    /// [`GUARD_SLOTS`]: constant.GUARD_SLOTS.html
    pub fn guards(&self) -> Guards<'_> {
        let local = self.local();
        let base = local.lent.get();
        assert!(
            base + GUARD_SLOTS <= self.max_slots,
            "hazard pointer pool exhausted ({} slots per thread)",
            self.max_slots
        );

        let slots = unsafe { &mut *local.slots.get() };
        while slots.len() < base + GUARD_SLOTS {
            slots.push(self.claim_slot());
        }
        local.lent.set(base + GUARD_SLOTS);

        Guards { local, base }
    }

    /// Schedules `garbage` for disposal once no slot protects its address.
    ///
    /// # Safety
    ///
    /// The entry's pointee must already be unreachable for new traversals
    /// (physically unlinked), and must not be retired twice.
    pub(crate) unsafe fn retire(&self, garbage: Garbage) {
        let local = self.local();
        let retired = &mut *local.retired.get();
        retired.push(garbage);
        if retired.len() >= self.scan_threshold {
            self.scan();
        }
    }

    /// Disposes every retired entry whose address no slot publishes.
    fn scan(&self) {
        fence(SeqCst);

        let mut protected = HashSet::new();
        let mut cursor = self.head.load(Acquire);
        while !cursor.is_null() {
            let slot = unsafe { &*cursor };
            let addr = slot.protected.load(Acquire);
            if addr != 0 {
                protected.insert(addr);
            }
            cursor = slot.next.load(Acquire);
        }

        // Detach the retired list before disposing: a disposer may itself
        // retire into this domain.
        let local = self.local();
        let drained = mem::replace(unsafe { &mut *local.retired.get() }, Vec::new());
        let mut kept = Vec::new();
        for garbage in drained {
            if protected.contains(&garbage.address()) {
                kept.push(garbage);
            }
            // Dropping the entry here runs its disposer.
        }
        unsafe { &mut *local.retired.get() }.append(&mut kept);
    }
}

impl Default for Domain {
    fn default() -> Self {
        Domain::new()
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        // No threads can hold guards any more: free the slot records. The
        // per-thread retired lists are disposed when `locals` drops next.
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            let slot = unsafe { Box::from_raw(cursor) };
            cursor = slot.next.load(Relaxed);
        }
    }
}

/// A set of hazard slots held for the duration of one traversal.
///
/// Obtained from [`Domain::guards`]. Pointers returned by [`protect`] stay
/// allocated for as long as the slot they were published in is not
/// overwritten or cleared and the guard set is alive.
///
/// [`Domain::guards`]: struct.Domain.html#method.guards
/// [`protect`]: struct.Guards.html#method.protect
pub struct Guards<'d> {
    local: &'d Local,
    base: usize,
}

impl<'d> Guards<'d> {
    fn slot(&self, index: usize) -> &Slot {
        debug_assert!(index < GUARD_SLOTS);
        let slots = unsafe { &*self.local.slots.get() };
        unsafe { &*slots[self.base + index] }
    }

    /// Snapshots `src` and pins the pointee's address in slot `index`.
    ///
    /// Publishes the loaded address and re-reads `src` until the two agree,
    /// so the pointee cannot have been freed between load and publication.
    /// The returned pointer carries the mark bit observed by the final load.
    pub fn protect<'g, T>(&'g self, index: usize, src: &Atomic<T>) -> Shared<'g, T> {
        let slot = self.slot(index);
        let mut word = src.word(Acquire);
        loop {
            let addr = Shared::<T>::from_word(word).as_raw() as usize;
            slot.protected.store(addr, SeqCst);
            let reread = src.word(Acquire);
            if Shared::<T>::from_word(reread).as_raw() as usize == addr {
                return Shared::from_word(reread);
            }
            word = reread;
        }
    }

    /// Publishes the address held in slot `src` in slot `dst` as well.
    ///
    /// Used when a traversal advances: the node protected as "current"
    /// becomes "previous" without a window in which it is unprotected.
    pub fn copy(&self, dst: usize, src: usize) {
        let addr = self.slot(src).protected.load(Relaxed);
        self.slot(dst).protected.store(addr, SeqCst);
    }

    /// Clears slot `index`.
    pub fn clear(&self, index: usize) {
        self.slot(index).protected.store(0, Release);
    }
}

impl<'d> Protection for Guards<'d> {}

impl<'d> Drop for Guards<'d> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.local.lent.get(),
            self.base + GUARD_SLOTS,
            "guard sets must be dropped in LIFO order"
        );
        for index in 0..GUARD_SLOTS {
            self.clear(index);
        }
        self.local.lent.set(self.base);
    }
}
