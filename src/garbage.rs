//! Type-erased deferred disposal.
//!
//! A removed node travels to its disposer as a [`Garbage`] entry: the node's
//! address plus the function that destroys it. Entries are grouped into
//! fixed-capacity [`Bag`]s so a reclamation scheme can move a whole batch of
//! garbage around with one pointer swap.

use std::mem;

use arrayvec::ArrayVec;

/// Maximum number of objects a bag can contain.
const MAX_OBJECTS: usize = 64;

/// A removed object awaiting disposal.
///
/// Dropping a `Garbage` runs its disposer. The entry type-erases the pointee
/// so bags can mix nodes of different containers.
pub(crate) struct Garbage {
    ptr: *mut u8,
    dispose: unsafe fn(*mut u8),
}

// The pointee is unreachable from anywhere but this entry by the time it is
// retired, so moving the entry across threads moves sole ownership.
unsafe impl Send for Garbage {}

impl Garbage {
    /// Makes a garbage entry that will later be destroyed using `dispose`.
    ///
    /// # Safety
    ///
    /// `ptr` must be exclusively owned by the entry from this point on, and
    /// `dispose` must be safe to call on it exactly once, from any thread.
    pub(crate) unsafe fn new<T>(ptr: *mut T, dispose: unsafe fn(*mut T)) -> Self {
        Garbage {
            ptr: ptr as *mut u8,
            dispose: mem::transmute::<unsafe fn(*mut T), unsafe fn(*mut u8)>(dispose),
        }
    }

    /// The disposed object's address, for hazard-slot comparisons.
    pub(crate) fn address(&self) -> usize {
        self.ptr as usize
    }
}

impl Drop for Garbage {
    fn drop(&mut self) {
        unsafe {
            (self.dispose)(self.ptr);
        }
    }
}

/// A fixed-capacity batch of garbage.
pub(crate) struct Bag {
    entries: ArrayVec<Garbage, MAX_OBJECTS>,
}

impl Bag {
    /// Returns a new, empty bag.
    pub(crate) fn new() -> Self {
        Bag {
            entries: ArrayVec::new(),
        }
    }

    /// Returns `true` if the bag holds no garbage.
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attempts to add `garbage` to the bag, handing it back if the bag is full.
    pub(crate) fn try_push(&mut self, garbage: Garbage) -> Result<(), Garbage> {
        self.entries.try_push(garbage).map_err(|e| e.element())
    }
}

// Dropping the bag drops every entry, which runs the disposers.
