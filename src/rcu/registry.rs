//! The global list of reader records.
//!
//! Every thread that enters a read-side critical section owns a record here.
//! Records are claimed with an active flag and handed back on thread exit so
//! later threads reuse them; the list itself only grows to the high-water
//! mark of concurrently registered threads and is never pruned while the
//! realm lives.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize};

/// One reader's state.
///
/// The state word packs the epoch the reader observed, shifted left by one,
/// with the low bit set while the reader is inside a critical section.
pub(super) struct Reader {
    state: AtomicUsize,
    active: AtomicBool,
    next: AtomicPtr<Reader>,
}

impl Reader {
    fn new() -> Self {
        Reader {
            state: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Announces that the reader entered a critical section at `epoch`.
    ///
    /// The announcement must be fully visible before any following load from
    /// shared memory, hence the full barrier.
    pub(super) fn set_pinned(&self, epoch: usize) {
        let state = (epoch << 1) | 1;
        if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            // On x86 a lock-prefixed swap is cheaper than a store followed
            // by an `mfence`; both are full barriers.
            let previous = self.state.swap(state, SeqCst);
            debug_assert_eq!(previous & 1, 0, "reader pinned twice");
        } else {
            self.state.store(state, Relaxed);
            fence(SeqCst);
        }
    }

    /// Announces that the reader left its critical section.
    pub(super) fn set_unpinned(&self) {
        self.state.store(0, Release);
    }

    /// Returns whether the reader is pinned, and if so at which epoch.
    pub(super) fn state(&self) -> (bool, usize) {
        let state = self.state.load(Relaxed);
        (state & 1 == 1, state >> 1)
    }
}

/// The lock-free registration list.
pub(super) struct Registry {
    head: AtomicPtr<Reader>,
}

unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Registry {
    pub(super) fn new() -> Self {
        Registry {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Claims a record for the current thread.
    ///
    /// Prefers reviving an inactive record over growing the list. The
    /// returned pointer stays valid for the life of the registry.
    pub(super) fn acquire(&self) -> *const Reader {
        let mut cursor = self.head.load(Acquire);
        while !cursor.is_null() {
            let reader = unsafe { &*cursor };
            if reader
                .active
                .compare_exchange(false, true, AcqRel, Relaxed)
                .is_ok()
            {
                return cursor;
            }
            cursor = reader.next.load(Acquire);
        }

        let fresh = Box::into_raw(Box::new(Reader::new()));
        let mut head = self.head.load(Acquire);
        loop {
            unsafe { (*fresh).next.store(head, Relaxed) };
            match self.head.compare_exchange(head, fresh, AcqRel, Acquire) {
                Ok(_) => return fresh,
                Err(h) => head = h,
            }
        }
    }

    /// Returns a record for reuse when its thread exits.
    pub(super) fn release(&self, reader: *const Reader) {
        let reader = unsafe { &*reader };
        reader.state.store(0, Release);
        reader.active.store(false, Release);
    }

    /// Iterates over every record, active or not.
    ///
    /// Inactive records report themselves unpinned, so visiting them is
    /// harmless for epoch advancement.
    pub(super) fn iter(&self) -> Readers<'_> {
        Readers {
            cursor: self.head.load(Acquire),
            _marker: PhantomData,
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            let reader = unsafe { Box::from_raw(cursor) };
            cursor = reader.next.load(Relaxed);
        }
    }
}

pub(super) struct Readers<'a> {
    cursor: *const Reader,
    _marker: PhantomData<&'a Registry>,
}

impl<'a> Iterator for Readers<'a> {
    type Item = &'a Reader;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_null() {
            return None;
        }
        let reader = unsafe { &*self.cursor };
        self.cursor = reader.next.load(Acquire);
        Some(reader)
    }
}
