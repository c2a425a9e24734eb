//! The global epoch.
//!
//! Every so often the global epoch is incremented — it "advances". A pinned
//! reader may only be ignored by reclamation once the epoch has advanced
//! twice past the value it announced: after two advancements no reader can
//! still hold a reference obtained before the first. That is the crux of
//! safe memory reclamation here.

use std::sync::atomic::Ordering::{self, Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{fence, AtomicUsize};

use crossbeam_utils::CachePadded;

use super::registry::Registry;

/// The global epoch is a (cache-padded) integer.
#[derive(Default)]
pub(super) struct Epoch {
    value: CachePadded<AtomicUsize>,
}

impl Epoch {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn load(&self, ord: Ordering) -> usize {
        self.value.load(ord)
    }

    /// Attempts to advance the global epoch.
    ///
    /// The epoch can only advance once every currently pinned reader has
    /// been pinned in the current epoch. Returns the epoch as of after the
    /// attempt.
    ///
    /// Annotated `#[cold]` because advancement is rare next to pinning.
    #[cold]
    pub(super) fn try_advance(&self, registry: &Registry) -> usize {
        let epoch = self.value.load(Relaxed);
        fence(SeqCst);

        for reader in registry.iter() {
            let (pinned, seen) = reader.state();
            // A reader still sitting in an older epoch blocks advancement.
            if pinned && seen != epoch {
                return epoch;
            }
        }
        fence(Acquire);

        match self
            .value
            .compare_exchange(epoch, epoch.wrapping_add(1), Release, Relaxed)
        {
            Ok(_) => epoch.wrapping_add(1),
            Err(current) => current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_when_unpinned() {
        let registry = Registry::new();
        let epoch = Epoch::new();
        assert_eq!(epoch.try_advance(&registry), 1);
        assert_eq!(epoch.try_advance(&registry), 2);
    }

    #[test]
    fn pinned_reader_blocks_advance() {
        let registry = Registry::new();
        let epoch = Epoch::new();
        let reader = unsafe { &*registry.acquire() };

        reader.set_pinned(epoch.load(Relaxed));
        let at = epoch.load(Relaxed);
        // Pinned at the current epoch: one advancement is allowed...
        assert_eq!(epoch.try_advance(&registry), at + 1);
        // ...but not a second while the reader lags behind.
        assert_eq!(epoch.try_advance(&registry), at + 1);

        reader.set_unpinned();
        assert_eq!(epoch.try_advance(&registry), at + 2);
    }
}
