//! Concurrent item counting.

use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

use crossbeam_utils::CachePadded;

/// An approximate count of a container's live elements.
///
/// Updated with relaxed operations on the logical insert/erase linearization
/// points. Because physical unlinking may lag logical deletion, the counter
/// tracks membership, not chain length; the two agree at quiescent points.
#[derive(Default)]
pub(crate) struct Counter {
    value: CachePadded<AtomicUsize>,
}

impl Counter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc(&self) {
        self.value.fetch_add(1, Relaxed);
    }

    pub(crate) fn dec(&self) {
        self.value.fetch_sub(1, Relaxed);
    }

    pub(crate) fn get(&self) -> usize {
        self.value.load(Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        c.inc();
        c.dec();
        assert_eq!(c.get(), 1);
    }
}
