//! A lock-free hash set.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use crate::hazard::Domain;
use crate::list::List;

/// Default number of buckets.
const DEFAULT_BUCKETS: usize = 256;

/// A lock-free hash set sharding a sorted list per bucket.
///
/// The set-flavored counterpart of [`HashMap`]: a fixed power-of-two bucket
/// array of unit-valued lists behind one shared hazard-pointer domain.
///
/// # Examples
///
/// ```
/// use quiesce::HashSet;
///
/// let set = HashSet::new();
/// assert!(set.insert(10));
/// assert!(!set.insert(10));
/// assert!(set.contains(&10));
/// assert!(set.remove(&10));
/// ```
///
/// [`HashMap`]: struct.HashMap.html
pub struct HashSet<T, S = RandomState> {
    buckets: Box<[List<T, ()>]>,
    hasher: S,
    mask: usize,
}

impl<T> HashSet<T, RandomState>
where
    T: Ord + Hash + Send + Sync + 'static,
{
    /// Creates a set with the default bucket count.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUCKETS)
    }

    /// Creates a set with at least `buckets` buckets (rounded up to a power
    /// of two).
    pub fn with_capacity(buckets: usize) -> Self {
        Self::with_capacity_and_hasher(buckets, RandomState::new())
    }
}

impl<T> Default for HashSet<T, RandomState>
where
    T: Ord + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        HashSet::new()
    }
}

impl<T, S> HashSet<T, S>
where
    T: Ord + Hash + Send + Sync + 'static,
    S: BuildHasher,
{
    /// Creates a set with at least `buckets` buckets and the given hasher.
    pub fn with_capacity_and_hasher(buckets: usize, hasher: S) -> Self {
        let len = buckets.next_power_of_two();
        let domain = Arc::new(Domain::new());
        let buckets: Vec<List<T, ()>> = (0..len)
            .map(|_| List::with_domain(domain.clone()))
            .collect();
        HashSet {
            mask: len - 1,
            buckets: buckets.into_boxed_slice(),
            hasher,
        }
    }

    fn bucket<Q>(&self, value: &Q) -> &List<T, ()>
    where
        Q: Hash + ?Sized,
    {
        let mut state = self.hasher.build_hasher();
        value.hash(&mut state);
        &self.buckets[(state.finish() as usize) & self.mask]
    }

    /// Adds `value` if absent; returns `true` on success.
    pub fn insert(&self, value: T) -> bool {
        self.bucket(&value).insert(value, ())
    }

    /// Returns `true` if the set holds a value equal to `value`.
    pub fn contains<Q>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
    {
        self.bucket(value).contains(value)
    }

    /// Looks up `value` and visits the stored element while it is
    /// protected.
    pub fn get<Q, F>(&self, value: &Q, visit: F) -> bool
    where
        T: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
        F: FnOnce(&T),
    {
        self.bucket(value).find(value, |stored, _| visit(stored))
    }

    /// Removes `value`, if present.
    pub fn remove<Q>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
    {
        self.bucket(value).erase(value)
    }

    /// Number of live elements; same consistency caveat as [`List::len`].
    ///
    /// [`List::len`]: struct.List.html#method.len
    pub fn len(&self) -> usize {
        self.buckets.iter().map(List::len).sum()
    }

    /// Returns `true` if no bucket holds an element.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(List::is_empty)
    }

    /// Removes every element, bucket by bucket; not atomic across buckets.
    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            bucket.clear();
        }
    }

    /// Iterates over all elements; requires exclusive access, like
    /// [`List::iter`].
    ///
    /// [`List::iter`]: struct.List.html#method.iter
    pub fn iter(&mut self) -> impl Iterator<Item = &T> + '_ {
        self.buckets
            .iter_mut()
            .flat_map(List::iter)
            .map(|(value, _)| value)
    }
}
