//! A lock-free hash map.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use crate::hazard::Domain;
use crate::list::List;

/// Default number of buckets.
const DEFAULT_BUCKETS: usize = 256;

/// A lock-free hash map sharding a sorted list per bucket.
///
/// The bucket array is sized at construction and never grows; pick a
/// capacity in the region of the expected element count so chains stay
/// short. All buckets share one hazard-pointer [`Domain`].
///
/// Lookups hand entries to a visitor instead of returning references,
/// because an entry is only guaranteed alive while the internal traversal
/// protects it.
///
/// # Examples
///
/// ```
/// use quiesce::HashMap;
///
/// let map = HashMap::new();
/// assert!(map.insert("k", 1));
/// assert!(map.find(&"k", |_, v| assert_eq!(*v, 1)));
/// assert!(map.remove(&"k"));
/// assert!(map.is_empty());
/// ```
///
/// [`Domain`]: struct.Domain.html
pub struct HashMap<K, V, S = RandomState> {
    buckets: Box<[List<K, V>]>,
    hasher: S,
    mask: usize,
}

impl<K, V> HashMap<K, V, RandomState>
where
    K: Ord + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a map with the default bucket count.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUCKETS)
    }

    /// Creates a map with at least `buckets` buckets (rounded up to a power
    /// of two).
    pub fn with_capacity(buckets: usize) -> Self {
        Self::with_capacity_and_hasher(buckets, RandomState::new())
    }
}

impl<K, V> Default for HashMap<K, V, RandomState>
where
    K: Ord + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        HashMap::new()
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Ord + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    /// Creates a map with at least `buckets` buckets and the given hasher.
    pub fn with_capacity_and_hasher(buckets: usize, hasher: S) -> Self {
        let len = buckets.next_power_of_two();
        let domain = Arc::new(Domain::new());
        let buckets: Vec<List<K, V>> = (0..len)
            .map(|_| List::with_domain(domain.clone()))
            .collect();
        HashMap {
            mask: len - 1,
            buckets: buckets.into_boxed_slice(),
            hasher,
        }
    }

    fn bucket<Q>(&self, key: &Q) -> &List<K, V>
    where
        Q: Hash + ?Sized,
    {
        let mut state = self.hasher.build_hasher();
        key.hash(&mut state);
        &self.buckets[(state.finish() as usize) & self.mask]
    }

    /// Inserts `key` → `value` if the key is absent.
    ///
    /// Returns `true` on success; on a duplicate key nothing is mutated and
    /// the value is dropped.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.bucket(&key).insert(key, value)
    }

    /// Inserts `key`, building the value only once the key is known to be
    /// absent.
    ///
    /// Spares the construction of an expensive value on the duplicate-key
    /// path. A racing insert of the same key can still win between the
    /// check and the link, in which case the freshly built value is dropped
    /// and `false` is returned, same as [`insert`].
    ///
    /// [`insert`]: struct.HashMap.html#method.insert
    pub fn insert_with<F>(&self, key: K, make: F) -> bool
    where
        F: FnOnce() -> V,
    {
        let bucket = self.bucket(&key);
        if bucket.contains(&key) {
            return false;
        }
        let value = make();
        bucket.insert(key, value)
    }

    /// Inserts `key` → `value`, or visits the existing entry if present.
    ///
    /// Returns `true` if a new entry was inserted; the visitor's first
    /// argument says which case it is seeing.
    pub fn ensure<F>(&self, key: K, value: V, visit: F) -> bool
    where
        F: FnOnce(bool, &K, &V),
    {
        self.bucket(&key).ensure(key, value, visit)
    }

    /// Looks up `key` and visits the entry while it is protected.
    pub fn find<Q, F>(&self, key: &Q, visit: F) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
        F: FnOnce(&K, &V),
    {
        self.bucket(key).find(key, visit)
    }

    /// Returns `true` if `key` has a live entry.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
    {
        self.bucket(key).contains(key)
    }

    /// Removes the entry for `key`, if any.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
    {
        self.bucket(key).erase(key)
    }

    /// Removes the entry for `key`, visiting it after the removal won.
    pub fn remove_with<Q, F>(&self, key: &Q, visit: F) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + Hash + ?Sized,
        F: FnOnce(&K, &V),
    {
        self.bucket(key).erase_with(key, visit)
    }

    /// Number of live entries, summed over the buckets.
    ///
    /// Same consistency caveat as [`List::len`].
    ///
    /// [`List::len`]: struct.List.html#method.len
    pub fn len(&self) -> usize {
        self.buckets.iter().map(List::len).sum()
    }

    /// Returns `true` if no bucket holds an entry.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(List::is_empty)
    }

    /// Removes every entry, bucket by bucket.
    ///
    /// Not atomic across buckets; meant for teardown.
    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            bucket.clear();
        }
    }

    /// Iterates over all entries; requires exclusive access, like
    /// [`List::iter`]. Entries come out grouped by bucket, sorted by key
    /// within each.
    ///
    /// [`List::iter`]: struct.List.html#method.iter
    pub fn iter(&mut self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.buckets.iter_mut().flat_map(List::iter)
    }
}
