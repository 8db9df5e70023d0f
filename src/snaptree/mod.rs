//! See the documentation for [SnapTreeMap].

use std::borrow::Borrow;
use std::fmt::{self, Debug};
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{
    de::{Deserialize, Deserializer},
    ser::{Serialize, SerializeMap, Serializer},
};

#[cfg(feature = "serde")]
use crate::utils::MapCollector;

use crate::internals::cow::CowManager;
use crate::internals::snaptree::node::SnapRoot;
use crate::internals::snaptree::states::Dir;
use crate::internals::snaptree::cursor;

pub use crate::internals::snaptree::Iter;

/// A concurrently readable, ordered key-value map with O(1) snapshots.
///
/// The map is an AVL tree whose nodes carry an optimistic version word:
/// readers never lock, and validate the word instead of holding anything;
/// writers take short per-node locks around the minimal structural change.
/// Unlike a transactional map there is no write serialisation - any number
/// of threads may mutate concurrently, and contended writers scale by
/// locking disjoint parts of the tree.
///
/// [SnapTreeMap::clone] is O(1): it marks the current root as shared and
/// hands the same subtree to the new map. From then on each side copies
/// only the nodes it actually touches. `len` is likewise exact without a
/// tree scan, by folding each mutation's size delta through the root's
/// quiescence counter.
///
/// Keys must not change their ordering while in the map. Values are stored
/// behind a pointer and cloned out of reads; `V` may itself be an `Option`
/// with full fidelity - an absent key and a present `None` value are never
/// conflated.
///
/// # Examples
/// ```
/// use snapread::snaptree::SnapTreeMap;
///
/// let map: SnapTreeMap<u64, u64> = SnapTreeMap::new();
/// map.insert(1, 10);
/// map.insert(2, 20);
///
/// // An O(1) point-in-time clone.
/// let snap = map.clone();
/// map.remove(&1);
///
/// assert_eq!(map.get(&1), None);
/// assert_eq!(snap.get(&1), Some(10));
/// assert_eq!(snap.len(), 2);
/// ```
pub struct SnapTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: CowManager<SnapRoot<K, V>>,
}

impl<K, V> SnapTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Construct a new, empty map.
    pub fn new() -> Self {
        SnapTreeMap {
            inner: CowManager::new(SnapRoot::new(), 0),
        }
    }

    /// Retrieve the value for `k`, if present. Lock-free.
    pub fn get<Q>(&self, k: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = crossbeam_epoch::pin();
        let root = self.inner.read();
        unsafe { cursor::get_impl(root.holder(), k, &guard) }
    }

    /// True if `k` has a present value. Lock-free.
    pub fn contains_key<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.get(k).is_some()
    }

    /// Insert or overwrite, returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.update(&key, Some(&value), |_| true)
    }

    /// Insert only if `key` is absent. Returns the existing value when the
    /// insert did not happen.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V> {
        self.update(&key, Some(&value), |prev| prev.is_none())
    }

    /// Overwrite only if `key` is present, returning the previous value.
    pub fn replace(&self, key: &K, value: V) -> Option<V> {
        self.update(key, Some(&value), |prev| prev.is_some())
    }

    /// Overwrite only if the current value equals `expected`. True if the
    /// replacement happened.
    pub fn compare_and_replace(&self, key: &K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        let prev = self.update(key, Some(&value), |prev| prev == Some(expected));
        prev.as_ref() == Some(expected)
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.update(key, None, |_| true)
    }

    /// Remove only if the current value equals `expected`. True if the
    /// removal happened.
    pub fn compare_and_remove(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let prev = self.update(key, None, |prev| prev == Some(expected));
        prev.as_ref() == Some(expected)
    }

    /// All mutations funnel here: take a ticket against the current
    /// generation, run the locked update, and pair the ticket with the net
    /// size delta on the way out. An unwind inside the update releases the
    /// ticket with a zero delta instead.
    fn update<F>(&self, key: &K, new: Option<&V>, cond: F) -> Option<V>
    where
        F: Fn(Option<&V>) -> bool,
    {
        let guard = crossbeam_epoch::pin();
        let ticket = self.inner.begin_mutation();
        let (prev, delta) = unsafe { cursor::update_impl(ticket.value().holder(), key, new, &cond, &guard) };
        ticket.release(delta);
        prev
    }

    /// The number of present entries. Exact and linearizable: either a
    /// single read of the quiescence counter proves the sum, or the current
    /// generation is closed and its committed size returned.
    pub fn len(&self) -> usize {
        self.inner.size()
    }

    /// True when no entry is present. Decided by an optimistic in-order
    /// probe, without forcing a generation rollover.
    pub fn is_empty(&self) -> bool {
        self.first_key_value().is_none()
    }

    /// The least present key.
    pub fn first_key(&self) -> Option<K> {
        self.first_key_value().map(|(k, _)| k)
    }

    /// The least present entry. Lock-free.
    pub fn first_key_value(&self) -> Option<(K, V)> {
        let guard = crossbeam_epoch::pin();
        let root = self.inner.read();
        unsafe { cursor::extreme_impl(root.holder(), Dir::Left, &guard) }
    }

    /// The greatest present entry. Lock-free.
    pub fn last_key_value(&self) -> Option<(K, V)> {
        let guard = crossbeam_epoch::pin();
        let root = self.inner.read();
        unsafe { cursor::extreme_impl(root.holder(), Dir::Right, &guard) }
    }

    /// Remove and return the least entry, atomically with respect to other
    /// mutators.
    pub fn pop_first(&self) -> Option<(K, V)> {
        loop {
            let (k, _) = self.first_key_value()?;
            if let Some(v) = self.remove(&k) {
                return Some((k, v));
            }
            // Someone else removed it first; find the new minimum.
        }
    }

    /// Remove and return the greatest entry.
    pub fn pop_last(&self) -> Option<(K, V)> {
        loop {
            let (k, _) = self.last_key_value()?;
            if let Some(v) = self.remove(&k) {
                return Some((k, v));
            }
        }
    }

    /// An in-order iterator over a frozen snapshot captured now. Later
    /// mutation of the map is never visible through it.
    pub fn iter(&self) -> Iter<K, V> {
        let (snapshot, size) = self.inner.snapshot();
        Iter::new(snapshot, size)
    }

    /// Walk a quiesced snapshot of the tree, verifying key order, stored
    /// heights and the AVL balance bound.
    pub fn verify(&self) -> bool {
        self.snapshot_stats().0
    }

    pub(crate) fn snapshot_stats(&self) -> (bool, i32, usize) {
        let (snapshot, _) = self.inner.snapshot();
        unsafe { cursor::verify_impl(snapshot.holder()) }
    }

    fn snapshot_pair(&self) -> (Arc<SnapRoot<K, V>>, usize) {
        self.inner.snapshot()
    }
}

impl<K, V> Clone for SnapTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// An O(1) point-in-time snapshot. Neither map ever observes the
    /// other's subsequent mutations; shared subtrees are copied lazily as
    /// each side touches them.
    fn clone(&self) -> Self {
        let (frozen, size) = self.snapshot_pair();
        SnapTreeMap {
            inner: CowManager::new_from_frozen(frozen, size),
        }
    }
}

impl<K, V> Default for SnapTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        SnapTreeMap::new()
    }
}

impl<K, V> Debug for SnapTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + Debug + 'static,
    V: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for SnapTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = SnapTreeMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<K, V> Extend<(K, V)> for SnapTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl<'a, K, V> IntoIterator for &'a SnapTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Item = (K, V);
    type IntoIter = Iter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(feature = "serde")]
impl<K, V> Serialize for SnapTreeMap<K, V>
where
    K: Serialize + Ord + Clone + Send + Sync + 'static,
    V: Serialize + Clone + Send + Sync + 'static,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let entries: Vec<(K, V)> = self.iter().collect();
        let mut state = serializer.serialize_map(Some(entries.len()))?;
        for (key, val) in entries.iter() {
            state.serialize_entry(key, val)?;
        }
        state.end()
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> Deserialize<'de> for SnapTreeMap<K, V>
where
    K: Deserialize<'de> + Ord + Clone + Send + Sync + 'static,
    V: Deserialize<'de> + Clone + Send + Sync + 'static,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(MapCollector::new())
    }
}

#[cfg(test)]
mod tests {
    use super::SnapTreeMap;

    #[test]
    fn test_snaptree_map_basic_ops() {
        let map: SnapTreeMap<usize, usize> = SnapTreeMap::new();
        assert!(map.is_empty());
        assert_eq!(map.len(), 0);
        assert_eq!(map.insert(1, 10), None);
        assert_eq!(map.insert(2, 20), None);
        assert_eq!(map.insert(1, 11), Some(10));
        assert_eq!(map.get(&1), Some(11));
        assert_eq!(map.get(&2), Some(20));
        assert_eq!(map.get(&3), None);
        assert!(map.contains_key(&2));
        assert_eq!(map.len(), 2);
        assert_eq!(map.remove(&1), Some(11));
        assert_eq!(map.remove(&1), None);
        assert_eq!(map.len(), 1);
        assert!(map.verify());
    }

    #[test]
    fn test_snaptree_map_conditional_ops() {
        let map: SnapTreeMap<usize, usize> = SnapTreeMap::new();
        assert_eq!(map.insert_if_absent(1, 10), None);
        assert_eq!(map.insert_if_absent(1, 99), Some(10));
        assert_eq!(map.get(&1), Some(10));

        assert_eq!(map.replace(&2, 20), None);
        assert!(!map.contains_key(&2));
        assert_eq!(map.replace(&1, 11), Some(10));

        assert!(!map.compare_and_replace(&1, &10, 12));
        assert!(map.compare_and_replace(&1, &11, 12));
        assert_eq!(map.get(&1), Some(12));

        assert!(!map.compare_and_remove(&1, &11));
        assert!(map.contains_key(&1));
        assert!(map.compare_and_remove(&1, &12));
        assert!(!map.contains_key(&1));
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_snaptree_map_interior_remove() {
        // Removing a node with two children leaves a tombstone; the key
        // must read as absent and the count must drop.
        let map: SnapTreeMap<usize, usize> = SnapTreeMap::new();
        for i in 0..7 {
            map.insert(i, i);
        }
        // 3 is an interior node in the balanced tree over 0..7.
        assert_eq!(map.remove(&3), Some(3));
        assert_eq!(map.get(&3), None);
        assert_eq!(map.len(), 6);
        for i in (0..7).filter(|i| *i != 3) {
            assert_eq!(map.get(&i), Some(i));
        }
        assert!(map.verify());
        // Reinsert lands on the tombstone.
        assert_eq!(map.insert(3, 33), None);
        assert_eq!(map.get(&3), Some(33));
        assert_eq!(map.len(), 7);
        assert!(map.verify());
    }

    #[test]
    fn test_snaptree_map_sequential_insert_stays_balanced() {
        // Ascending inserts are the worst case for a naive BST; the AVL
        // repair must keep the height logarithmic.
        let map: SnapTreeMap<u32, u32> = SnapTreeMap::new();
        for i in 1..=31 {
            map.insert(i, i);
        }
        let (ok, height, count) = map.snapshot_stats();
        assert!(ok);
        assert_eq!(count, 31);
        // ceil(log2(32)) + 1
        assert!(height <= 6, "height {} exceeds AVL bound", height);
        for i in 1..=31 {
            assert_eq!(map.get(&i), Some(i));
        }
    }

    #[test]
    fn test_snaptree_map_descending_insert_stays_balanced() {
        let map: SnapTreeMap<u32, u32> = SnapTreeMap::new();
        for i in (1..=64).rev() {
            map.insert(i, i);
        }
        let (ok, height, count) = map.snapshot_stats();
        assert!(ok);
        assert_eq!(count, 64);
        assert!(height <= 9, "height {} exceeds AVL bound", height);
    }

    #[test]
    fn test_snaptree_map_option_value_round_trip() {
        // A present None value is never conflated with an absent key.
        let map: SnapTreeMap<usize, Option<i32>> = SnapTreeMap::new();
        assert_eq!(map.insert(1, None), None);
        assert!(map.contains_key(&1));
        assert_eq!(map.get(&1), Some(None));
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove(&1), Some(None));
        assert!(!map.contains_key(&1));
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_snaptree_map_clone_isolation() {
        let map: SnapTreeMap<usize, usize> = SnapTreeMap::new();
        for i in 0..100 {
            map.insert(i, i);
        }
        let snap = map.clone();
        for i in 0..100 {
            map.remove(&i);
        }
        map.insert(500, 500);
        assert_eq!(map.len(), 1);
        assert_eq!(snap.len(), 100);
        for i in 0..100 {
            assert_eq!(snap.get(&i), Some(i));
        }
        assert!(!snap.contains_key(&500));
        assert!(map.verify());
        assert!(snap.verify());
    }

    #[test]
    fn test_snaptree_map_clone_is_independent_both_ways() {
        let map: SnapTreeMap<usize, usize> = SnapTreeMap::new();
        for i in 0..50 {
            map.insert(i, i);
        }
        let snap = map.clone();
        // Mutating the clone is invisible to the original too.
        for i in 0..50 {
            snap.insert(i, i + 1000);
        }
        snap.insert(99, 99);
        for i in 0..50 {
            assert_eq!(map.get(&i), Some(i));
            assert_eq!(snap.get(&i), Some(i + 1000));
        }
        assert!(!map.contains_key(&99));
        assert!(map.verify());
        assert!(snap.verify());
    }

    #[test]
    fn test_snaptree_map_extremes_and_pop() {
        let map: SnapTreeMap<i32, i32> = SnapTreeMap::new();
        assert_eq!(map.first_key_value(), None);
        assert_eq!(map.pop_first(), None);
        for i in [5, 1, 9, 3, 7] {
            map.insert(i, i * 10);
        }
        assert_eq!(map.first_key(), Some(1));
        assert_eq!(map.first_key_value(), Some((1, 10)));
        assert_eq!(map.last_key_value(), Some((9, 90)));
        // A tombstoned minimum is skipped.
        map.remove(&1);
        assert_eq!(map.first_key_value(), Some((3, 30)));
        assert_eq!(map.pop_first(), Some((3, 30)));
        assert_eq!(map.pop_last(), Some((9, 90)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_snaptree_map_iter_in_order() {
        let map: SnapTreeMap<usize, usize> = SnapTreeMap::new();
        for i in [8, 3, 5, 1, 9, 2, 7, 0, 6, 4] {
            map.insert(i, i * 2);
        }
        map.remove(&5);
        let entries: Vec<_> = map.iter().collect();
        let expect: Vec<_> = (0..10).filter(|i| *i != 5).map(|i| (i, i * 2)).collect();
        assert_eq!(entries, expect);
        let it = map.iter();
        assert_eq!(it.len(), 9);
    }

    #[test]
    fn test_snaptree_map_iter_is_a_snapshot() {
        let map: SnapTreeMap<usize, usize> = SnapTreeMap::new();
        for i in 0..10 {
            map.insert(i, i);
        }
        let it = map.iter();
        for i in 0..10 {
            map.remove(&i);
        }
        assert_eq!(it.count(), 10);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_snaptree_map_from_iter() {
        let map: SnapTreeMap<usize, usize> = (0..64).map(|i| (i, i)).collect();
        assert_eq!(map.len(), 64);
        assert!(map.verify());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_snaptree_map_serialize_deserialize() {
        let map: SnapTreeMap<usize, usize> = vec![(10, 11), (15, 16), (20, 21)].into_iter().collect();

        let value = serde_json::to_value(&map).unwrap();
        assert_eq!(value, serde_json::json!({ "10": 11, "15": 16, "20": 21 }));

        let map: SnapTreeMap<usize, usize> = serde_json::from_value(value).unwrap();
        let vec: Vec<(usize, usize)> = map.iter().collect();
        assert_eq!(vec, [(10, 11), (15, 16), (20, 21)]);
    }
}
