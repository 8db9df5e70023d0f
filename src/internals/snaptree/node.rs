//! Tree nodes, their optimistic version words, and the ownership layer.
//!
//! Nodes are raw heap allocations linked by atomic pointers. Readers never
//! lock; they validate a node's version word instead. Writers take the
//! per-node mutex, and only ever on nodes they own - a node belonging to a
//! frozen generation is tagged shared and must be lazily copied before any
//! in-place edit.
//!
//! Reclamation is two layered. Ownership (which trees still reach a node)
//! is an explicit per-node count, because frozen snapshots share subtrees.
//! The actual free is deferred through crossbeam's epoch collector, because
//! an optimistic reader may still be dereferencing a node that has just
//! been unlinked.

use crossbeam_epoch::Guard;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use super::states::Dir;
use crate::internals::cow::SnapCapable;

/// Version word: stable versions are even. An odd word means the node's
/// subtree is shrinking and readers must wait; the all-ones word is the
/// terminal state of a physically unlinked node.
pub(crate) const OVL_SHRINK: u64 = 1;
pub(crate) const OVL_UNLINKED: u64 = u64::MAX;

/// Bounded spin before a reader blocked on a shrink yields, then sleeps on
/// the shrinker's own lock.
const SPIN_COUNT: usize = 100;

#[inline]
pub(crate) fn is_shrinking(ovl: u64) -> bool {
    ovl & OVL_SHRINK != 0 && ovl != OVL_UNLINKED
}

pub(crate) struct Node<K, V> {
    /// The optimistic version/lock word.
    version: AtomicU64,
    height: AtomicI32,
    /// How many parent edges (across live and frozen trees) reach this node.
    owners: AtomicUsize,
    /// Owned-by-generation / shared tag. Kept apart from the parent link so
    /// "no parent" and "frozen" can never be conflated.
    shared: AtomicBool,
    /// `None` only on the root sentinel.
    key: Option<K>,
    /// Null is a tombstone: logically removed, retained for routing.
    value: AtomicPtr<V>,
    /// Meaningful only while the node is owned by a live tree. Never used
    /// for traversal of a frozen snapshot.
    parent: AtomicPtr<Node<K, V>>,
    left: AtomicPtr<Node<K, V>>,
    right: AtomicPtr<Node<K, V>>,
    pub(crate) lock: Mutex<()>,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for Node<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Node<K, V> {}

fn alloc_value<V>(v: V) -> *mut V {
    Box::into_raw(Box::new(v))
}

unsafe fn free_value_deferred<V>(p: *mut V, guard: &Guard) {
    if !p.is_null() {
        guard.defer_unchecked(move || drop(Box::from_raw(p)));
    }
}

impl<K, V> Node<K, V> {
    fn alloc(node: Node<K, V>) -> *mut Node<K, V> {
        let x: Box<CachePadded<Node<K, V>>> = Box::new(CachePadded::new(node));
        Box::into_raw(x) as *mut Node<K, V>
    }

    pub(crate) fn new_leaf(key: K, value: V, parent: *mut Node<K, V>) -> *mut Node<K, V> {
        Node::alloc(Node {
            version: AtomicU64::new(0),
            height: AtomicI32::new(1),
            owners: AtomicUsize::new(1),
            shared: AtomicBool::new(false),
            key: Some(key),
            value: AtomicPtr::new(alloc_value(value)),
            parent: AtomicPtr::new(parent),
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
            lock: Mutex::new(()),
        })
    }

    /// The permanent non-data sentinel; its right child is the real root.
    pub(crate) fn new_sentinel(right: *mut Node<K, V>) -> *mut Node<K, V> {
        Node::alloc(Node {
            version: AtomicU64::new(0),
            height: AtomicI32::new(0),
            owners: AtomicUsize::new(1),
            shared: AtomicBool::new(false),
            key: None,
            value: AtomicPtr::new(ptr::null_mut()),
            parent: AtomicPtr::new(ptr::null_mut()),
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(right),
            lock: Mutex::new(()),
        })
    }

    #[inline]
    pub(crate) fn is_sentinel(&self) -> bool {
        self.key.is_none()
    }

    #[inline]
    pub(crate) fn key_ref(&self) -> &K {
        self.key.as_ref().expect("data node without a key")
    }

    #[inline]
    pub(crate) fn child(&self, dir: Dir) -> &AtomicPtr<Node<K, V>> {
        match dir {
            Dir::Left => &self.left,
            Dir::Right => &self.right,
        }
    }

    #[inline]
    pub(crate) fn left_ptr(&self) -> *mut Node<K, V> {
        self.left.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn right_ptr(&self) -> *mut Node<K, V> {
        self.right.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn parent_ptr(&self) -> *mut Node<K, V> {
        self.parent.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_parent(&self, p: *mut Node<K, V>) {
        self.parent.store(p, Ordering::Release);
    }

    #[inline]
    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_unlinked(&self) -> bool {
        self.version() == OVL_UNLINKED
    }

    #[inline]
    pub(crate) fn height(&self) -> i32 {
        self.height.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_height(&self, h: i32) {
        self.height.store(h, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    /// Mark this node (and by lazy propagation, its subtree) as belonging
    /// to a frozen generation.
    #[inline]
    pub(crate) fn mark_shared(&self) {
        self.shared.store(true, Ordering::Release);
    }

    /// Begin a structural change: readers that snapshot the word now will
    /// wait. Only the lock holder may call this.
    #[inline]
    pub(crate) fn begin_shrink(&self, ovl: u64) {
        debug_assert!(ovl & OVL_SHRINK == 0);
        self.version.store(ovl | OVL_SHRINK, Ordering::Release);
    }

    /// End the change, advancing to the next stable (even) version.
    #[inline]
    pub(crate) fn end_shrink(&self, ovl: u64) {
        self.version.store(ovl.wrapping_add(2), Ordering::Release);
    }

    #[inline]
    pub(crate) fn mark_unlinked(&self) {
        self.version.store(OVL_UNLINKED, Ordering::Release);
    }

    /// Wait out a shrink observed as `ovl`: bounded spin, one yield, then
    /// block on the shrinker's lock as a last resort.
    pub(crate) fn wait_until_shrink_completed(&self, ovl: u64) {
        if !is_shrinking(ovl) {
            return;
        }
        for _ in 0..SPIN_COUNT {
            if self.version() != ovl {
                return;
            }
            core::hint::spin_loop();
        }
        std::thread::yield_now();
        if self.version() != ovl {
            return;
        }
        // The shrinker still holds our lock; sleeping on it is the wakeup.
        drop(self.lock.lock());
        debug_assert!(self.version() != ovl);
    }

    #[inline]
    pub(crate) fn value_ptr(&self) -> *mut V {
        self.value.load(Ordering::Acquire)
    }

    /// Read the value slot. `None` is a tombstone. The caller must be
    /// pinned; a racing replace defers the old allocation past our guard.
    pub(crate) fn read_value(&self, _guard: &Guard) -> Option<V>
    where
        V: Clone,
    {
        let p = self.value_ptr();
        if p.is_null() {
            None
        } else {
            Some(unsafe { (*p).clone() })
        }
    }

    /// Swap the value slot under the node lock, deferring the old
    /// allocation.
    pub(crate) unsafe fn store_value(&self, v: Option<&V>, guard: &Guard)
    where
        V: Clone,
    {
        let new = match v {
            Some(v) => alloc_value(v.clone()),
            None => ptr::null_mut(),
        };
        let old = self.value.swap(new, Ordering::AcqRel);
        free_value_deferred(old, guard);
    }

    /// One more parent edge references this node.
    #[inline]
    pub(crate) fn retain(&self) {
        self.owners.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one parent edge. When the last edge goes, the node's own child
    /// edges are released in turn and the memory is deferred to the epoch
    /// collector - an optimistic reader may still be walking it.
    pub(crate) unsafe fn release(node: *mut Node<K, V>, guard: &Guard) {
        let mut work: SmallVec<[*mut Node<K, V>; 16]> = SmallVec::new();
        work.push(node);
        while let Some(p) = work.pop() {
            if p.is_null() {
                continue;
            }
            let n = &*p;
            if n.owners.fetch_sub(1, Ordering::Release) != 1 {
                continue;
            }
            fence(Ordering::Acquire);
            work.push(n.left.load(Ordering::Acquire));
            work.push(n.right.load(Ordering::Acquire));
            guard.defer_unchecked(move || {
                drop(Box::from_raw(p as *mut CachePadded<Node<K, V>>));
            });
        }
    }
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        let p = *self.value.get_mut();
        if !p.is_null() {
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

impl<K: Clone, V: Clone> Node<K, V> {
    /// Copy a shared node so the caller's tree owns it. The caller holds
    /// the (unshared) parent's lock and has re-validated the child link.
    /// The copy's children are marked shared in turn - this is what makes
    /// copy-on-write subtree granular rather than whole tree.
    pub(crate) unsafe fn lazy_copy(&self, parent: *mut Node<K, V>) -> *mut Node<K, V> {
        debug_assert!(self.is_shared());
        let l = self.left.load(Ordering::Acquire);
        let r = self.right.load(Ordering::Acquire);
        if !l.is_null() {
            (*l).mark_shared();
            (*l).retain();
        }
        if !r.is_null() {
            (*r).mark_shared();
            (*r).retain();
        }
        let vp = self.value_ptr();
        let value = if vp.is_null() {
            ptr::null_mut()
        } else {
            alloc_value((*vp).clone())
        };
        Node::alloc(Node {
            version: AtomicU64::new(0),
            height: AtomicI32::new(self.height()),
            owners: AtomicUsize::new(1),
            shared: AtomicBool::new(false),
            key: self.key.clone(),
            value: AtomicPtr::new(value),
            parent: AtomicPtr::new(parent),
            left: AtomicPtr::new(l),
            right: AtomicPtr::new(r),
            lock: Mutex::new(()),
        })
    }
}

#[inline]
pub(crate) fn height_of<K, V>(p: *mut Node<K, V>) -> i32 {
    if p.is_null() {
        0
    } else {
        unsafe { (*p).height() }
    }
}

/// The root holder: a sentinel node whose right child is the real root,
/// plus the freeze seam the generation manager drives.
pub(crate) struct SnapRoot<K, V> {
    holder: *mut Node<K, V>,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for SnapRoot<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SnapRoot<K, V> {}

impl<K, V> SnapRoot<K, V> {
    pub(crate) fn new() -> Self {
        SnapRoot {
            holder: Node::new_sentinel(ptr::null_mut()),
        }
    }

    #[inline]
    pub(crate) fn holder(&self) -> &Node<K, V> {
        unsafe { &*self.holder }
    }
}

impl<K: Send + Sync, V: Send + Sync> SnapCapable for SnapRoot<K, V> {
    /// The O(1) snapshot: tag the visible root as shared and hand the same
    /// subtree to a fresh sentinel. Runs only at a quiescence point, so no
    /// mutation is in flight; concurrent readers are unaffected by the tag.
    fn freeze_and_clone(&self) -> Self {
        let r = self.holder().right_ptr();
        if !r.is_null() {
            let root = unsafe { &*r };
            root.mark_shared();
            root.retain();
        }
        SnapRoot {
            holder: Node::new_sentinel(r),
        }
    }
}

impl<K, V> Drop for SnapRoot<K, V> {
    fn drop(&mut self) {
        let guard = crossbeam_epoch::pin();
        unsafe { Node::release(self.holder, &guard) };
    }
}
