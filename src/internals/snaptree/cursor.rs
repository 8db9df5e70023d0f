//! The tree walks: optimistic search, locked update, and AVL repair.
//!
//! Every descent step snapshots the child's version word before following
//! the link and re-validates the parent's word afterwards. A failed
//! validation unwinds exactly one level ([Attempt::Retry]) - the parent
//! re-validates itself and redoes the step, never the whole walk.
//!
//! Writers additionally descend through [unshared_child], so that by the
//! time a lock is taken the node is owned by the live generation. Locks are
//! only ever taken parent before child.

use crossbeam_epoch::Guard;
use std::borrow::Borrow;
use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::Ordering;

use super::node::{height_of, is_shrinking, Node, OVL_UNLINKED};
use super::states::{Attempt, Dir};

const UNLINK_REQUIRED: i32 = -1;
const REBALANCE_REQUIRED: i32 = -2;
const NOTHING_REQUIRED: i32 = -3;

#[inline]
fn as_mut_ptr<K, V>(n: &Node<K, V>) -> *mut Node<K, V> {
    n as *const Node<K, V> as *mut Node<K, V>
}

// ===== search ==============================================================

/// Lock-free point lookup beneath the root holder.
pub(crate) unsafe fn get_impl<K, V, Q>(holder: &Node<K, V>, k: &Q, guard: &Guard) -> Option<V>
where
    K: Borrow<Q> + Ord + Clone,
    Q: Ord + ?Sized,
    V: Clone,
{
    loop {
        let right = holder.right_ptr();
        if right.is_null() {
            return None;
        }
        let r = &*right;
        let rv = r.version();
        if is_shrinking(rv) {
            r.wait_until_shrink_completed(rv);
            continue;
        }
        if rv == OVL_UNLINKED || holder.right_ptr() != right {
            continue;
        }
        match attempt_get(k, r, rv, guard) {
            Attempt::Done(x) => return x,
            Attempt::Retry => continue,
        }
    }
}

unsafe fn attempt_get<K, V, Q>(
    k: &Q,
    node: &Node<K, V>,
    node_v: u64,
    guard: &Guard,
) -> Attempt<Option<V>>
where
    K: Borrow<Q> + Ord + Clone,
    Q: Ord + ?Sized,
    V: Clone,
{
    loop {
        let dir = match k.cmp(node.key_ref().borrow()) {
            CmpOrdering::Equal => return Attempt::Done(node.read_value(guard)),
            CmpOrdering::Less => Dir::Left,
            CmpOrdering::Greater => Dir::Right,
        };
        let child = node.child(dir).load(Ordering::Acquire);
        if child.is_null() {
            if node.version() != node_v {
                return Attempt::Retry;
            }
            return Attempt::Done(None);
        }
        let c = &*child;
        let cv = c.version();
        if is_shrinking(cv) {
            c.wait_until_shrink_completed(cv);
            if node.version() != node_v {
                return Attempt::Retry;
            }
            continue;
        }
        if cv == OVL_UNLINKED || node.child(dir).load(Ordering::Acquire) != child {
            if node.version() != node_v {
                return Attempt::Retry;
            }
            continue;
        }
        if node.version() != node_v {
            return Attempt::Retry;
        }
        match attempt_get(k, c, cv, guard) {
            Attempt::Done(x) => return Attempt::Done(x),
            Attempt::Retry => {
                if node.version() != node_v {
                    return Attempt::Retry;
                }
                continue;
            }
        }
    }
}

// ===== copy-on-write ======================================================

/// Fetch a child for writing, lazily copying it under the parent's lock if
/// it belongs to a frozen generation. `Retry` means the parent was unlinked
/// while we held its lock request.
unsafe fn unshared_child<K, V>(
    parent: &Node<K, V>,
    dir: Dir,
    guard: &Guard,
) -> Attempt<*mut Node<K, V>>
where
    K: Clone,
    V: Clone,
{
    let c = parent.child(dir).load(Ordering::Acquire);
    if c.is_null() || !(*c).is_shared() {
        return Attempt::Done(c);
    }
    let _lk = parent.lock.lock();
    if parent.is_unlinked() {
        return Attempt::Retry;
    }
    Attempt::Done(unshared_child_nl(parent, dir, guard))
}

/// As [unshared_child], with the parent's lock already held and the parent
/// known live.
unsafe fn unshared_child_nl<K, V>(
    parent: &Node<K, V>,
    dir: Dir,
    guard: &Guard,
) -> *mut Node<K, V>
where
    K: Clone,
    V: Clone,
{
    let c = parent.child(dir).load(Ordering::Acquire);
    if c.is_null() || !(*c).is_shared() {
        return c;
    }
    let copy = (*c).lazy_copy(as_mut_ptr(parent));
    parent.child(dir).store(copy, Ordering::Release);
    // The parent's edge moved onto the copy; the original stays owned by
    // whichever frozen generation marked it.
    Node::release(c, guard);
    copy
}

// ===== update =============================================================

/// The single mutation entry point: `new` of `None` removes, `Some`
/// inserts or replaces, and `cond` judges the previous value (absent as
/// `None`) before anything is changed. Returns the previous value and the
/// net element-count delta.
pub(crate) unsafe fn update_impl<K, V, F>(
    holder: &Node<K, V>,
    key: &K,
    new: Option<&V>,
    cond: &F,
    guard: &Guard,
) -> (Option<V>, i64)
where
    K: Ord + Clone,
    V: Clone,
    F: Fn(Option<&V>) -> bool,
{
    loop {
        let right = match unshared_child(holder, Dir::Right, guard) {
            Attempt::Done(p) => p,
            // The holder is permanent; it can never be unlinked.
            Attempt::Retry => continue,
        };
        if right.is_null() {
            if new.is_none() || !cond(None) {
                return (None, 0);
            }
            {
                let _lk = holder.lock.lock();
                if holder.right_ptr().is_null() {
                    let v = new.expect("insert without a value");
                    let leaf = Node::new_leaf(key.clone(), v.clone(), as_mut_ptr(holder));
                    holder.child(Dir::Right).store(leaf, Ordering::Release);
                    return (None, 1);
                }
            }
            continue;
        }
        let r = &*right;
        let rv = r.version();
        if is_shrinking(rv) {
            r.wait_until_shrink_completed(rv);
            continue;
        }
        if rv == OVL_UNLINKED || holder.right_ptr() != right {
            continue;
        }
        match attempt_update(key, new, cond, holder, r, rv, guard) {
            Attempt::Done(x) => return x,
            Attempt::Retry => continue,
        }
    }
}

unsafe fn attempt_update<K, V, F>(
    key: &K,
    new: Option<&V>,
    cond: &F,
    parent: &Node<K, V>,
    node: &Node<K, V>,
    node_v: u64,
    guard: &Guard,
) -> Attempt<(Option<V>, i64)>
where
    K: Ord + Clone,
    V: Clone,
    F: Fn(Option<&V>) -> bool,
{
    debug_assert!(!node.is_shared());
    loop {
        let dir = match key.cmp(node.key_ref()) {
            CmpOrdering::Equal => return attempt_node_update(new, cond, parent, node, guard),
            CmpOrdering::Less => Dir::Left,
            CmpOrdering::Greater => Dir::Right,
        };
        let child = match unshared_child(node, dir, guard) {
            Attempt::Done(c) => c,
            Attempt::Retry => return Attempt::Retry,
        };
        if node.version() != node_v {
            return Attempt::Retry;
        }
        if child.is_null() {
            if new.is_none() || !cond(None) {
                return Attempt::Done((None, 0));
            }
            {
                let _lk = node.lock.lock();
                if node.version() != node_v {
                    return Attempt::Retry;
                }
                if !node.child(dir).load(Ordering::Acquire).is_null() {
                    // A concurrent insert landed first; redo the step.
                    continue;
                }
                let v = new.expect("insert without a value");
                let leaf = Node::new_leaf(key.clone(), v.clone(), as_mut_ptr(node));
                node.child(dir).store(leaf, Ordering::Release);
            }
            fix_height_and_rebalance(as_mut_ptr(node), guard);
            return Attempt::Done((None, 1));
        }
        let c = &*child;
        let cv = c.version();
        if is_shrinking(cv) {
            c.wait_until_shrink_completed(cv);
            if node.version() != node_v {
                return Attempt::Retry;
            }
            continue;
        }
        if cv == OVL_UNLINKED || node.child(dir).load(Ordering::Acquire) != child {
            if node.version() != node_v {
                return Attempt::Retry;
            }
            continue;
        }
        if node.version() != node_v {
            return Attempt::Retry;
        }
        match attempt_update(key, new, cond, node, c, cv, guard) {
            Attempt::Done(x) => return Attempt::Done(x),
            Attempt::Retry => {
                if node.version() != node_v {
                    return Attempt::Retry;
                }
                continue;
            }
        }
    }
}

/// The key matched `node`. Decide between a value swap, a tombstone, and a
/// physical unlink, taking the minimal set of locks for each.
unsafe fn attempt_node_update<K, V, F>(
    new: Option<&V>,
    cond: &F,
    parent: &Node<K, V>,
    node: &Node<K, V>,
    guard: &Guard,
) -> Attempt<(Option<V>, i64)>
where
    K: Ord + Clone,
    V: Clone,
    F: Fn(Option<&V>) -> bool,
{
    if new.is_none() && node.value_ptr().is_null() {
        // Removing what is already logically gone.
        return Attempt::Done((None, 0));
    }
    if new.is_none() && (node.left_ptr().is_null() || node.right_ptr().is_null()) {
        // Removal that can physically unlink: parent before node.
        let prev;
        let mut unlinked = false;
        {
            let _pl = parent.lock.lock();
            if parent.is_unlinked() || node.parent_ptr() != as_mut_ptr(parent) {
                return Attempt::Retry;
            }
            let _nl = node.lock.lock();
            prev = match node.read_value(guard) {
                Some(v) => v,
                // A concurrent removal won while we were locking.
                None => return Attempt::Done((None, 0)),
            };
            debug_assert!(!node.is_unlinked());
            if !cond(Some(&prev)) {
                return Attempt::Done((Some(prev), 0));
            }
            if attempt_unlink_nl(parent, node, guard) {
                unlinked = true;
            } else {
                // Grew a second child since we looked; tombstone in place.
                node.store_value(None, guard);
            }
        }
        if unlinked {
            fix_height_and_rebalance(as_mut_ptr(parent), guard);
        }
        return Attempt::Done((Some(prev), -1));
    }
    // Value-only change: the node lock is enough.
    let _nl = node.lock.lock();
    if node.is_unlinked() {
        return Attempt::Retry;
    }
    if new.is_none() && (node.left_ptr().is_null() || node.right_ptr().is_null()) {
        // Lost a child since we looked; removal must retake the parent path.
        return Attempt::Retry;
    }
    let prev = node.read_value(guard);
    if !cond(prev.as_ref()) {
        return Attempt::Done((prev, 0));
    }
    let delta = match (&prev, new) {
        (None, Some(_)) => 1,
        (Some(_), None) => -1,
        _ => 0,
    };
    node.store_value(new, guard);
    Attempt::Done((prev, delta))
}

/// Splice `node` out from under `parent`. Both locks held; fails if the
/// links moved or a second child appeared.
unsafe fn attempt_unlink_nl<K, V>(parent: &Node<K, V>, node: &Node<K, V>, guard: &Guard) -> bool
where
    V: Clone,
{
    let node_ptr = as_mut_ptr(node);
    let pl = parent.left_ptr();
    let pr = parent.right_ptr();
    if pl != node_ptr && pr != node_ptr {
        return false;
    }
    let l = node.left_ptr();
    let r = node.right_ptr();
    if !l.is_null() && !r.is_null() {
        return false;
    }
    let splice = if !l.is_null() { l } else { r };
    if !splice.is_null() {
        (*splice).retain();
        (*splice).set_parent(as_mut_ptr(parent));
    }
    if pl == node_ptr {
        parent.child(Dir::Left).store(splice, Ordering::Release);
    } else {
        parent.child(Dir::Right).store(splice, Ordering::Release);
    }
    node.mark_unlinked();
    node.store_value(None, guard);
    // The parent's edge is gone; the node is retained only while a frozen
    // generation still reaches it, and readers keep the memory through
    // their epoch pins.
    Node::release(node_ptr, guard);
    true
}

// ===== rebalancing ========================================================

/// What, if anything, `node` needs: a pending unlink, a rotation, a new
/// height (returned as the value), or nothing.
unsafe fn node_condition<K, V>(n: &Node<K, V>) -> i32 {
    if n.is_sentinel() {
        return NOTHING_REQUIRED;
    }
    let nl = n.left_ptr();
    let nr = n.right_ptr();
    if (nl.is_null() || nr.is_null()) && n.value_ptr().is_null() {
        return UNLINK_REQUIRED;
    }
    let hn = n.height();
    let hl = height_of(nl);
    let hr = height_of(nr);
    if hl - hr > 1 || hr - hl > 1 {
        return REBALANCE_REQUIRED;
    }
    let repl = 1 + hl.max(hr);
    if hn != repl {
        repl
    } else {
        NOTHING_REQUIRED
    }
}

/// Repair heights and balance from `node` up the parent chain until a node
/// needs nothing. Retries internally on racing structural changes.
pub(crate) unsafe fn fix_height_and_rebalance<K, V>(mut node: *mut Node<K, V>, guard: &Guard)
where
    K: Ord + Clone,
    V: Clone,
{
    while !node.is_null() {
        let n = &*node;
        if n.is_sentinel() {
            return;
        }
        let condition = node_condition(n);
        if condition == NOTHING_REQUIRED || n.is_unlinked() {
            return;
        }
        if condition != UNLINK_REQUIRED && condition != REBALANCE_REQUIRED {
            let _lk = n.lock.lock();
            node = fix_height_nl(n);
        } else {
            let pp = n.parent_ptr();
            if pp.is_null() {
                return;
            }
            let p = &*pp;
            let _pl = p.lock.lock();
            if !p.is_unlinked() && n.parent_ptr() == pp {
                let _nl = n.lock.lock();
                node = rebalance_nl(p, n, guard);
            }
            // Otherwise the links moved; loop with fresh reads.
        }
    }
}

/// Height-only repair under the node's lock. Returns the next node to
/// examine: the parent on progress, the node itself if it turned out to
/// need the parent-locked path, null when settled.
unsafe fn fix_height_nl<K, V>(n: &Node<K, V>) -> *mut Node<K, V> {
    match node_condition(n) {
        REBALANCE_REQUIRED | UNLINK_REQUIRED => as_mut_ptr(n),
        NOTHING_REQUIRED => ptr::null_mut(),
        h => {
            n.set_height(h);
            n.parent_ptr()
        }
    }
}

/// Repair `n` under `p`'s and `n`'s locks. A pending unlink always beats a
/// pure height or rotation fix at the same node.
unsafe fn rebalance_nl<K, V>(p: &Node<K, V>, n: &Node<K, V>, guard: &Guard) -> *mut Node<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    let nl = n.left_ptr();
    let nr = n.right_ptr();
    if (nl.is_null() || nr.is_null()) && n.value_ptr().is_null() {
        return if attempt_unlink_nl(p, n, guard) {
            fix_height_nl(p)
        } else {
            as_mut_ptr(n)
        };
    }
    let hn = n.height();
    let hl = height_of(nl);
    let hr = height_of(nr);
    let repl = 1 + hl.max(hr);
    if hl + 1 < hr {
        rebalance_to_left_nl(p, n, guard)
    } else if hl > 1 + hr {
        rebalance_to_right_nl(p, n, guard)
    } else if repl != hn {
        n.set_height(repl);
        fix_height_nl(p)
    } else {
        ptr::null_mut()
    }
}

unsafe fn rebalance_to_right_nl<K, V>(
    p: &Node<K, V>,
    n: &Node<K, V>,
    guard: &Guard,
) -> *mut Node<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    let nl_ptr = unshared_child_nl(n, Dir::Left, guard);
    if nl_ptr.is_null() {
        // The imbalance we saw is gone; re-examine.
        return as_mut_ptr(n);
    }
    let nl = &*nl_ptr;
    let _ll = nl.lock.lock();
    let hr0 = height_of(n.right_ptr());
    let hl = nl.height();
    if hl - hr0 <= 1 {
        return as_mut_ptr(n);
    }
    let hll0 = height_of(nl.left_ptr());
    let nlr0 = nl.right_ptr();
    let hlr0 = height_of(nlr0);
    if hll0 >= hlr0 {
        return rotate_right_nl(p, n, nl, hr0, hll0, nlr0, hlr0);
    }
    // A double rotation rewrites nlr's links, so it must be owned first.
    let nlr_ptr = unshared_child_nl(nl, Dir::Right, guard);
    let nlr = &*nlr_ptr;
    {
        let _lrl = nlr.lock.lock();
        let hlr = nlr.height();
        if hll0 >= hlr {
            return rotate_right_nl(p, n, nl, hr0, hll0, nlr_ptr, hlr);
        }
        let hlrl = height_of(nlr.left_ptr());
        let b = hll0 - hlrl;
        if (-1..=1).contains(&b) && !((hll0 == 0 || hlrl == 0) && nl.value_ptr().is_null()) {
            return rotate_right_over_left_nl(p, n, nl, hr0, hll0, nlr, hlrl);
        }
    }
    // nl is unbalanced within itself; fix that first.
    rebalance_to_left_nl(n, nl, guard)
}

unsafe fn rebalance_to_left_nl<K, V>(
    p: &Node<K, V>,
    n: &Node<K, V>,
    guard: &Guard,
) -> *mut Node<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    let nr_ptr = unshared_child_nl(n, Dir::Right, guard);
    if nr_ptr.is_null() {
        return as_mut_ptr(n);
    }
    let nr = &*nr_ptr;
    let _rl = nr.lock.lock();
    let hl0 = height_of(n.left_ptr());
    let hr = nr.height();
    if hr - hl0 <= 1 {
        return as_mut_ptr(n);
    }
    let hrr0 = height_of(nr.right_ptr());
    let nrl0 = nr.left_ptr();
    let hrl0 = height_of(nrl0);
    if hrr0 >= hrl0 {
        return rotate_left_nl(p, n, nr, hl0, hrr0, nrl0, hrl0);
    }
    let nrl_ptr = unshared_child_nl(nr, Dir::Left, guard);
    let nrl = &*nrl_ptr;
    {
        let _rll = nrl.lock.lock();
        let hrl = nrl.height();
        if hrr0 >= hrl {
            return rotate_left_nl(p, n, nr, hl0, hrr0, nrl_ptr, hrl);
        }
        let hrlr = height_of(nrl.right_ptr());
        let b = hrr0 - hrlr;
        if (-1..=1).contains(&b) && !((hrr0 == 0 || hrlr == 0) && nr.value_ptr().is_null()) {
            return rotate_left_over_right_nl(p, n, nr, hl0, hrr0, nrl, hrlr);
        }
    }
    rebalance_to_right_nl(n, nr, guard)
}

/// Single right rotation: nl rises above n. Only n's subtree shrinks - a
/// reader inside nl sees its keyspace grow, which never invalidates a
/// descent that already passed through n.
unsafe fn rotate_right_nl<K, V>(
    p: &Node<K, V>,
    n: &Node<K, V>,
    nl: &Node<K, V>,
    hr: i32,
    hll: i32,
    nlr: *mut Node<K, V>,
    hlr: i32,
) -> *mut Node<K, V> {
    let n_ptr = as_mut_ptr(n);
    let nl_ptr = as_mut_ptr(nl);
    let node_ovl = n.version();
    let pl = p.left_ptr();
    n.begin_shrink(node_ovl);

    n.child(Dir::Left).store(nlr, Ordering::Release);
    if !nlr.is_null() {
        (*nlr).set_parent(n_ptr);
    }
    nl.child(Dir::Right).store(n_ptr, Ordering::Release);
    n.set_parent(nl_ptr);
    if pl == n_ptr {
        p.child(Dir::Left).store(nl_ptr, Ordering::Release);
    } else {
        p.child(Dir::Right).store(nl_ptr, Ordering::Release);
    }
    nl.set_parent(as_mut_ptr(p));

    let h_n = 1 + hlr.max(hr);
    n.set_height(h_n);
    nl.set_height(1 + hll.max(h_n));
    n.end_shrink(node_ovl);

    // Hand back whichever node is still damaged, if any.
    let bal_n = hlr - hr;
    if !(-1..=1).contains(&bal_n) {
        return n_ptr;
    }
    if (nlr.is_null() || hlr == 0) && n.value_ptr().is_null() {
        return n_ptr;
    }
    let bal_l = hll - h_n;
    if !(-1..=1).contains(&bal_l) {
        return nl_ptr;
    }
    if hll == 0 && nl.value_ptr().is_null() {
        return nl_ptr;
    }
    fix_height_nl(p)
}

unsafe fn rotate_left_nl<K, V>(
    p: &Node<K, V>,
    n: &Node<K, V>,
    nr: &Node<K, V>,
    hl: i32,
    hrr: i32,
    nrl: *mut Node<K, V>,
    hrl: i32,
) -> *mut Node<K, V> {
    let n_ptr = as_mut_ptr(n);
    let nr_ptr = as_mut_ptr(nr);
    let node_ovl = n.version();
    let pl = p.left_ptr();
    n.begin_shrink(node_ovl);

    n.child(Dir::Right).store(nrl, Ordering::Release);
    if !nrl.is_null() {
        (*nrl).set_parent(n_ptr);
    }
    nr.child(Dir::Left).store(n_ptr, Ordering::Release);
    n.set_parent(nr_ptr);
    if pl == n_ptr {
        p.child(Dir::Left).store(nr_ptr, Ordering::Release);
    } else {
        p.child(Dir::Right).store(nr_ptr, Ordering::Release);
    }
    nr.set_parent(as_mut_ptr(p));

    let h_n = 1 + hl.max(hrl);
    n.set_height(h_n);
    nr.set_height(1 + h_n.max(hrr));
    n.end_shrink(node_ovl);

    let bal_n = hrl - hl;
    if !(-1..=1).contains(&bal_n) {
        return n_ptr;
    }
    if (nrl.is_null() || hrl == 0) && n.value_ptr().is_null() {
        return n_ptr;
    }
    let bal_r = hrr - h_n;
    if !(-1..=1).contains(&bal_r) {
        return nr_ptr;
    }
    if hrr == 0 && nr.value_ptr().is_null() {
        return nr_ptr;
    }
    fix_height_nl(p)
}

/// Double rotation: nlr rises above both nl and n. Both n and nl shrink.
unsafe fn rotate_right_over_left_nl<K, V>(
    p: &Node<K, V>,
    n: &Node<K, V>,
    nl: &Node<K, V>,
    hr: i32,
    hll: i32,
    nlr: &Node<K, V>,
    hlrl: i32,
) -> *mut Node<K, V> {
    let n_ptr = as_mut_ptr(n);
    let nl_ptr = as_mut_ptr(nl);
    let nlr_ptr = as_mut_ptr(nlr);
    let node_ovl = n.version();
    let left_ovl = nl.version();
    let pl = p.left_ptr();
    let nlrl = nlr.left_ptr();
    let nlrr = nlr.right_ptr();
    let hlrr = height_of(nlrr);
    n.begin_shrink(node_ovl);
    nl.begin_shrink(left_ovl);

    n.child(Dir::Left).store(nlrr, Ordering::Release);
    if !nlrr.is_null() {
        (*nlrr).set_parent(n_ptr);
    }
    nl.child(Dir::Right).store(nlrl, Ordering::Release);
    if !nlrl.is_null() {
        (*nlrl).set_parent(nl_ptr);
    }
    nlr.child(Dir::Left).store(nl_ptr, Ordering::Release);
    nl.set_parent(nlr_ptr);
    nlr.child(Dir::Right).store(n_ptr, Ordering::Release);
    n.set_parent(nlr_ptr);
    if pl == n_ptr {
        p.child(Dir::Left).store(nlr_ptr, Ordering::Release);
    } else {
        p.child(Dir::Right).store(nlr_ptr, Ordering::Release);
    }
    nlr.set_parent(as_mut_ptr(p));

    let h_n = 1 + hlrr.max(hr);
    n.set_height(h_n);
    let h_l = 1 + hll.max(hlrl);
    nl.set_height(h_l);
    nlr.set_height(1 + h_n.max(h_l));
    nl.end_shrink(left_ovl);
    n.end_shrink(node_ovl);

    let bal_n = hlrr - hr;
    if !(-1..=1).contains(&bal_n) {
        return n_ptr;
    }
    if (nlrr.is_null() || hlrr == 0) && n.value_ptr().is_null() {
        return n_ptr;
    }
    let bal_lr = h_l - h_n;
    if !(-1..=1).contains(&bal_lr) {
        return nlr_ptr;
    }
    fix_height_nl(p)
}

unsafe fn rotate_left_over_right_nl<K, V>(
    p: &Node<K, V>,
    n: &Node<K, V>,
    nr: &Node<K, V>,
    hl: i32,
    hrr: i32,
    nrl: &Node<K, V>,
    hrlr: i32,
) -> *mut Node<K, V> {
    let n_ptr = as_mut_ptr(n);
    let nr_ptr = as_mut_ptr(nr);
    let nrl_ptr = as_mut_ptr(nrl);
    let node_ovl = n.version();
    let right_ovl = nr.version();
    let pl = p.left_ptr();
    let nrll = nrl.left_ptr();
    let nrlr = nrl.right_ptr();
    let hrll = height_of(nrll);
    n.begin_shrink(node_ovl);
    nr.begin_shrink(right_ovl);

    n.child(Dir::Right).store(nrll, Ordering::Release);
    if !nrll.is_null() {
        (*nrll).set_parent(n_ptr);
    }
    nr.child(Dir::Left).store(nrlr, Ordering::Release);
    if !nrlr.is_null() {
        (*nrlr).set_parent(nr_ptr);
    }
    nrl.child(Dir::Right).store(nr_ptr, Ordering::Release);
    nr.set_parent(nrl_ptr);
    nrl.child(Dir::Left).store(n_ptr, Ordering::Release);
    n.set_parent(nrl_ptr);
    if pl == n_ptr {
        p.child(Dir::Left).store(nrl_ptr, Ordering::Release);
    } else {
        p.child(Dir::Right).store(nrl_ptr, Ordering::Release);
    }
    nrl.set_parent(as_mut_ptr(p));

    let h_n = 1 + hl.max(hrll);
    n.set_height(h_n);
    let h_r = 1 + hrlr.max(hrr);
    nr.set_height(h_r);
    nrl.set_height(1 + h_n.max(h_r));
    nr.end_shrink(right_ovl);
    n.end_shrink(node_ovl);

    let bal_n = hrll - hl;
    if !(-1..=1).contains(&bal_n) {
        return n_ptr;
    }
    if (nrll.is_null() || hrll == 0) && n.value_ptr().is_null() {
        return n_ptr;
    }
    let bal_rl = h_r - h_n;
    if !(-1..=1).contains(&bal_rl) {
        return nrl_ptr;
    }
    fix_height_nl(p)
}

// ===== extremes ===========================================================

/// The least (`Dir::Left`) or greatest (`Dir::Right`) present entry, found
/// by an in-order walk that skips tombstones, with the same validation
/// discipline as `get`.
pub(crate) unsafe fn extreme_impl<K, V>(
    holder: &Node<K, V>,
    dir: Dir,
    guard: &Guard,
) -> Option<(K, V)>
where
    K: Ord + Clone,
    V: Clone,
{
    loop {
        let right = holder.right_ptr();
        if right.is_null() {
            return None;
        }
        let r = &*right;
        let rv = r.version();
        if is_shrinking(rv) {
            r.wait_until_shrink_completed(rv);
            continue;
        }
        if rv == OVL_UNLINKED || holder.right_ptr() != right {
            continue;
        }
        match attempt_extreme(r, rv, dir, guard) {
            Attempt::Done(x) => return x,
            Attempt::Retry => continue,
        }
    }
}

unsafe fn attempt_extreme<K, V>(
    node: &Node<K, V>,
    node_v: u64,
    dir: Dir,
    guard: &Guard,
) -> Attempt<Option<(K, V)>>
where
    K: Ord + Clone,
    V: Clone,
{
    // The near subtree may hold the answer...
    loop {
        let child = node.child(dir).load(Ordering::Acquire);
        if child.is_null() {
            if node.version() != node_v {
                return Attempt::Retry;
            }
            break;
        }
        let c = &*child;
        let cv = c.version();
        if is_shrinking(cv) {
            c.wait_until_shrink_completed(cv);
            if node.version() != node_v {
                return Attempt::Retry;
            }
            continue;
        }
        if cv == OVL_UNLINKED || node.child(dir).load(Ordering::Acquire) != child {
            if node.version() != node_v {
                return Attempt::Retry;
            }
            continue;
        }
        if node.version() != node_v {
            return Attempt::Retry;
        }
        match attempt_extreme(c, cv, dir, guard) {
            Attempt::Done(Some(kv)) => return Attempt::Done(Some(kv)),
            // Nothing but tombstones below; this node is next in order.
            Attempt::Done(None) => break,
            Attempt::Retry => {
                if node.version() != node_v {
                    return Attempt::Retry;
                }
                continue;
            }
        }
    }
    // ... else this node ...
    if let Some(v) = node.read_value(guard) {
        return Attempt::Done(Some((node.key_ref().clone(), v)));
    }
    // ... else the far subtree.
    let far = dir.flip();
    loop {
        let child = node.child(far).load(Ordering::Acquire);
        if child.is_null() {
            if node.version() != node_v {
                return Attempt::Retry;
            }
            return Attempt::Done(None);
        }
        let c = &*child;
        let cv = c.version();
        if is_shrinking(cv) {
            c.wait_until_shrink_completed(cv);
            if node.version() != node_v {
                return Attempt::Retry;
            }
            continue;
        }
        if cv == OVL_UNLINKED || node.child(far).load(Ordering::Acquire) != child {
            if node.version() != node_v {
                return Attempt::Retry;
            }
            continue;
        }
        if node.version() != node_v {
            return Attempt::Retry;
        }
        match attempt_extreme(c, cv, dir, guard) {
            Attempt::Done(x) => return Attempt::Done(x),
            Attempt::Retry => {
                if node.version() != node_v {
                    return Attempt::Retry;
                }
                continue;
            }
        }
    }
}

// ===== consistency check ==================================================

/// Walk a quiesced tree verifying key order, stored heights, and the AVL
/// balance bound. Returns (consistent, height, present entries).
pub(crate) unsafe fn verify_impl<K, V>(holder: &Node<K, V>) -> (bool, i32, usize)
where
    K: Ord,
{
    fn walk<K: Ord, V>(
        p: *mut Node<K, V>,
        lo: Option<&K>,
        hi: Option<&K>,
    ) -> Result<(i32, usize), ()> {
        if p.is_null() {
            return Ok((0, 0));
        }
        let n = unsafe { &*p };
        let k = n.key_ref();
        if let Some(lo) = lo {
            if k <= lo {
                return Err(());
            }
        }
        if let Some(hi) = hi {
            if k >= hi {
                return Err(());
            }
        }
        let (hl, cl) = walk(n.left_ptr(), lo, Some(k))?;
        let (hr, cr) = walk(n.right_ptr(), Some(k), hi)?;
        if (hl - hr).abs() > 1 {
            return Err(());
        }
        let h = 1 + hl.max(hr);
        if n.height() != h {
            return Err(());
        }
        let present = if n.value_ptr().is_null() { 0 } else { 1 };
        Ok((h, cl + cr + present))
    }
    match walk(holder.right_ptr(), None, None) {
        Ok((h, c)) => (true, h, c),
        Err(()) => (false, 0, 0),
    }
}
