//! A hierarchical arrival/departure counter.
//!
//! An [Epoch] admits "tickets" until it is asked to close, and can tell -
//! exactly, without stopping the world - when every admitted ticket has been
//! released again. Each release carries a numeric payload which the epoch
//! accumulates; the map above us uses this to fold per-mutation size deltas
//! into a single committed size at each generation boundary.
//!
//! A single atomic counter would serialise every arrival on one cache line.
//! Instead each node spreads contended arrivals over four children selected
//! by a hash of the arriving thread, growing a shallow tree whose depth is
//! bounded by log4 of the processor count. The uncontended case stays a
//! single compare and swap.

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::hash::BuildHasher;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread;

/*
 * Every EpochNode packs its whole state into one 64bit word so that a single
 * compare and swap can observe and update the flags together. The packing is
 * load bearing - do not split these fields.
 *
 *   bits 63..32   payload sum (wrapping i32)
 *   bits 31..12   entry count (20 bits)
 *   bit  11       CLOSING - no further arrivals admitted
 *   bit  10       CLOSED  - close has propagated, count may only fall
 *   bit   9       EMPTY   - closed, zero count, all present children empty
 *   bits  8..5    child present
 *   bits  4..1    child empty
 *   bit   0       TOUCHED - an arrival was admitted here at least once
 */

const PAYLOAD_SHIFT: u32 = 32;
const COUNT_SHIFT: u32 = 12;
const COUNT_UNIT: u64 = 1 << COUNT_SHIFT;
const COUNT_MASK: u64 = 0xf_ffff << COUNT_SHIFT;
const COUNT_LIMIT: u64 = 0xf_ffff;
const CLOSING: u64 = 1 << 11;
const CLOSED: u64 = 1 << 10;
const EMPTY: u64 = 1 << 9;
const CHILD_PRESENT_SHIFT: u32 = 5;
const CHILD_EMPTY_SHIFT: u32 = 1;
const CHILD_PRESENT_MASK: u64 = 0xf << CHILD_PRESENT_SHIFT;
const CHILD_EMPTY_MASK: u64 = 0xf << CHILD_EMPTY_SHIFT;
const TOUCHED: u64 = 1;

/// Fan out of the counter tree.
const EPOCH_FAN_OUT: usize = 4;

/// CAS failures tolerated on a node before arrivals spread to a child.
const ARRIVE_SPREAD_TRIES: usize = 2;

#[inline]
fn count_of(word: u64) -> u64 {
    (word & COUNT_MASK) >> COUNT_SHIFT
}

#[inline]
fn payload_of(word: u64) -> i64 {
    ((word >> PAYLOAD_SHIFT) as u32 as i32) as i64
}

#[inline]
fn merge_payload(word: u64, delta: i64) -> u64 {
    let sum = ((word >> PAYLOAD_SHIFT) as u32).wrapping_add(delta as i32 as u32);
    (word & 0xffff_ffff) | ((sum as u64) << PAYLOAD_SHIFT)
}

#[inline]
fn child_present_bit(slot: usize) -> u64 {
    1 << (CHILD_PRESENT_SHIFT + slot as u32)
}

#[inline]
fn child_empty_bit(slot: usize) -> u64 {
    1 << (CHILD_EMPTY_SHIFT + slot as u32)
}

/// The single predicate gating completion: closed, drained, and every
/// present child has reported empty.
#[inline]
fn word_is_empty(word: u64) -> bool {
    let present = (word & CHILD_PRESENT_MASK) >> CHILD_PRESENT_SHIFT;
    let emptied = (word & CHILD_EMPTY_MASK) >> CHILD_EMPTY_SHIFT;
    (word & CLOSED) != 0 && count_of(word) == 0 && present & !emptied == 0
}

/// Depth limit of the counter tree, ~log4 of the processor count.
fn max_depth() -> usize {
    static DEPTH: OnceLock<usize> = OnceLock::new();
    *DEPTH.get_or_init(|| {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let mut depth = 0;
        let mut span = 1;
        while span < cpus {
            span *= EPOCH_FAN_OUT;
            depth += 1;
        }
        depth
    })
}

/// Two bits of the caller's identity hash per level, so one thread lands on
/// the same child each time but distinct threads spread out.
fn child_slot(depth: usize) -> usize {
    thread_local! {
        static SPREAD: u64 = foldhash::fast::FixedState::default()
            .hash_one(thread::current().id());
    }
    let h = SPREAD.with(|s| *s);
    ((h >> (2 * depth as u32)) & (EPOCH_FAN_OUT as u64 - 1)) as usize
}

pub(crate) struct EpochNode {
    state: CachePadded<AtomicU64>,
    parent: *const EpochNode,
    slot: usize,
    children: [AtomicPtr<EpochNode>; EPOCH_FAN_OUT],
}

unsafe impl Send for EpochNode {}
unsafe impl Sync for EpochNode {}

impl EpochNode {
    fn new(parent: *const EpochNode, slot: usize) -> Self {
        EpochNode {
            state: CachePadded::new(AtomicU64::new(0)),
            parent,
            slot,
            children: [const { AtomicPtr::new(ptr::null_mut()) }; EPOCH_FAN_OUT],
        }
    }

    /// Attempt to admit one ticket at this node or a descendant, returning
    /// the node arrived at. Fails once closing has been requested anywhere
    /// on the path.
    fn arrive(&self, depth: usize) -> Option<&EpochNode> {
        let mut tries = 0;
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & CLOSING != 0 {
                return None;
            }
            let must_spread = cur & CHILD_PRESENT_MASK != 0
                || tries >= ARRIVE_SPREAD_TRIES
                || count_of(cur) >= COUNT_LIMIT;
            if !must_spread || depth >= max_depth() {
                if count_of(cur) >= COUNT_LIMIT {
                    // The caller has leaked or hoarded a million tickets.
                    panic!("epoch entry count overflow");
                }
                let next = (cur + COUNT_UNIT) | TOUCHED;
                if self
                    .state
                    .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Some(self);
                }
                tries += 1;
                continue;
            }
            let child = self.get_or_create_child(child_slot(depth))?;
            return child.arrive(depth + 1);
        }
    }

    /// Mark the child slot present (same CAS that re-checks CLOSING, so no
    /// child can escape a close), then install or fetch the node.
    fn get_or_create_child(&self, slot: usize) -> Option<&EpochNode> {
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & CLOSING != 0 {
                return None;
            }
            if cur & child_present_bit(slot) != 0 {
                break;
            }
            let next = cur | child_present_bit(slot) | TOUCHED;
            if self
                .state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let node = Box::into_raw(Box::new(EpochNode::new(self as *const _, slot)));
                self.children[slot].store(node, Ordering::Release);
                break;
            }
        }
        // The present bit may be visible a moment before the pointer.
        loop {
            let p = self.children[slot].load(Ordering::Acquire);
            if !p.is_null() {
                return Some(unsafe { &*p });
            }
            core::hint::spin_loop();
        }
    }

    /// Release one ticket, folding `delta` into the payload. Returns the
    /// final accumulated payload if this release emptied the root.
    fn leave(&self, delta: i64) -> Option<i64> {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            assert!(count_of(cur) > 0, "epoch ticket released with no arrival");
            let next = merge_payload(cur - COUNT_UNIT, delta);
            match self.state.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return self.try_empty(next),
                Err(now) => cur = now,
            }
        }
    }

    /// If the word satisfies the emptiness predicate, claim the EMPTY bit
    /// (exactly once per node) and propagate upward.
    fn try_empty(&self, seen: u64) -> Option<i64> {
        let mut cur = seen;
        loop {
            if cur & EMPTY != 0 || !word_is_empty(cur) {
                return None;
            }
            match self.state.compare_exchange(
                cur,
                cur | EMPTY,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let payload = payload_of(cur);
                    return if self.parent.is_null() {
                        Some(payload)
                    } else {
                        unsafe { &*self.parent }.child_emptied(self.slot, payload)
                    };
                }
                Err(now) => cur = now,
            }
        }
    }

    /// A child subtree has fully drained: merge its payload and mark its
    /// empty bit in one CAS, then re-evaluate our own emptiness.
    fn child_emptied(&self, slot: usize, payload: i64) -> Option<i64> {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(cur & child_present_bit(slot) != 0);
            debug_assert!(cur & child_empty_bit(slot) == 0);
            let next = merge_payload(cur | child_empty_bit(slot), payload);
            match self.state.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return self.try_empty(next),
                Err(now) => cur = now,
            }
        }
    }

    /// Refuse new arrivals here and in every present child. Emptiness of
    /// already drained children is claimed on the way through; stragglers
    /// propagate themselves as they leave.
    fn close_subtree(&self) -> Option<i64> {
        self.state.fetch_or(CLOSING, Ordering::AcqRel);
        let mut cur = self.state.load(Ordering::Relaxed);
        for slot in 0..EPOCH_FAN_OUT {
            if cur & child_present_bit(slot) == 0 {
                continue;
            }
            let child = loop {
                let p = self.children[slot].load(Ordering::Acquire);
                if !p.is_null() {
                    break unsafe { &*p };
                }
                core::hint::spin_loop();
            };
            if child.close_subtree().is_some() {
                // A child can only complete the root if it *is* the root.
                unreachable!();
            }
            cur = self.state.load(Ordering::Relaxed);
        }
        let cur = self.state.fetch_or(CLOSED, Ordering::AcqRel) | CLOSED;
        self.try_empty(cur)
    }
}

impl Drop for EpochNode {
    fn drop(&mut self) {
        for c in &mut self.children {
            let p = *c.get_mut();
            if !p.is_null() {
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

/// A capability returned by a successful arrival. Exactly one release must
/// follow; the ticket is handed back to the [Epoch] that issued it.
pub(crate) struct EpochTicket {
    node: NonNull<EpochNode>,
}

unsafe impl Send for EpochTicket {}

/// The root of a counter tree, plus the one-shot completion signal fired
/// when the whole subtree reports empty.
pub(crate) struct Epoch {
    root: Box<EpochNode>,
    done: Mutex<Option<i64>>,
    cond: Condvar,
}

impl Epoch {
    pub(crate) fn new() -> Self {
        Epoch {
            root: Box::new(EpochNode::new(ptr::null(), 0)),
            done: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Admit one ticket, or refuse because a close is underway.
    pub(crate) fn arrive(&self) -> Option<EpochTicket> {
        self.root.arrive(0).map(|node| EpochTicket {
            node: NonNull::from(node),
        })
    }

    /// Release a ticket issued by this epoch, folding in its payload.
    pub(crate) fn release(&self, ticket: EpochTicket, delta: i64) {
        let node = unsafe { ticket.node.as_ref() };
        if let Some(total) = node.leave(delta) {
            self.complete(total);
        }
    }

    /// Stop admissions and wait for every outstanding ticket to drain.
    /// Returns the accumulated payload. Idempotent - concurrent closers all
    /// observe the same completion.
    pub(crate) fn begin_close(&self) -> i64 {
        if let Some(total) = self.root.close_subtree() {
            self.complete(total);
        }
        let mut done = self.done.lock();
        while done.is_none() {
            self.cond.wait(&mut done);
        }
        done.unwrap()
    }

    fn complete(&self, total: i64) {
        let mut done = self.done.lock();
        debug_assert!(done.is_none());
        *done = Some(total);
        self.cond.notify_all();
    }

    /// The exact payload sum, if a single load of the root word can prove
    /// quiescence (no entries, no children). `None` means an exact sum
    /// requires a close.
    pub(crate) fn quiescent_payload(&self) -> Option<i64> {
        let word = self.root.state.load(Ordering::Acquire);
        if count_of(word) == 0 && word & CHILD_PRESENT_MASK == 0 {
            Some(payload_of(word))
        } else {
            None
        }
    }

    /// True while no arrival has ever been admitted.
    pub(crate) fn is_pristine(&self) -> bool {
        let word = self.root.state.load(Ordering::Acquire);
        word & (TOUCHED | CHILD_PRESENT_MASK) == 0 && count_of(word) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::thread::scope;

    #[test]
    fn test_epoch_arrive_leave() {
        let e = Epoch::new();
        assert!(e.is_pristine());
        let t = e.arrive().unwrap();
        assert!(!e.is_pristine());
        assert!(e.quiescent_payload().is_none());
        e.release(t, 5);
        assert_eq!(e.quiescent_payload(), Some(5));
        let t = e.arrive().unwrap();
        e.release(t, -2);
        assert_eq!(e.quiescent_payload(), Some(3));
    }

    #[test]
    fn test_epoch_close_refuses_arrivals() {
        let e = Epoch::new();
        let t = e.arrive().unwrap();
        e.release(t, 1);
        let total = e.begin_close();
        assert_eq!(total, 1);
        assert!(e.arrive().is_none());
        // A second close observes the same completion.
        assert_eq!(e.begin_close(), 1);
    }

    #[test]
    fn test_epoch_close_waits_for_drain() {
        let e = Epoch::new();
        let t1 = e.arrive().unwrap();
        let t2 = e.arrive().unwrap();
        scope(|s| {
            let closer = s.spawn(|| e.begin_close());
            e.release(t1, 10);
            e.release(t2, -3);
            assert_eq!(closer.join().unwrap(), 7);
        });
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_epoch_contended_sum() {
        let e = Epoch::new();
        let expect = AtomicI64::new(0);
        scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let e = &e;
                    let expect = &expect;
                    s.spawn(move || {
                        for j in 0..1000i64 {
                            let t = e.arrive().expect("not closing");
                            let d = (i as i64 + j) % 7 - 3;
                            expect.fetch_add(d, Ordering::Relaxed);
                            e.release(t, d);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        });
        let total = e.begin_close();
        assert_eq!(total, expect.load(Ordering::Relaxed));
    }

    #[test]
    #[should_panic(expected = "released with no arrival")]
    fn test_epoch_leave_without_arrive() {
        let e = Epoch::new();
        let t = e.arrive().unwrap();
        e.release(t, 0);
        // Forge a second release against the drained root.
        let forged = EpochTicket {
            node: NonNull::from(&*e.root),
        };
        e.release(forged, 0);
    }
}
