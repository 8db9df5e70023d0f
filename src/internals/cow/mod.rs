//! The generation manager for copy-on-write values.
//!
//! A [CowManager] owns a chain of generations, each pairing one value with
//! the count of mutation tickets issued against it (an [Epoch]). Mutators
//! share a generation and mutate the value in place; a snapshot or size
//! request closes the generation, waits for its tickets to drain, asks the
//! value to freeze itself, and installs a successor. The frozen predecessor
//! is then immutable and safe to read without any coordination.
//!
//! This is the same shape as a linear copy-on-write cell, except that the
//! "write transaction" is a shared ticket rather than an exclusive lock, and
//! the commit point is a quiescence barrier rather than a pointer swap.

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::trace;

use super::epoch::{Epoch, EpochTicket};

/// Values a [CowManager] can manage. `freeze_and_clone` must mark the
/// value's internals as shared and return a new mutable head over them; the
/// receiver is immutable from that point on.
pub trait SnapCapable: Send + Sync {
    /// Mark internals shared, returning the successor mutable value.
    fn freeze_and_clone(&self) -> Self;
}

struct GenSlot<T> {
    value: Arc<T>,
    base_size: usize,
    /// The predecessor's frozen value, when this generation began at a
    /// freeze boundary. `None` only for a manager's very first generation.
    frozen_prev: Option<Arc<T>>,
}

/// One generation: a value plus the tickets issued against it.
///
/// active -> closing (no new tickets, in-flight draining) -> closed
/// (successor installed, waiters released).
pub(crate) struct Generation<T> {
    epoch: Epoch,
    /// Filled before the generation is published. Tickets secured against a
    /// queued successor wait for the predecessor to close before reading it.
    slot: OnceLock<GenSlot<T>>,
    /// The pre-built successor, allocated before the epoch starts closing
    /// so late arrivals are redirected without blocking on allocation.
    queued: OnceLock<Arc<Generation<T>>>,
    closer: AtomicBool,
    closed: Mutex<bool>,
    closed_cond: Condvar,
}

impl<T> Generation<T> {
    fn vacant() -> Self {
        Generation {
            epoch: Epoch::new(),
            slot: OnceLock::new(),
            queued: OnceLock::new(),
            closer: AtomicBool::new(false),
            closed: Mutex::new(false),
            closed_cond: Condvar::new(),
        }
    }

    fn with_slot(value: Arc<T>, base_size: usize, frozen_prev: Option<Arc<T>>) -> Self {
        let g = Generation::vacant();
        let _ = g.slot.set(GenSlot {
            value,
            base_size,
            frozen_prev,
        });
        g
    }

    fn slot(&self) -> &GenSlot<T> {
        self.slot.get().expect("generation read before activation")
    }

    fn wait_closed(&self) {
        let mut done = self.closed.lock();
        while !*done {
            self.closed_cond.wait(&mut done);
        }
    }

    fn signal_closed(&self) {
        let mut done = self.closed.lock();
        *done = true;
        self.closed_cond.notify_all();
    }
}

/// A mutation ticket. Holds its generation alive; must be released exactly
/// once with the net size delta of the mutation. Dropping the ticket without
/// an explicit release (an unwind mid-mutation) releases with a zero delta
/// so the barrier never hangs.
pub(crate) struct MutTicket<T: SnapCapable> {
    generation: Arc<Generation<T>>,
    ticket: Option<EpochTicket>,
}

impl<T: SnapCapable> MutTicket<T> {
    /// The value to mutate. Valid only while the ticket is held.
    pub(crate) fn value(&self) -> &T {
        &self.generation.slot().value
    }

    pub(crate) fn release(mut self, delta: i64) {
        let t = self.ticket.take().expect("ticket released twice");
        self.generation.epoch.release(t, delta);
    }
}

impl<T: SnapCapable> Drop for MutTicket<T> {
    fn drop(&mut self) {
        if let Some(t) = self.ticket.take() {
            self.generation.epoch.release(t, 0);
        }
    }
}

/// The generation coordinator. See the module docs.
pub(crate) struct CowManager<T: SnapCapable> {
    active: ArcSwap<Generation<T>>,
}

impl<T: SnapCapable> CowManager<T> {
    pub(crate) fn new(value: T, base_size: usize) -> Self {
        let g = Generation::with_slot(Arc::new(value), base_size, None);
        CowManager {
            active: ArcSwap::from_pointee(g),
        }
    }

    /// Build a manager over an already-frozen value: the new mutable head is
    /// cloned off it, and the frozen value is retained so the first snapshot
    /// of the new manager is free.
    pub(crate) fn new_from_frozen(frozen: Arc<T>, base_size: usize) -> Self {
        let value = Arc::new(frozen.freeze_and_clone());
        let g = Generation::with_slot(value, base_size, Some(frozen));
        CowManager {
            active: ArcSwap::from_pointee(g),
        }
    }

    /// The current mutable value, for lock-free reads that tolerate
    /// concurrent in-place mutation. Never blocks.
    pub(crate) fn read(&self) -> Arc<T> {
        self.active.load().slot().value.clone()
    }

    /// Admit one mutation. Blocks only while a rollover is actively in
    /// progress, and is then guaranteed a ticket in the very next
    /// generation - the successor exists before its predecessor refuses us.
    pub(crate) fn begin_mutation(&self) -> MutTicket<T> {
        loop {
            let g = self.active.load_full();
            if let Some(t) = g.epoch.arrive() {
                return MutTicket {
                    generation: g,
                    ticket: Some(t),
                };
            }
            if let Some(q) = g.queued.get() {
                let q = q.clone();
                if let Some(t) = q.epoch.arrive() {
                    g.wait_closed();
                    return MutTicket {
                        generation: q,
                        ticket: Some(t),
                    };
                }
            }
            // The successor itself began closing before we got a seat.
            g.wait_closed();
        }
    }

    /// A frozen value safe for read-only use, together with the element
    /// count it holds. Repeated calls without an intervening mutation return
    /// the same frozen reference; otherwise the current generation is closed
    /// and a fresh one installed.
    pub(crate) fn snapshot(&self) -> (Arc<T>, usize) {
        loop {
            let g = self.active.load_full();
            let slot = g.slot();
            if let Some(f) = slot.frozen_prev.as_ref() {
                if g.epoch.is_pristine() {
                    return (f.clone(), slot.base_size);
                }
            }
            if let Some(succ) = self.rollover(&g) {
                let s = succ.slot();
                let f = s.frozen_prev.as_ref().expect("rollover without freeze");
                return (f.clone(), s.base_size);
            }
        }
    }

    /// Committed size plus the net sum of all released tickets' deltas. If
    /// the in-flight state cannot prove an exact sum, force a rollover and
    /// read the successor's committed size.
    pub(crate) fn size(&self) -> usize {
        loop {
            let g = self.active.load_full();
            if let Some(delta) = g.epoch.quiescent_payload() {
                return (g.slot().base_size as i64 + delta) as usize;
            }
            let _ = self.rollover(&g);
        }
    }

    /// Close `g` and install its successor. The first caller per generation
    /// is elected closer and returns the installed successor; losers wait
    /// for the close and return `None` to re-read the active pointer.
    fn rollover(&self, g: &Arc<Generation<T>>) -> Option<Arc<Generation<T>>> {
        if g.closer.swap(true, Ordering::AcqRel) {
            g.wait_closed();
            return None;
        }
        // Pre-build the successor before any arrival can be refused.
        let succ = Arc::new(Generation::vacant());
        let _ = g.queued.set(succ.clone());
        let delta = g.epoch.begin_close();
        let slot = g.slot();
        let frozen = slot.value.clone();
        let base_size = (slot.base_size as i64 + delta) as usize;
        let value = Arc::new(frozen.freeze_and_clone());
        let _ = succ.slot.set(GenSlot {
            value,
            base_size,
            frozen_prev: Some(frozen),
        });
        trace!(base_size, "generation rollover");
        self.active.store(succ.clone());
        g.signal_closed();
        Some(succ)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::scope;

    // A toy snapshottable value: a counter whose freeze just copies it.
    #[derive(Debug)]
    struct TestData {
        x: AtomicUsize,
        freezes: Arc<AtomicUsize>,
    }

    impl SnapCapable for TestData {
        fn freeze_and_clone(&self) -> Self {
            self.freezes.fetch_add(1, Ordering::Relaxed);
            TestData {
                x: AtomicUsize::new(self.x.load(Ordering::Relaxed)),
                freezes: self.freezes.clone(),
            }
        }
    }

    fn manager() -> (CowManager<TestData>, Arc<AtomicUsize>) {
        let freezes = Arc::new(AtomicUsize::new(0));
        let data = TestData {
            x: AtomicUsize::new(0),
            freezes: freezes.clone(),
        };
        (CowManager::new(data, 0), freezes)
    }

    #[test]
    fn test_cow_simple_mutate_and_size() {
        let (mgr, _) = manager();
        assert_eq!(mgr.size(), 0);
        let t = mgr.begin_mutation();
        t.value().x.fetch_add(1, Ordering::Relaxed);
        t.release(1);
        assert_eq!(mgr.size(), 1);
        let t = mgr.begin_mutation();
        t.release(-1);
        assert_eq!(mgr.size(), 0);
    }

    #[test]
    fn test_cow_snapshot_isolated() {
        let (mgr, freezes) = manager();
        let t = mgr.begin_mutation();
        t.value().x.store(5, Ordering::Relaxed);
        t.release(5);
        let (snap, size) = mgr.snapshot();
        assert_eq!(size, 5);
        assert_eq!(snap.x.load(Ordering::Relaxed), 5);
        assert_eq!(freezes.load(Ordering::Relaxed), 1);
        // Mutations after the freeze land in the successor value.
        let t = mgr.begin_mutation();
        t.value().x.store(6, Ordering::Relaxed);
        t.release(1);
        assert_eq!(snap.x.load(Ordering::Relaxed), 5);
        assert_eq!(mgr.size(), 6);
    }

    #[test]
    fn test_cow_snapshot_cached_until_mutation() {
        let (mgr, freezes) = manager();
        let (a, _) = mgr.snapshot();
        let (b, _) = mgr.snapshot();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(freezes.load(Ordering::Relaxed), 1);
        let t = mgr.begin_mutation();
        t.release(0);
        let (c, _) = mgr.snapshot();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(freezes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_cow_ticket_drop_releases() {
        let (mgr, _) = manager();
        {
            let _t = mgr.begin_mutation();
            // Dropped without an explicit release.
        }
        // A hung barrier would deadlock this close.
        assert_eq!(mgr.size(), 0);
        let _ = mgr.snapshot();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_cow_multithread_rollover() {
        let (mgr, _) = manager();
        scope(|s| {
            let writers: Vec<_> = (0..4)
                .map(|_| {
                    let mgr = &mgr;
                    s.spawn(move || {
                        for _ in 0..500 {
                            let t = mgr.begin_mutation();
                            t.value().x.fetch_add(1, Ordering::Relaxed);
                            t.release(1);
                        }
                    })
                })
                .collect();
            let sizers: Vec<_> = (0..3)
                .map(|_| {
                    let mgr = &mgr;
                    s.spawn(move || {
                        let mut last = 0;
                        for _ in 0..50 {
                            let now = mgr.size();
                            assert!(now >= last);
                            last = now;
                        }
                    })
                })
                .collect();
            for h in writers {
                h.join().unwrap();
            }
            for h in sizers {
                h.join().unwrap();
            }
        });
        assert_eq!(mgr.size(), 2000);
        let (snap, size) = mgr.snapshot();
        assert_eq!(size, 2000);
        assert_eq!(snap.x.load(Ordering::Relaxed), 2000);
    }
}
