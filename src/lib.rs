//! Snapread - a concurrently readable, snapshottable ordered map
//!
//! The centrepiece of this crate is [SnapTreeMap]: a thread-safe sorted
//! key-value map in which readers never block, writers take only small
//! per-node locks, and a point-in-time snapshot ([SnapTreeMap::clone]) or
//! an exact element count ([SnapTreeMap::len]) costs O(1) rather than a
//! lock or a tree scan.
//!
//! Three pieces make that work, layered leaf first:
//!
//! * A hierarchical quiescence counter that can say, exactly and without
//!   stopping the world, "no mutation is in flight", spreading contended
//!   arrivals over a shallow tree of counters.
//! * A generation manager that uses the counter to roll a copy-on-write
//!   value from one generation to the next at each snapshot boundary.
//! * An AVL tree whose nodes carry an optimistic version word for lock-free
//!   reads, and a shared tag for subtree-granular copy-on-write.
//!
//! Unlike a transactional map behind a single writer lock, any number of
//! threads may mutate a [SnapTreeMap] concurrently; contention is paid only
//! where threads actually collide in the tree.
//!
//! If you hold snapshots (clones, iterators) for a long time, memory for
//! the shared subtrees is retained until the last holder drops - the usual
//! space cost of copy-on-write reading.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]
#![allow(clippy::needless_lifetimes)]

// This is where the scary rust lives.
pub mod internals;
// This is where the gud rust lives.
pub mod snaptree;
#[cfg(feature = "serde")]
mod utils;

pub use snaptree::SnapTreeMap;
