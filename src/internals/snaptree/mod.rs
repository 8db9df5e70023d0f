//! The concurrent AVL tree internals: nodes with optimistic version words,
//! subtree-granular copy-on-write, and the locked rebalancing machinery.
//! The safe public surface lives in [crate::snaptree].

pub(crate) mod cursor;
pub(crate) mod iter;
pub(crate) mod node;
pub(crate) mod states;

pub use iter::Iter;
