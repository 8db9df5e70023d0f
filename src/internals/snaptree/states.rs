//! Small result and direction types threaded through the tree walks.

/// Which child link of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Left,
    Right,
}

impl Dir {
    #[inline]
    pub(crate) fn flip(self) -> Self {
        match self {
            Dir::Left => Dir::Right,
            Dir::Right => Dir::Left,
        }
    }
}

/// Outcome of one optimistic descent step. `Retry` unwinds exactly one
/// level, to the parent that must re-validate its own version before the
/// step is attempted again. It never unwinds to the tree root.
#[derive(Debug)]
pub(crate) enum Attempt<R> {
    Done(R),
    Retry,
}
