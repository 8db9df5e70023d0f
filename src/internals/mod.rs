//! This module contains all the internals of how the concurrent structures
//! are implemented. You should turn back now. Nothing of value is here.
//! This module exists so the quiescence and generation machinery can be
//! composed under other container types; every element of it is unsafe in
//! every meaning of the word.
//!
//! ⚠️   ⚠️   ⚠️

pub(crate) mod cow;
pub(crate) mod epoch;
pub(crate) mod snaptree;

pub use cow::SnapCapable;
