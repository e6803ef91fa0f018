//! Lightweight unique identifiers used as arena indices throughout the compiler.
//!
//! Ops are stored in per-rank arenas (`Vec<Op>`) rather than behind `Rc`/`RefCell`,
//! so every cross-reference an `Op` needs (`depends`, `matched`, `creator`) is a
//! plain integer index rather than an owning pointer. `OpId` is that index; it is
//! `Copy`, hashable, and ordered so it can serve as a map key or a heap tie-break.

use std::fmt;

/// Index of an [`crate::ir::Op`] within its rank's arena.
///
/// Also doubles as the monotonically increasing construction-order id used as
/// the final tie-break in heap-ordered scheduling.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize)]
pub struct OpId(u32);

impl OpId {
    pub(crate) fn new(v: u32) -> Self {
        Self(v)
    }

    /// The underlying numeric value, useful for diagnostics and serialization.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// A GPU participant in the fully-connected cluster.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize)]
pub struct RankId(pub u32);

impl fmt::Display for RankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank{}", self.0)
    }
}

impl From<u32> for RankId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<RankId> for u32 {
    fn from(v: RankId) -> Self {
        v.0
    }
}
