//! Typed, contextual errors for every fatal condition the compiler can raise.
//!
//! Every variant carries enough context (rank, op id, the violated invariant)
//! to produce a precise message on its own; callers that only need to
//! propagate failure use `anyhow::Result` at the facade boundary (see
//! `builder.rs`, `emit.rs`), wrapping a typed inner error for `?`-propagation
//! while still allowing richer call sites to downcast back to
//! [`CompileError`].

use crate::op_id::{OpId, RankId};
use thiserror::Error;

/// All fatal error kinds the compiler can raise.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The builder surface was used without an active program scope.
    #[error("no program in context")]
    NoContext,

    /// A second program scope was entered while one was already active.
    #[error("a program is already in context")]
    NestedContext,

    /// A read targeted an empty slot.
    #[error("rank {rank}: missing chunk at {buffer}[{index}]")]
    MissingChunk {
        rank: RankId,
        buffer: String,
        index: usize,
    },

    /// A scratch buffer name was reused on one rank.
    #[error("rank {rank}: scratch buffer {name:?} already exists")]
    DuplicateScratch { rank: RankId, name: String },

    /// `split(k)` was called where `size % k != 0`.
    #[error("rank {rank}: cannot split a chunk of size {size} into {k} equal parts")]
    BadSplit { rank: RankId, size: usize, k: usize },

    /// Manual assignment tried to place two incompatible ops on one TB.
    #[error(
        "rank {rank}: threadblock {tb} conflict on op {op} ({invariant})"
    )]
    TBConflict {
        rank: RankId,
        tb: i32,
        op: OpId,
        invariant: String,
    },

    /// Automatic assignment found no compatible base thread-block for an op.
    #[error("rank {rank}: no compatible threadblock for op {op} ({invariant})")]
    NoAssignment {
        rank: RankId,
        op: OpId,
        invariant: String,
    },

    /// A send lacked its matching recv (or vice versa) at emission time.
    #[error("rank {rank}: op {op} has no matching op at emission ({invariant})")]
    Unmatched {
        rank: RankId,
        op: OpId,
        invariant: String,
    },

    /// `check()`'s advisory postcondition pass found a required output slot
    /// unpopulated. Not returned by `check()` itself (which is advisory and
    /// returns `bool`), but available for callers that want to turn an
    /// advisory failure into a hard error.
    #[error("rank {rank}: postcondition failed for chunk {chunk} ({invariant})")]
    PostconditionFail {
        rank: RankId,
        chunk: usize,
        invariant: String,
    },
}

impl CompileError {
    /// The rank this error is attributed to, when applicable.
    pub fn rank(&self) -> Option<RankId> {
        match self {
            CompileError::MissingChunk { rank, .. }
            | CompileError::DuplicateScratch { rank, .. }
            | CompileError::BadSplit { rank, .. }
            | CompileError::TBConflict { rank, .. }
            | CompileError::NoAssignment { rank, .. }
            | CompileError::Unmatched { rank, .. }
            | CompileError::PostconditionFail { rank, .. } => Some(*rank),
            CompileError::NoContext | CompileError::NestedContext => None,
        }
    }
}
