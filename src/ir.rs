//! IR primitives: chunk references, operations, thread-blocks, and the
//! per-rank/per-program records the rest of the compiler operates on.
//!
//! The `Instruction` enum is closed and small by design — rather than modeling each op kind as
//! a trait object, every op kind here is a plain tagged variant with a
//! single dispatch point in `fusion.rs` and `emit.rs`.

use crate::op_id::{OpId, RankId};
use serde::Serialize;
use std::fmt;

/// Which buffer a chunk lives in. `Scratch` carries the user-chosen name.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
pub enum Buffer {
    Input,
    Output,
    Scratch(String),
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Buffer::Input => write!(f, "input"),
            Buffer::Output => write!(f, "output"),
            Buffer::Scratch(name) => write!(f, "scratch[{name}]"),
        }
    }
}

/// An immutable handle identifying `(rank, buffer, index, size)`.
///
/// Equality is structural over exactly those four fields;
/// `hops` and `creator` are builder bookkeeping carried along for chaining and
/// are intentionally excluded from `PartialEq` so two references to the same
/// logical chunk compare equal regardless of how they were obtained.
#[derive(Clone, Debug, Serialize)]
pub struct ChunkRef {
    pub rank: RankId,
    pub buffer: Buffer,
    pub index: usize,
    pub size: usize,
    /// Number of sends this reference is downstream of. `0` for a fresh input ref.
    pub hops: u32,
    /// The op that produced this reference, if any (absent for initial input refs).
    pub creator: Option<OpId>,
}

impl PartialEq for ChunkRef {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank
            && self.buffer == other.buffer
            && self.index == other.index
            && self.size == other.size
    }
}
impl Eq for ChunkRef {}

impl ChunkRef {
    pub fn new(rank: RankId, buffer: Buffer, index: usize, size: usize) -> Self {
        Self {
            rank,
            buffer,
            index,
            size,
            hops: 0,
            creator: None,
        }
    }

    /// Whether `other` is contiguous with `self` in the same buffer (used by `group`).
    pub fn contiguous_with(&self, other: &ChunkRef) -> bool {
        self.rank == other.rank
            && self.buffer == other.buffer
            && self.index + self.size == other.index
    }
}

/// A logical datum tracked only for the `check()` postcondition pass;
/// it never appears in the emitted IR.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub origin_rank: RankId,
    pub origin_index: usize,
    pub rank: RankId,
    pub buffer: Buffer,
    pub index: usize,
}

impl Chunk {
    pub fn at(&self, rank: RankId, buffer: Buffer, index: usize) -> Chunk {
        Chunk {
            origin_rank: self.origin_rank,
            origin_index: self.origin_index,
            rank,
            buffer,
            index,
        }
    }
}

/// The closed set of operation kinds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub enum Instruction {
    Start,
    Send,
    Recv,
    Copy,
    Reduce,
    /// Fused: `recv(src→X) ; send(X→dst)`.
    RecvCopySend,
    /// Unfused receive-side of a reduce: `recv + reduce + copy` in one step.
    RecvReduceCopy,
    /// Fused: `recv_reduce_copy(src→X) ; send(X→dst) ; recv(_→X)`.
    RecvReduceSend,
    /// Fused: `recv_reduce_copy(src→X) ; send(X→dst)`.
    RecvReduceCopySend,
}

impl Instruction {
    /// True for op kinds whose TB must agree with `dst.rank` as a send peer.
    pub fn is_send(self) -> bool {
        matches!(self, Instruction::Send)
    }

    /// True for op kinds whose TB must agree with `src.rank` as a recv peer.
    pub fn is_recv(self) -> bool {
        matches!(self, Instruction::Recv)
    }

    /// True for ops schedulers skip entirely: local data movement with no TB peer.
    pub fn is_copy(self) -> bool {
        matches!(self, Instruction::Copy)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Instruction::Start => "start",
            Instruction::Send => "send",
            Instruction::Recv => "recv",
            Instruction::Copy => "copy",
            Instruction::Reduce => "reduce",
            Instruction::RecvCopySend => "rcs",
            Instruction::RecvReduceCopy => "rrc",
            Instruction::RecvReduceSend => "rrs",
            Instruction::RecvReduceCopySend => "rrcs",
        };
        write!(f, "{s}")
    }
}

/// A single IR operation.
///
/// Ops live in a per-rank arena (`rank_dag::RankDag::ops`); every
/// cross-reference (`depends`, `matched`, `creator`) is a plain [`OpId`] index
/// rather than an owning pointer.
#[derive(Clone, Debug, Serialize)]
pub struct Op {
    pub id: OpId,
    pub inst: Instruction,
    pub src: ChunkRef,
    pub dst: ChunkRef,
    pub depends: Vec<OpId>,
    pub matched: Option<OpId>,
    /// Assigned thread-block id, or `-1` if unassigned.
    pub tb: i32,
    /// Assigned channel id, or `-1` if unassigned/wildcard.
    pub channel: i32,
    /// Position within the owning TB's ordered op list, or `-1` before assignment.
    pub step: i32,
    pub chunk_step: u32,
    pub priority: i32,
}

impl Op {
    pub fn new(id: OpId, inst: Instruction, src: ChunkRef, dst: ChunkRef, depends: Vec<OpId>) -> Self {
        Self {
            id,
            inst,
            src,
            dst,
            depends,
            matched: None,
            tb: -1,
            channel: -1,
            step: -1,
            chunk_step: 0,
            priority: 0,
        }
    }

    /// `(priority, chunk_step, id)` heap key, minimum-first.
    pub fn heap_key(&self) -> (i32, u32, OpId) {
        (self.priority, self.chunk_step, self.id)
    }
}

/// A serialized lane of ops on one rank, pinned to at most one send peer, one
/// recv peer, and one channel.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Threadblock {
    pub send: i32,
    pub recv: i32,
    pub channel: i32,
    pub ops: Vec<OpId>,
}

impl Threadblock {
    pub fn new(send: i32, recv: i32, channel: i32) -> Self {
        Self {
            send,
            recv,
            channel,
            ops: Vec::new(),
        }
    }
}

/// Per-rank: the rank id, its resolved op arena, and its ordered
/// thread-blocks (whose `ops` are indices into `ops`), ready for emission.
#[derive(Clone, Debug, Serialize)]
pub struct GpuRecord {
    pub rank: RankId,
    pub ops: Vec<Op>,
    pub threadblocks: Vec<Threadblock>,
}

impl GpuRecord {
    pub fn op(&self, id: OpId) -> &Op {
        &self.ops[id.raw() as usize]
    }
}

/// The top-level compiled artifact handed to a [`crate::xml_sink::ScheduleSink`].
#[derive(Clone, Debug, Serialize)]
pub struct Program {
    pub name: String,
    pub collective: String,
    /// Opaque protocol string, passed through untouched.
    pub protocol: String,
    /// Opaque threadblock-count hint, passed through untouched.
    pub threadblocks_hint: i32,
    pub gpus: Vec<GpuRecord>,
}
