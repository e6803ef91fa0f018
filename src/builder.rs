//! The program builder: per-rank chunk bookkeeping, the `ChunkRef` fluent
//! surface (`send`/`copy`/`reduce`/`group`/`split`/`wait`), and the
//! context-scoped entry point programs are built under.
//!
//! The shared, clonable handle wraps an `Arc<Mutex<_>>` so every `Ref`
//! derived from a builder shares the same underlying per-rank state; the
//! single active-program slot and its `enter`/`exit` pair give programs a
//! context-scoped construction entry point without threading a builder
//! handle through every call site.

use crate::collective::Collective;
use crate::collective::Topology;
use crate::error::CompileError;
use crate::ir::{Buffer, Chunk, ChunkRef, Instruction, Op};
use crate::op_id::{OpId, RankId};
use crate::rank_dag::{RankDag, Slot};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Per-rank state the builder owns: the op arena (via `RankDag`) plus the
/// chunk-presence/origin bookkeeping `check()` reads.
struct RankState {
    dag: RankDag,
    chunks: std::collections::HashMap<Buffer, BTreeMap<usize, Chunk>>,
    scratch_sizes: BTreeMap<String, usize>,
}

impl RankState {
    fn new(rank: RankId) -> Self {
        Self {
            dag: RankDag::new(rank),
            chunks: std::collections::HashMap::new(),
            scratch_sizes: BTreeMap::new(),
        }
    }

    fn chunk_at(&self, buffer: &Buffer, index: usize) -> Option<&Chunk> {
        self.chunks.get(buffer).and_then(|m| m.get(&index))
    }

    fn install(&mut self, buffer: Buffer, index: usize, chunk: Chunk) {
        self.chunks.entry(buffer).or_default().insert(index, chunk);
    }

    fn has_range(&self, buffer: &Buffer, index: usize, size: usize) -> bool {
        (0..size).all(|i| self.chunk_at(buffer, index + i).is_some())
    }

    fn first_missing(&self, buffer: &Buffer, index: usize, size: usize) -> usize {
        (0..size)
            .find(|i| self.chunk_at(buffer, index + i).is_none())
            .map(|i| index + i)
            .unwrap_or(index)
    }
}

struct BuilderInner {
    name: String,
    collective_name: String,
    topology_name: String,
    protocol: String,
    threadblocks_hint: i32,
    ranks: Vec<RankState>,
}

/// The shared, clonable handle to a program under construction. Cloning is
/// cheap (an `Arc` bump) and every clone observes the same underlying state,
/// the same sharing model `pipeline.rs`'s `Pipeline` uses for its graph.
#[derive(Clone)]
pub struct ProgramBuilder {
    inner: Arc<Mutex<BuilderInner>>,
}

impl ProgramBuilder {
    /// Allocates one `RankDag` per rank in `topology` and seeds every rank's
    /// input buffer by walking `collective`'s chunk domain against its
    /// `precondition`.
    pub fn new(name: impl Into<String>, collective: &dyn Collective, topology: &dyn Topology) -> Self {
        let n = topology.num_ranks();
        let mut ranks: Vec<RankState> = (0..n).map(|r| RankState::new(RankId(r))).collect();
        for r in 0..n {
            let rank = RankId(r);
            for c in collective.chunks() {
                if collective.precondition(rank, c) {
                    ranks[r as usize].install(
                        Buffer::Input,
                        c,
                        Chunk {
                            origin_rank: rank,
                            origin_index: c,
                            rank,
                            buffer: Buffer::Input,
                            index: c,
                        },
                    );
                }
            }
        }
        Self {
            inner: Arc::new(Mutex::new(BuilderInner {
                name: name.into(),
                collective_name: collective.name().to_string(),
                topology_name: topology.name().to_string(),
                protocol: "Simple".to_string(),
                threadblocks_hint: -1,
                ranks,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().unwrap().name.clone()
    }

    pub fn collective_name(&self) -> String {
        self.inner.lock().unwrap().collective_name.clone()
    }

    pub fn topology_name(&self) -> String {
        self.inner.lock().unwrap().topology_name.clone()
    }

    pub fn protocol(&self) -> String {
        self.inner.lock().unwrap().protocol.clone()
    }

    pub fn set_protocol(&self, protocol: impl Into<String>) {
        self.inner.lock().unwrap().protocol = protocol.into();
    }

    pub fn threadblocks_hint(&self) -> i32 {
        self.inner.lock().unwrap().threadblocks_hint
    }

    pub fn set_threadblocks_hint(&self, hint: i32) {
        self.inner.lock().unwrap().threadblocks_hint = hint;
    }

    pub fn num_ranks(&self) -> u32 {
        self.inner.lock().unwrap().ranks.len() as u32
    }

    /// Returns the `ChunkRef` for `input[index..index+size]` on `rank`.
    pub fn input(&self, rank: RankId, index: usize, size: usize) -> Result<Ref, CompileError> {
        let inner = self.inner.lock().unwrap();
        let rs = &inner.ranks[rank.0 as usize];
        if !rs.has_range(&Buffer::Input, index, size) {
            return Err(CompileError::MissingChunk {
                rank,
                buffer: "input".to_string(),
                index: rs.first_missing(&Buffer::Input, index, size),
            });
        }
        drop(inner);
        Ok(Ref {
            builder: self.clone(),
            chunk: ChunkRef::new(rank, Buffer::Input, index, size),
            pending_dep: None,
        })
    }

    /// Allocates a named scratch buffer of `size` slots on `rank`. Fails
    /// with `DuplicateScratch` if `name` is already in use on that rank.
    pub fn create_scratch(&self, rank: RankId, name: impl Into<String>, size: usize) -> Result<(), CompileError> {
        let mut inner = self.inner.lock().unwrap();
        let name = name.into();
        let rs = &mut inner.ranks[rank.0 as usize];
        if rs.scratch_sizes.contains_key(&name) {
            return Err(CompileError::DuplicateScratch { rank, name });
        }
        rs.scratch_sizes.insert(name, size);
        Ok(())
    }

    /// Returns a handle into a named scratch buffer at `index`, provided
    /// something has already written there.
    pub fn scratch(&self, rank: RankId, name: &str, index: usize) -> Result<Ref, CompileError> {
        let inner = self.inner.lock().unwrap();
        let rs = &inner.ranks[rank.0 as usize];
        let buffer = Buffer::Scratch(name.to_string());
        if rs.chunk_at(&buffer, index).is_none() {
            return Err(CompileError::MissingChunk {
                rank,
                buffer: buffer.to_string(),
                index,
            });
        }
        drop(inner);
        Ok(Ref {
            builder: self.clone(),
            chunk: ChunkRef::new(rank, buffer, index, 1),
            pending_dep: None,
        })
    }

    /// Whether every rank/chunk pair `collective`'s postcondition names is
    /// populated in `output`. Advisory only: it returns `bool`, it does not
    /// raise.
    pub fn check(&self, collective: &dyn Collective) -> bool {
        let inner = self.inner.lock().unwrap();
        for (r, rs) in inner.ranks.iter().enumerate() {
            let rank = RankId(r as u32);
            for c in collective.chunks() {
                if collective.postcondition(rank, c) && rs.chunk_at(&Buffer::Output, c).is_none() {
                    return false;
                }
            }
        }
        true
    }

    /// Grants a `RankDag` for fusion/assignment to operate on, one rank at a time.
    pub(crate) fn with_rank_dag<T>(&self, rank: RankId, f: impl FnOnce(&mut RankDag) -> T) -> T {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.ranks[rank.0 as usize].dag)
    }

    /// After every rank has run its own assignment pass, fills in any
    /// still-wildcard `channel` on a matched op from its live counterpart's
    /// resolved channel. Each rank resolves its threadblocks independently,
    /// so a send and its matching recv can end up on different ranks and
    /// settle on different channels unless this runs across all of them at
    /// once.
    pub(crate) fn propagate_matched_channels(&self) {
        let mut inner = self.inner.lock().unwrap();
        let resolved: Vec<(usize, OpId, i32)> = inner
            .ranks
            .iter()
            .flat_map(|rs| {
                rs.dag.ops().iter().filter_map(|op| {
                    if rs.dag.is_dead(op.id) || op.channel == -1 {
                        return None;
                    }
                    let matched = op.matched?;
                    Some((matched_rank(op).0 as usize, matched, op.channel))
                })
            })
            .collect();
        for (rank_idx, id, channel) in resolved {
            let dag = &mut inner.ranks[rank_idx].dag;
            if dag.is_dead(id) {
                continue;
            }
            let op = dag.op_mut(id);
            if op.channel == -1 {
                op.channel = channel;
            }
        }
    }

    pub(crate) fn rank_count(&self) -> u32 {
        self.inner.lock().unwrap().ranks.len() as u32
    }
}

/// Copies the `Chunk` lineage from `(src_rank, src_buffer, src_index + i)` to
/// `(dst_rank, dst_buffer, dst_index + i)` for every `i` in `0..size`,
/// preserving `origin_rank`/`origin_index`. Falls back to
/// a fresh origin if the source slot was never installed, which should not
/// happen for a well-formed program but keeps this infallible.
fn install_chunk_range(
    ranks: &mut [RankState],
    src_rank: RankId,
    src_buffer: &Buffer,
    src_index: usize,
    dst_rank: RankId,
    dst_buffer: &Buffer,
    dst_index: usize,
    size: usize,
) {
    for i in 0..size {
        let src_chunk = ranks[src_rank.0 as usize]
            .chunk_at(src_buffer, src_index + i)
            .cloned()
            .unwrap_or(Chunk {
                origin_rank: src_rank,
                origin_index: src_index + i,
                rank: src_rank,
                buffer: src_buffer.clone(),
                index: src_index + i,
            });
        let dst_chunk = src_chunk.at(dst_rank, dst_buffer.clone(), dst_index + i);
        ranks[dst_rank.0 as usize].install(dst_buffer.clone(), dst_index + i, dst_chunk);
    }
}

/// A user-facing handle to a chunk, carrying the `ProgramBuilder` it was
/// obtained from so the fluent `send`/`copy`/`reduce`/`group`/`split`/`wait`
/// methods can record ops without the caller threading a builder reference
/// through every call. This splits the bare structural data (`ChunkRef`)
/// from the program-aware wrapper around it.
#[derive(Clone)]
pub struct Ref {
    builder: ProgramBuilder,
    pub chunk: ChunkRef,
    /// Set by `wait()`: an extra dependency the next recorded op should carry,
    /// without a new op having been recorded for it.
    pending_dep: Option<OpId>,
}

impl Ref {
    pub fn rank(&self) -> RankId {
        self.chunk.rank
    }

    pub fn size(&self) -> usize {
        self.chunk.size
    }

    /// Sends `[index, index+size)` of `buffer` on `dst` from this chunk.
    /// Records a `Send` on this rank and a matching `Recv` on `dst`, linked
    /// via `matched`. `sendtb`/`recvtb`/`channel`
    /// default to `dst`'s rank, this rank, and channel `0` respectively when
    /// left unset, mirroring the original's keyword defaults.
    pub fn send(
        &self,
        dst: RankId,
        buffer: Buffer,
        index: usize,
        size: usize,
        sendtb: Option<i32>,
        recvtb: Option<i32>,
        channel: Option<i32>,
    ) -> Result<Ref, CompileError> {
        let sendtb = sendtb.unwrap_or(dst.0 as i32);
        let recvtb = recvtb.unwrap_or(self.chunk.rank.0 as i32);
        let channel = channel.unwrap_or(0);
        let mut inner = self.builder.inner.lock().unwrap();
        let dst_chunk = do_send(
            &mut inner,
            &self.chunk,
            self.pending_dep,
            dst,
            buffer,
            index,
            size,
            sendtb,
            recvtb,
            channel,
        );
        Ok(Ref {
            builder: self.builder.clone(),
            chunk: dst_chunk,
            pending_dep: None,
        })
    }

    /// Copies this chunk to `[index, index+size)` of `buffer` on the same rank.
    pub fn copy(&self, buffer: Buffer, index: usize, size: usize, tb: Option<i32>, channel: Option<i32>) -> Result<Ref, CompileError> {
        let tb = tb.unwrap_or(-1);
        let channel = channel.unwrap_or(0);
        let mut inner = self.builder.inner.lock().unwrap();
        let dst_chunk = do_copy(&mut inner, &self.chunk, self.pending_dep, buffer, index, size, tb, channel);
        Ok(Ref {
            builder: self.builder.clone(),
            chunk: dst_chunk,
            pending_dep: None,
        })
    }

    /// Accumulates `other` into this chunk's slot. When `other` is the direct,
    /// still-unclaimed result of a `.send()` (its creator op is a `Recv`
    /// writing exactly `other`'s slot), the receive is rewritten in place into
    /// a `RecvReduceCopy` rather than recording a separate `Reduce` — this is
    /// how `RecvReduceCopy` ops come to exist at all, since the fusion passes
    /// only ever consume that instruction, never produce it. Otherwise this
    /// records a plain local `Reduce`.
    pub fn reduce(&self, other: &Ref, tb: Option<i32>, channel: Option<i32>) -> Result<Ref, CompileError> {
        let tb = tb.unwrap_or(-1);
        let channel = channel.unwrap_or(0);
        let mut inner = self.builder.inner.lock().unwrap();
        let dst_chunk = do_reduce(&mut inner, &self.chunk, &other.chunk, tb, channel);
        Ok(Ref {
            builder: self.builder.clone(),
            chunk: dst_chunk,
            pending_dep: None,
        })
    }

    /// Widens this reference's size to also cover `other`, which must
    /// immediately follow it in the same buffer on the same rank. This is a
    /// caller contract (like slice bounds), not a recoverable runtime
    /// condition, so a violation panics rather than returning a `CompileError`.
    pub fn group(&self, other: &Ref) -> Ref {
        assert!(
            self.chunk.contiguous_with(&other.chunk),
            "group: {:?} is not contiguous with {:?}",
            self.chunk,
            other.chunk
        );
        let mut chunk = self.chunk.clone();
        chunk.size += other.chunk.size;
        Ref {
            builder: self.builder.clone(),
            chunk,
            pending_dep: None,
        }
    }

    /// Splits this reference into `k` equal, contiguous parts.
    pub fn split(&self, k: usize) -> Result<Vec<Ref>, CompileError> {
        if k == 0 || self.chunk.size % k != 0 {
            return Err(CompileError::BadSplit {
                rank: self.chunk.rank,
                size: self.chunk.size,
                k,
            });
        }
        let part = self.chunk.size / k;
        Ok((0..k)
            .map(|i| {
                let mut chunk = self.chunk.clone();
                chunk.index = self.chunk.index + i * part;
                chunk.size = part;
                Ref {
                    builder: self.builder.clone(),
                    chunk,
                    pending_dep: None,
                }
            })
            .collect())
    }

    /// A no-op synchronization hint: the next op recorded from the returned
    /// `Ref` additionally depends on whoever currently holds this slot,
    /// without this call itself recording an op.
    pub fn wait(&self) -> Ref {
        let inner = self.builder.inner.lock().unwrap();
        let rs_dag = &inner.ranks[self.chunk.rank.0 as usize].dag;
        let dep = rs_dag.writer_of(&Slot::new(self.chunk.buffer.clone(), self.chunk.index));
        Ref {
            builder: self.builder.clone(),
            chunk: self.chunk.clone(),
            pending_dep: dep,
        }
    }
}

/// The rank holding `op`'s `matched` counterpart: the destination for a send
/// side, the source for a recv side.
fn matched_rank(op: &Op) -> RankId {
    match op.inst {
        Instruction::Send | Instruction::RecvCopySend | Instruction::RecvReduceSend | Instruction::RecvReduceCopySend => op.dst.rank,
        _ => op.src.rank,
    }
}

fn merge_dep(deps: &mut Vec<OpId>, dep: Option<OpId>) {
    if let Some(d) = dep {
        if !deps.contains(&d) {
            deps.push(d);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn do_send(
    inner: &mut BuilderInner,
    src: &ChunkRef,
    pending: Option<OpId>,
    dst_rank: RankId,
    buffer: Buffer,
    index: usize,
    size: usize,
    sendtb: i32,
    recvtb: i32,
    channel: i32,
) -> ChunkRef {
    let src_idx = src.rank.0 as usize;
    let dst_idx = dst_rank.0 as usize;

    let send_id;
    {
        let rs = &mut inner.ranks[src_idx];
        send_id = rs.dag.next_id();
        let mut deps = rs.dag.touch(&src.buffer, src.index, src.size, send_id);
        merge_dep(&mut deps, pending);
        let dst_stub = ChunkRef {
            rank: dst_rank,
            buffer: buffer.clone(),
            index,
            size,
            hops: src.hops + 1,
            creator: None,
        };
        let mut op = Op::new(send_id, Instruction::Send, src.clone(), dst_stub.clone(), deps);
        op.tb = sendtb;
        op.channel = channel;
        op.chunk_step = dst_stub.hops;
        rs.dag.push(op);
    }

    let recv_id;
    let dst_chunk;
    {
        let rs = &mut inner.ranks[dst_idx];
        recv_id = rs.dag.next_id();
        let deps = rs.dag.touch(&buffer, index, size, recv_id);
        dst_chunk = ChunkRef {
            rank: dst_rank,
            buffer: buffer.clone(),
            index,
            size,
            hops: src.hops + 1,
            creator: Some(recv_id),
        };
        let mut op = Op::new(recv_id, Instruction::Recv, src.clone(), dst_chunk.clone(), deps);
        op.tb = recvtb;
        op.channel = channel;
        op.chunk_step = dst_chunk.hops;
        op.matched = Some(send_id);
        rs.dag.push(op);
    }

    {
        let rs = &mut inner.ranks[src_idx];
        let op = rs.dag.op_mut(send_id);
        op.matched = Some(recv_id);
        op.dst = dst_chunk.clone();
    }

    install_chunk_range(&mut inner.ranks, src.rank, &src.buffer, src.index, dst_rank, &buffer, index, size);
    dst_chunk
}

fn do_copy(inner: &mut BuilderInner, src: &ChunkRef, pending: Option<OpId>, buffer: Buffer, index: usize, size: usize, tb: i32, channel: i32) -> ChunkRef {
    let idx = src.rank.0 as usize;
    let dst_chunk;
    {
        let rs = &mut inner.ranks[idx];
        let id = rs.dag.next_id();
        let mut deps = rs.dag.touch(&src.buffer, src.index, src.size, id);
        let extra = rs.dag.touch(&buffer, index, size, id);
        for d in extra {
            if !deps.contains(&d) {
                deps.push(d);
            }
        }
        merge_dep(&mut deps, pending);
        dst_chunk = ChunkRef {
            rank: src.rank,
            buffer: buffer.clone(),
            index,
            size,
            hops: src.hops + 1,
            creator: Some(id),
        };
        let mut op = Op::new(id, Instruction::Copy, src.clone(), dst_chunk.clone(), deps);
        op.tb = tb;
        op.channel = channel;
        op.chunk_step = dst_chunk.hops;
        rs.dag.push(op);
    }
    install_chunk_range(&mut inner.ranks, src.rank, &src.buffer, src.index, src.rank, &buffer, index, size);
    dst_chunk
}

fn do_reduce(inner: &mut BuilderInner, dst: &ChunkRef, other: &ChunkRef, tb: i32, channel: i32) -> ChunkRef {
    let idx = dst.rank.0 as usize;
    let rs = &mut inner.ranks[idx];

    if let Some(creator) = other.creator {
        let upgrade = rs.dag.op(creator).inst == Instruction::Recv && rs.dag.op(creator).dst == *other;
        if upgrade {
            let extra = rs.dag.touch(&dst.buffer, dst.index, dst.size, creator);
            let op = rs.dag.op_mut(creator);
            op.inst = Instruction::RecvReduceCopy;
            op.dst = dst.clone();
            for d in extra {
                if !op.depends.contains(&d) {
                    op.depends.push(d);
                }
            }
            op.tb = tb;
            op.channel = channel;
            let mut result = dst.clone();
            result.creator = Some(creator);
            return result;
        }
    }

    let id = rs.dag.next_id();
    let mut deps = rs.dag.touch(&dst.buffer, dst.index, dst.size, id);
    let extra = rs.dag.touch(&other.buffer, other.index, other.size, id);
    for d in extra {
        if !deps.contains(&d) {
            deps.push(d);
        }
    }
    let mut new_dst = dst.clone();
    new_dst.creator = Some(id);
    let mut op = Op::new(id, Instruction::Reduce, other.clone(), new_dst.clone(), deps);
    op.tb = tb;
    op.channel = channel;
    op.chunk_step = new_dst.hops;
    rs.dag.push(op);
    new_dst
}

static CURRENT: Mutex<Option<ProgramBuilder>> = Mutex::new(None);

/// RAII guard for the single process-wide active-program slot. `enter` fails
/// with `NestedContext` if a program is already active; dropping (or calling
/// `exit` explicitly) clears the slot, failing with `NoContext` if this guard
/// no longer matches what is active (mirrors the original's
/// `Process.__enter__`/`__exit__` pair over `_current_program`).
pub struct ProgramScope {
    builder: ProgramBuilder,
    exited: bool,
}

impl ProgramScope {
    pub fn enter(builder: ProgramBuilder) -> Result<Self, CompileError> {
        let mut slot = CURRENT.lock().unwrap();
        if slot.is_some() {
            return Err(CompileError::NestedContext);
        }
        *slot = Some(builder.clone());
        Ok(Self { builder, exited: false })
    }

    pub fn builder(&self) -> &ProgramBuilder {
        &self.builder
    }

    pub fn exit(mut self) -> Result<(), CompileError> {
        self.do_exit()
    }

    fn do_exit(&mut self) -> Result<(), CompileError> {
        if self.exited {
            return Ok(());
        }
        let mut slot = CURRENT.lock().unwrap();
        match slot.as_ref() {
            Some(active) if Arc::ptr_eq(&active.inner, &self.builder.inner) => {
                *slot = None;
                self.exited = true;
                Ok(())
            }
            _ => Err(CompileError::NoContext),
        }
    }
}

impl Drop for ProgramScope {
    fn drop(&mut self) {
        let _ = self.do_exit();
    }
}

/// Returns the currently active program, or `NoContext` if none is.
pub fn current() -> Result<ProgramBuilder, CompileError> {
    CURRENT.lock().unwrap().clone().ok_or(CompileError::NoContext)
}

/// Enters `builder`'s scope, runs `f`, then exits, propagating whichever
/// error `f` or the scope transition produced.
pub fn with_program<T>(builder: ProgramBuilder, f: impl FnOnce(&ProgramBuilder) -> anyhow::Result<T>) -> anyhow::Result<T> {
    let scope = ProgramScope::enter(builder)?;
    let result = f(scope.builder());
    scope.exit()?;
    result
}
