//! Per-rank dependency graph keyed by buffer slots.
//!
//! Ops are stored in a per-rank arena indexed by [`OpId`] rather than behind
//! shared pointers; `depends`/`matched`
//! are plain indices into that arena. A synthetic `Start` op is the unique
//! root: every op with no other predecessor is treated as depending on it.
//!
//! Walkable order is reconstructed from a snapshot of nodes keyed by id plus
//! each op's `depends` list, rather than a separate edge list.

use crate::ir::{Buffer, Op, Threadblock};
use crate::op_id::{OpId, RankId};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// The addressable location `(buffer, index)` on this DAG's rank.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Slot {
    pub buffer: Buffer,
    pub index: usize,
}

impl Slot {
    pub fn new(buffer: Buffer, index: usize) -> Self {
        Self { buffer, index }
    }
}

/// One rank's op arena plus the slot→last-writer map used for dependency
/// tracking.
pub struct RankDag {
    pub rank: RankId,
    ops: Vec<Op>,
    start: OpId,
    writers: HashMap<Slot, OpId>,
    /// Threadblocks assigned on this rank, keyed by tb id (`assign.rs`).
    pub tbs: BTreeMap<i32, Threadblock>,
    /// Ops fused away by `fusion.rs`: still present in the arena (so ids and
    /// `depends`/`matched` edges stay valid) but skipped by every later pass.
    dead: HashSet<OpId>,
}

impl RankDag {
    pub fn new(rank: RankId) -> Self {
        let start_id = OpId::new(0);
        let start = Op::new(
            start_id,
            crate::ir::Instruction::Start,
            crate::ir::ChunkRef::new(rank, Buffer::Input, 0, 0),
            crate::ir::ChunkRef::new(rank, Buffer::Input, 0, 0),
            Vec::new(),
        );
        Self {
            rank,
            ops: vec![start],
            start: start_id,
            writers: HashMap::new(),
            tbs: BTreeMap::new(),
            dead: HashSet::new(),
        }
    }

    /// Marks `id` as fused away. `walk_from_start` and `children` skip it.
    pub fn mark_dead(&mut self, id: OpId) {
        self.dead.insert(id);
    }

    pub fn is_dead(&self, id: OpId) -> bool {
        self.dead.contains(&id)
    }

    pub fn start_id(&self) -> OpId {
        self.start
    }

    /// Reserve the next arena slot and record `op` there. `op.id` must equal
    /// the id this call returns (callers build the op with a pre-reserved id
    /// via [`RankDag::next_id`]).
    pub fn push(&mut self, op: Op) -> OpId {
        let id = op.id;
        debug_assert_eq!(id.raw() as usize, self.ops.len());
        self.ops.push(op);
        id
    }

    /// The id that the next [`RankDag::push`] call will assign.
    pub fn next_id(&self) -> OpId {
        OpId::new(self.ops.len() as u32)
    }

    pub fn op(&self, id: OpId) -> &Op {
        &self.ops[id.raw() as usize]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Op {
        &mut self.ops[id.raw() as usize]
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut [Op] {
        &mut self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.len() <= 1
    }

    /// The op currently holding the right to write `slot`, if any.
    pub fn writer_of(&self, slot: &Slot) -> Option<OpId> {
        self.writers.get(slot).copied()
    }

    /// Record that `writer` is now the last op to have written `slot`.
    pub fn set_writer(&mut self, slot: Slot, writer: OpId) {
        self.writers.insert(slot, writer);
    }

    /// The `[index, index + size)` slots of `buffer` on this rank.
    fn slots_for(buffer: &Buffer, index: usize, size: usize) -> Vec<Slot> {
        (0..size).map(|i| Slot::new(buffer.clone(), index + i)).collect()
    }

    /// Record that `op` touches (reads or writes) every slot in
    /// `[index, index + size)`, returning the distinct ops that previously
    /// touched any of those slots as its dependency set, then installs `op`
    /// as the new last toucher of each. Applying this on every read *and*
    /// every write keeps each slot's touches in one linear order, widening
    /// the "depends on the current writer, then becomes it" rule to reads
    /// so a send cannot be reordered ahead of an earlier read of the same
    /// slot.
    pub fn touch(&mut self, buffer: &Buffer, index: usize, size: usize, op: OpId) -> Vec<OpId> {
        let mut deps = Vec::new();
        for slot in Self::slots_for(buffer, index, size) {
            if let Some(prev) = self.writers.insert(slot, op) {
                if !deps.contains(&prev) {
                    deps.push(prev);
                }
            }
        }
        deps
    }

    /// `depends`, substituting the synthetic `Start` op when an op has no
    /// other predecessor.
    pub fn effective_depends(&self, id: OpId) -> Vec<OpId> {
        let op = self.op(id);
        if op.depends.is_empty() && id != self.start {
            vec![self.start]
        } else {
            op.depends.clone()
        }
    }

    /// Visit every non-`Start` op reachable from `Start`, each exactly once,
    /// as a breadth-first traversal over the `depends` edges reversed.
    pub fn walk_from_start(&self) -> Vec<OpId> {
        let children = self.children();
        let mut visited = vec![false; self.ops.len()];
        visited[self.start.raw() as usize] = true;
        let mut queue: VecDeque<OpId> = children.get(&self.start).cloned().unwrap_or_default().into();
        let mut order = Vec::new();
        while let Some(id) = queue.pop_front() {
            if visited[id.raw() as usize] {
                continue;
            }
            visited[id.raw() as usize] = true;
            order.push(id);
            if let Some(next) = children.get(&id) {
                queue.extend(next.iter().copied());
            }
        }
        order
    }

    /// Build the `pred -> successors` adjacency implied by every op's
    /// effective `depends`.
    fn children(&self) -> HashMap<OpId, Vec<OpId>> {
        let mut children: HashMap<OpId, Vec<OpId>> = HashMap::new();
        for op in &self.ops {
            if op.id == self.start || self.is_dead(op.id) {
                continue;
            }
            for dep in self.effective_depends(op.id) {
                children.entry(dep).or_default().push(op.id);
            }
        }
        children
    }

    /// Drops any now-dead (fused-away) ids from each threadblock's op list,
    /// sorts what remains by `(priority, chunk_step, id)`, and writes the
    /// resulting positions back into each op's `step`. Called once
    /// assignment is complete, and again after fusion tombstones ops out of
    /// threadblocks that already held a step numbering.
    pub fn finalize_steps(&mut self) {
        {
            let ops = &self.ops;
            let dead = &self.dead;
            for tb in self.tbs.values_mut() {
                tb.ops.retain(|id| !dead.contains(id));
                tb.ops.sort_by_key(|id| ops[id.raw() as usize].heap_key());
            }
        }
        let assignments: Vec<(OpId, i32)> = self
            .tbs
            .values()
            .flat_map(|tb| tb.ops.iter().enumerate().map(|(i, id)| (*id, i as i32)))
            .collect();
        for (id, step) in assignments {
            self.op_mut(id).step = step;
        }
    }

    /// Ops that directly depend on `id` (via effective `depends`), excluding
    /// dead ops, in ascending id order. Used by `fusion.rs` to find a unique
    /// local consumer of a chunk.
    pub fn consumers_of(&self, id: OpId) -> Vec<OpId> {
        let mut out: Vec<OpId> = self
            .ops
            .iter()
            .filter(|op| op.id != self.start && !self.is_dead(op.id))
            .filter(|op| self.effective_depends(op.id).contains(&id))
            .map(|op| op.id)
            .collect();
        out.sort();
        out
    }
}
