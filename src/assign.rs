//! Thread-block and channel assignment.
//!
//! `compatible` is the single predicate both assignment modes share: a
//! threadblock may host an op only if its fixed send peer, recv peer, and
//! channel each either match the op's or are still the `-1` wildcard. The
//! heap-ordered greedy placement loop walks a priority-ordered queue,
//! seeding or joining a threadblock one op at a time.

use crate::error::CompileError;
use crate::ir::{Instruction, Op, Threadblock};
use crate::op_id::OpId;
use crate::rank_dag::RankDag;
use std::collections::HashMap;

/// The rank this op must send to, or `-1` if it has no send side.
pub(crate) fn send_peer(op: &Op) -> i32 {
    match op.inst {
        Instruction::Send | Instruction::RecvCopySend | Instruction::RecvReduceSend | Instruction::RecvReduceCopySend => op.dst.rank.0 as i32,
        _ => -1,
    }
}

/// The rank this op must receive from, or `-1` if it has no recv side.
pub(crate) fn recv_peer(op: &Op) -> i32 {
    match op.inst {
        Instruction::Recv | Instruction::RecvCopySend | Instruction::RecvReduceCopy | Instruction::RecvReduceSend | Instruction::RecvReduceCopySend => {
            op.src.rank.0 as i32
        }
        _ => -1,
    }
}

/// Whether `tb` can host `op`: each of send peer, recv peer, and channel
/// must agree, where `-1` on either side is a wildcard.
pub fn compatible(tb: &Threadblock, op: &Op) -> bool {
    let s = send_peer(op);
    let r = recv_peer(op);
    let ch = op.channel;
    (s == -1 || tb.send == -1 || tb.send == s)
        && (r == -1 || tb.recv == -1 || tb.recv == r)
        && (ch == -1 || tb.channel == -1 || tb.channel == ch)
}

/// Every non-dead, non-`Start`, non-`Copy` op, in heap order, with `tb`/`step`
/// reset to unassigned first.
///
/// `sendtb`/`recvtb` default to a concrete rank id at construction time (see
/// `Ref::send`), which is meaningful only for manual assignment; automatic
/// assignment must not mistake that construction-time default for a prior
/// auto-placement, so it resets every op's `tb`/`step` and clears the dag's
/// threadblock table before recomputing from scratch. This also makes
/// re-running automatic assignment on the same dag idempotent, since each
/// call starts from the same reset state.
fn reset_and_order(dag: &mut RankDag) -> Vec<OpId> {
    let ids: Vec<OpId> = dag
        .ops()
        .iter()
        .filter(|o| o.id != dag.start_id() && !dag.is_dead(o.id) && !o.inst.is_copy())
        .map(|o| o.id)
        .collect();
    for &id in &ids {
        let op = dag.op_mut(id);
        op.tb = -1;
        op.step = -1;
    }
    dag.tbs.clear();
    let mut order = ids;
    order.sort_by_key(|id| dag.op(*id).heap_key());
    order
}

fn place(dag: &mut RankDag, tb_id: i32, op: &Op, conflict_err: impl FnOnce() -> CompileError) -> Result<(), CompileError> {
    let tb = dag.tbs.entry(tb_id).or_insert_with(|| Threadblock::new(-1, -1, -1));
    if !compatible(tb, op) {
        return Err(conflict_err());
    }
    let s = send_peer(op);
    if s != -1 {
        tb.send = s;
    }
    let r = recv_peer(op);
    if r != -1 {
        tb.recv = r;
    }
    if op.channel != -1 {
        tb.channel = op.channel;
    }
    let resolved_channel = tb.channel;
    tb.ops.push(op.id);
    let placed = dag.op_mut(op.id);
    placed.tb = tb_id;
    if placed.channel == -1 && resolved_channel != -1 {
        placed.channel = resolved_channel;
    }
    tracing::debug!(rank = ?dag.rank, op = %op.id, tb = tb_id, "placed op on threadblock");
    Ok(())
}

/// Validates and finalizes ops the caller already tagged with `op.tb` (a
/// manual schedule), rejecting conflicting peer/channel assignments on the
/// same TB with `TBConflict`.
pub fn assign_manual(dag: &mut RankDag) -> Result<(), CompileError> {
    let order: Vec<OpId> = dag
        .ops()
        .iter()
        .filter(|o| o.id != dag.start_id() && !dag.is_dead(o.id) && !o.inst.is_copy() && o.tb >= 0 && o.step < 0)
        .map(|o| o.id)
        .collect();

    for id in order {
        let op = dag.op(id).clone();
        let tb_id = op.tb;
        place(dag, tb_id, &op, || CompileError::TBConflict {
            rank: dag.rank,
            tb: tb_id,
            op: id,
            invariant: "send/recv/channel mismatch on manually assigned threadblock".to_string(),
        })?;
    }
    dag.finalize_steps();
    tracing::info!(rank = ?dag.rank, threadblocks = dag.tbs.len(), "manual threadblock assignment complete");
    Ok(())
}

/// Automatic two-phase greedy assignment:
///
/// 1. Every op with a send or recv peer seeds (or joins) one base
///    threadblock per distinct `(send, recv, channel)` combination, visited
///    in heap order so placement is deterministic.
/// 2. Every remaining local op (currently only `Reduce`; `Copy` is skipped
///    entirely and never assigned a TB) joins the least-loaded compatible
///    existing threadblock, or seeds a new one if none is compatible.
pub fn assign_auto(dag: &mut RankDag) -> Result<(), CompileError> {
    let order = reset_and_order(dag);
    let mut base_ids: HashMap<(i32, i32, i32), i32> = HashMap::new();
    let mut next_tb = 0i32;

    for &id in &order {
        let op = dag.op(id).clone();
        let s = send_peer(&op);
        let r = recv_peer(&op);
        if s == -1 && r == -1 {
            continue;
        }
        let key = (s, r, op.channel.max(0));
        let tb_id = *base_ids.entry(key).or_insert_with(|| {
            let t = next_tb;
            next_tb += 1;
            t
        });
        place(dag, tb_id, &op, || CompileError::NoAssignment {
            rank: dag.rank,
            op: id,
            invariant: "base threadblock seeded for this peer/channel is incompatible".to_string(),
        })?;
    }

    for &id in &order {
        let op = dag.op(id).clone();
        if op.tb != -1 {
            continue;
        }
        let chosen = dag
            .tbs
            .iter()
            .filter(|(_, tb)| compatible(tb, &op))
            .min_by_key(|(_, tb)| tb.ops.len())
            .map(|(id, _)| *id);
        let tb_id = chosen.unwrap_or_else(|| {
            let t = next_tb;
            next_tb += 1;
            t
        });
        place(dag, tb_id, &op, || CompileError::NoAssignment {
            rank: dag.rank,
            op: id,
            invariant: "no compatible threadblock for local op".to_string(),
        })?;
    }

    dag.finalize_steps();
    tracing::info!(rank = ?dag.rank, threadblocks = dag.tbs.len(), "automatic threadblock assignment complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Buffer, ChunkRef};
    use crate::op_id::RankId;

    fn push(dag: &mut RankDag, inst: Instruction, src: ChunkRef, dst: ChunkRef, depends: Vec<OpId>) -> OpId {
        let id = dag.next_id();
        dag.push(Op::new(id, inst, src, dst, depends))
    }

    #[test]
    fn auto_assignment_groups_same_peer_into_one_tb() {
        let rank = RankId(1);
        let mut dag = RankDag::new(rank);
        let remote = ChunkRef::new(RankId(0), Buffer::Input, 0, 1);
        let a = push(&mut dag, Instruction::Recv, remote.clone(), ChunkRef::new(rank, Buffer::Output, 0, 1), vec![dag.start_id()]);
        let b = push(&mut dag, Instruction::Recv, remote, ChunkRef::new(rank, Buffer::Output, 1, 1), vec![dag.start_id()]);

        assign_auto(&mut dag).unwrap();
        assert_eq!(dag.op(a).tb, dag.op(b).tb);
        assert_eq!(dag.tbs.len(), 1);
    }

    #[test]
    fn manual_assignment_rejects_conflicting_peers_on_one_tb() {
        let rank = RankId(1);
        let mut dag = RankDag::new(rank);
        let mut a = Op::new(
            dag.next_id(),
            Instruction::Recv,
            ChunkRef::new(RankId(0), Buffer::Input, 0, 1),
            ChunkRef::new(rank, Buffer::Output, 0, 1),
            vec![dag.start_id()],
        );
        a.tb = 0;
        let a_id = dag.push(a);

        let mut b = Op::new(
            dag.next_id(),
            Instruction::Recv,
            ChunkRef::new(RankId(2), Buffer::Input, 0, 1),
            ChunkRef::new(rank, Buffer::Output, 1, 1),
            vec![dag.start_id()],
        );
        b.tb = 0;
        dag.push(b);

        let err = assign_manual(&mut dag).unwrap_err();
        assert!(matches!(err, CompileError::TBConflict { .. }));
        let _ = a_id;
    }
}
