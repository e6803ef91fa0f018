//! Peephole fusion passes over one rank's op arena.
//!
//! Each pass looks for a short, fixed chain of adjacent ops that share a
//! single intermediate chunk and rewrites the earlier op in place into the
//! fused instruction, marking the later op(s) dead rather than removing them
//! — ids stay stable so `depends`/`matched` edges elsewhere in the arena
//! never dangle. Each rule walks a linear op sequence looking for a local
//! pattern and splices the match back into place rather than rebuilding the
//! whole sequence.
//!
//! All three rules skip when either operand's chunk has `size > 1`
//! — multi-chunk fusion is out of scope. Every rule also requires the
//! matched ops to already share the same `tb`: fusion runs after
//! assignment, and ops headed for different threadblocks must stay separate
//! regardless of how their chunks line up.

use crate::ir::Instruction;
use crate::rank_dag::RankDag;

/// Outcome of one fusion pass over a rank, for logging and tests.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionStats {
    pub recv_copy_send: usize,
    pub recv_reduce_copy_send: usize,
    pub recv_reduce_send: usize,
}

impl FusionStats {
    pub fn total(&self) -> usize {
        self.recv_copy_send + self.recv_reduce_copy_send + self.recv_reduce_send
    }
}

/// Runs all three peephole rules over `dag` to a fixed point: fusing one op
/// can expose another (e.g. a freshly minted `RecvCopySend` never
/// re-triggers a rule here, but repeated passes keep the implementation
/// simple and robust to ordering rather than relying on a single top-to-
/// bottom sweep finding every match).
pub fn run(dag: &mut RankDag) -> FusionStats {
    let mut stats = FusionStats::default();
    loop {
        let round = one_pass(dag);
        if round.total() == 0 {
            break;
        }
        stats.recv_copy_send += round.recv_copy_send;
        stats.recv_reduce_copy_send += round.recv_reduce_copy_send;
        stats.recv_reduce_send += round.recv_reduce_send;
    }
    stats
}

fn one_pass(dag: &mut RankDag) -> FusionStats {
    let mut stats = FusionStats::default();
    let candidates: Vec<_> = dag
        .ops()
        .iter()
        .filter(|op| matches!(op.inst, Instruction::Recv | Instruction::RecvReduceCopy))
        .map(|op| op.id)
        .collect();

    for id in candidates {
        if dag.is_dead(id) {
            continue;
        }
        let op = dag.op(id);
        if op.dst.size != 1 {
            continue;
        }
        let inst = op.inst;
        let tb = op.tb;
        let consumers = dag.consumers_of(id);
        let sends: Vec<_> = consumers
            .iter()
            .copied()
            .filter(|c| dag.op(*c).inst == Instruction::Send && dag.op(*c).src == dag.op(id).dst && dag.op(*c).tb == tb)
            .collect();

        match (inst, sends.len(), consumers.len()) {
            (Instruction::Recv, 1, 1) if dag.op(sends[0]).dst.size == 1 => {
                fuse_two(dag, id, sends[0], Instruction::RecvCopySend);
                stats.recv_copy_send += 1;
                tracing::debug!(rank = ?dag.rank, recv = %id, send = %sends[0], "fused recv+send into recv_copy_send");
            }
            (Instruction::RecvReduceCopy, 1, 1) if dag.op(sends[0]).dst.size == 1 => {
                fuse_two(dag, id, sends[0], Instruction::RecvReduceCopySend);
                stats.recv_reduce_copy_send += 1;
                tracing::debug!(rank = ?dag.rank, rrc = %id, send = %sends[0], "fused recv_reduce_copy+send into recv_reduce_copy_send");
            }
            (Instruction::RecvReduceCopy, 1, 2) if dag.op(sends[0]).dst.size == 1 => {
                let other = consumers.iter().copied().find(|c| *c != sends[0]);
                if let Some(other) = other {
                    if dag.op(other).inst == Instruction::Recv && dag.op(other).tb == tb {
                        fuse_two(dag, id, sends[0], Instruction::RecvReduceSend);
                        stats.recv_reduce_send += 1;
                        tracing::debug!(
                            rank = ?dag.rank,
                            rrc = %id,
                            send = %sends[0],
                            trailing_recv = %other,
                            "fused recv_reduce_copy+send into recv_reduce_send, left trailing recv in place"
                        );
                    }
                }
            }
            _ => {}
        }
    }
    stats
}

/// Rewrites `keep` in place to `fused`, absorbing `consume`'s `dst`, and
/// marks `consume` dead. `consume` has no local consumers of its own (a
/// `Send`'s destination chunk lives on the remote rank), so nothing else in
/// this rank's arena needs its edges rewritten.
fn fuse_two(dag: &mut RankDag, keep: crate::op_id::OpId, consume: crate::op_id::OpId, fused: Instruction) {
    let new_dst = dag.op(consume).dst.clone();
    let op = dag.op_mut(keep);
    op.inst = fused;
    op.dst = new_dst;
    dag.mark_dead(consume);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Buffer, ChunkRef, Op};
    use crate::op_id::RankId;

    fn push(dag: &mut RankDag, inst: Instruction, src: ChunkRef, dst: ChunkRef, depends: Vec<crate::op_id::OpId>) -> crate::op_id::OpId {
        let id = dag.next_id();
        let op = Op::new(id, inst, src, dst, depends);
        dag.push(op)
    }

    #[test]
    fn fuses_recv_then_send_into_recv_copy_send() {
        let rank = RankId(1);
        let mut dag = RankDag::new(rank);
        let remote = ChunkRef::new(RankId(0), Buffer::Input, 0, 1);
        let local = ChunkRef::new(rank, Buffer::Scratch("s".into()), 0, 1);
        let onward = ChunkRef::new(RankId(2), Buffer::Output, 0, 1);

        let recv = push(&mut dag, Instruction::Recv, remote, local.clone(), vec![dag.start_id()]);
        let send = push(&mut dag, Instruction::Send, local, onward, vec![recv]);

        let stats = run(&mut dag);
        assert_eq!(stats.recv_copy_send, 1);
        assert!(dag.is_dead(send));
        assert_eq!(dag.op(recv).inst, Instruction::RecvCopySend);
    }

    #[test]
    fn skips_fusion_when_chunk_size_exceeds_one() {
        let rank = RankId(1);
        let mut dag = RankDag::new(rank);
        let remote = ChunkRef::new(RankId(0), Buffer::Input, 0, 2);
        let local = ChunkRef::new(rank, Buffer::Scratch("s".into()), 0, 2);
        let onward = ChunkRef::new(RankId(2), Buffer::Output, 0, 2);

        let recv = push(&mut dag, Instruction::Recv, remote, local.clone(), vec![dag.start_id()]);
        let send = push(&mut dag, Instruction::Send, local, onward, vec![recv]);

        let stats = run(&mut dag);
        assert_eq!(stats.total(), 0);
        assert!(!dag.is_dead(send));
    }
}
