//! The emitter facade: runs fusion and assignment over
//! every rank, checks the cross-rank send/recv matching invariant, and hands
//! the finished [`Program`] to whichever [`crate::xml_sink::ScheduleSink`]
//! the caller chose. The facade walks a finished, validated structure and
//! delegates the actual output step to a trait object rather than knowing
//! about any one format itself.

use crate::assign;
use crate::builder::ProgramBuilder;
use crate::error::CompileError;
use crate::fusion;
use crate::ir::{GpuRecord, Instruction, Program, Threadblock};
use crate::op_id::{OpId, RankId};
use crate::rank_dag::RankDag;

/// Which assignment pass `compile` should run per rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignMode {
    /// Validate ops the caller pre-tagged with `op.tb` via `assign::assign_manual`.
    Manual,
    /// Let `assign::assign_auto` place every op.
    Auto,
}

/// Runs assignment, then fusion, then validation, over every rank in
/// `builder`, producing a self-contained [`Program`] ready for a sink.
///
/// Assignment runs first, across every rank, because fusion only fuses ops
/// that already share a threadblock; only after every rank is assigned does
/// a cross-rank pass fill in any channel a matched op's peer resolved that
/// this op's own assignment left wildcard, since a send and its matching
/// recv can land on different ranks. Steps are renumbered after fusion to
/// account for the ops it tombstones.
pub fn compile(builder: &ProgramBuilder, mode: AssignMode) -> Result<Program, CompileError> {
    for r in 0..builder.rank_count() {
        let rank = RankId(r);
        builder.with_rank_dag(rank, |dag| -> Result<(), CompileError> {
            match mode {
                AssignMode::Manual => assign::assign_manual(dag),
                AssignMode::Auto => assign::assign_auto(dag),
            }
        })?;
    }

    builder.propagate_matched_channels();

    let mut gpus = Vec::with_capacity(builder.rank_count() as usize);
    for r in 0..builder.rank_count() {
        let rank = RankId(r);
        let gpu = builder.with_rank_dag(rank, |dag| -> Result<GpuRecord, CompileError> {
            fusion::run(dag);
            dag.finalize_steps();
            validate(dag)?;
            let threadblocks: Vec<Threadblock> = dag.tbs.values().cloned().collect();
            Ok(GpuRecord {
                rank,
                ops: dag.ops().to_vec(),
                threadblocks,
            })
        })?;
        gpus.push(gpu);
    }

    let program = Program {
        name: builder.name(),
        collective: builder.collective_name(),
        protocol: builder.protocol(),
        threadblocks_hint: builder.threadblocks_hint(),
        gpus,
    };

    tracing::info!(
        ranks = program.gpus.len(),
        total_threadblocks = program.gpus.iter().map(|g| g.threadblocks.len()).sum::<usize>(),
        "compiled program"
    );
    Ok(program)
}

/// Every `Send` reachable from `Start` must have a live `matched` `Recv`
/// counterpart and vice versa. `Copy`,
/// `Reduce`, and `Start` have no peer to match.
fn validate(dag: &RankDag) -> Result<(), CompileError> {
    for id in dag.walk_from_start() {
        let op = dag.op(id);
        let has_peer = matches!(
            op.inst,
            Instruction::Send
                | Instruction::Recv
                | Instruction::RecvCopySend
                | Instruction::RecvReduceCopy
                | Instruction::RecvReduceSend
                | Instruction::RecvReduceCopySend
        );
        if !has_peer {
            continue;
        }
        match op.matched {
            Some(m) if !dag.is_dead(m) => {}
            _ => return Err(unmatched(dag, id)),
        }
    }
    Ok(())
}

fn unmatched(dag: &RankDag, id: OpId) -> CompileError {
    CompileError::Unmatched {
        rank: dag.rank,
        op: id,
        invariant: "send/recv pair must both be present and live at emission".to_string(),
    }
}
