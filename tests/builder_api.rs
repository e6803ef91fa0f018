//! Builder surface errors, driven through `ProgramFixture`.

use loomc::builder::ProgramScope;
use loomc::emit::{compile, AssignMode};
use loomc::error::CompileError;
use loomc::ir::{Buffer, Instruction};
use loomc::op_id::RankId;
use loomc::testing::ProgramFixture;

#[test]
fn input_rejects_a_chunk_range_outside_the_seeded_precondition() {
    let fixture = ProgramFixture::allreduce(4);
    let builder = fixture.builder("missing_chunk");
    let err = builder.input(RankId(1), 0, 1).unwrap_err();
    assert!(matches!(err, CompileError::MissingChunk { rank, .. } if rank == RankId(1)));
}

#[test]
fn create_scratch_rejects_a_duplicate_name_on_one_rank() {
    let fixture = ProgramFixture::allreduce(4);
    let builder = fixture.builder("dup_scratch");
    builder.create_scratch(RankId(0), "acc", 1).unwrap();
    let err = builder.create_scratch(RankId(0), "acc", 1).unwrap_err();
    assert!(matches!(err, CompileError::DuplicateScratch { .. }));
}

#[test]
fn split_rejects_a_size_not_evenly_divisible() {
    let fixture = ProgramFixture::allreduce(4);
    let builder = fixture.builder("bad_split");
    let chunk = builder.input(RankId(1), 1, 1).unwrap();
    let err = chunk.split(3).unwrap_err();
    assert!(matches!(err, CompileError::BadSplit { k: 3, .. }));
}

#[test]
fn split_then_group_recovers_the_original_range() {
    let fixture = ProgramFixture::allreduce(4);
    let builder = fixture.builder("split_group");
    builder.create_scratch(RankId(0), "wide", 4).unwrap();
    let whole = builder.input(RankId(0), 0, 1).unwrap().copy(Buffer::Scratch("wide".to_string()), 0, 4, None, None).unwrap();

    let parts = whole.split(4).unwrap();
    assert_eq!(parts.len(), 4);
    assert!(parts.iter().all(|p| p.size() == 1));
    let regrouped = parts[0].group(&parts[1]).group(&parts[2]).group(&parts[3]);
    assert_eq!(regrouped.size(), 4);
}

#[test]
fn nested_scope_entry_is_rejected() {
    let fixture = ProgramFixture::allreduce(2);
    let builder = fixture.builder("nested");
    let outer = ProgramScope::enter(builder.clone()).unwrap();
    let err = ProgramScope::enter(builder).unwrap_err();
    assert!(matches!(err, CompileError::NestedContext));
    outer.exit().unwrap();
}

#[test]
fn exit_without_context_is_rejected() {
    let fixture = ProgramFixture::allreduce(2);
    let builder = fixture.builder("bad_exit");
    let scope = ProgramScope::enter(builder).unwrap();
    scope.exit().unwrap();
    assert!(matches!(loomc::builder::current(), Err(CompileError::NoContext)));
}

#[test]
fn wait_does_not_prevent_further_chaining() {
    let fixture = ProgramFixture::allreduce(2);
    let builder = fixture.builder("wait");
    let chunk = builder.input(RankId(0), 0, 1).unwrap();
    let waited = chunk.wait();
    assert_eq!(waited.size(), chunk.size());
    assert_eq!(waited.rank(), chunk.rank());
    // a send recorded off the waited ref still compiles cleanly
    waited.send(RankId(1), Buffer::Output, 0, 1, None, None, None).unwrap();
    let program = compile(&builder, AssignMode::Auto).unwrap();
    loomc::testing::assert_schedule_invariants(&program);
}

#[test]
fn manual_assignment_channel_propagates_to_the_matched_op() {
    let fixture = ProgramFixture::allreduce(2);
    let builder = fixture.builder("channel_propagation");
    let chunk = builder.input(RankId(0), 0, 1).unwrap();
    chunk.send(RankId(1), Buffer::Output, 0, 1, Some(0), Some(0), Some(2)).unwrap();

    let program = compile(&builder, AssignMode::Manual).unwrap();
    for gpu in &program.gpus {
        for op in &gpu.ops {
            if matches!(op.inst, Instruction::Send | Instruction::Recv) {
                assert_eq!(op.channel, 2);
            }
        }
    }
}

#[test]
fn manual_assignment_propagates_an_unresolved_send_channel_from_its_matched_recv() {
    // The send's own threadblock never resolves a concrete channel on its own
    // (it is the only op placed there); the matching recv shares a
    // threadblock with another recv from the same peer that does carry an
    // explicit channel, so only cross-rank propagation from the matched recv
    // can settle the send's channel.
    let fixture = ProgramFixture::allreduce(2);
    let builder = fixture.builder("cross_rank_channel_propagation");
    let chunk = builder.input(RankId(0), 0, 1).unwrap();
    chunk.send(RankId(1), Buffer::Output, 0, 1, Some(6), Some(3), Some(2)).unwrap();
    chunk.send(RankId(1), Buffer::Output, 1, 1, Some(5), Some(3), Some(-1)).unwrap();

    let program = compile(&builder, AssignMode::Manual).unwrap();
    let sender = program.gpus.iter().find(|g| g.rank == RankId(0)).unwrap();
    let send = sender.ops.iter().find(|op| op.inst == Instruction::Send && op.tb == 5).unwrap();
    assert_eq!(send.channel, 2);
}

#[test]
fn manual_assignment_rejects_two_destinations_on_one_threadblock() {
    let fixture = ProgramFixture::allreduce(3);
    let builder = fixture.builder("tb_conflict");
    let a = builder.input(RankId(0), 0, 1).unwrap();
    // Same source chunk, same manually assigned send-side TB, two different
    // destinations: the second send's peer conflicts with the first's.
    a.send(RankId(1), Buffer::Output, 0, 1, Some(9), Some(9), Some(0)).unwrap();
    a.send(RankId(2), Buffer::Output, 0, 1, Some(9), Some(9), Some(0)).unwrap();

    let err = compile(&builder, AssignMode::Manual).unwrap_err();
    assert!(matches!(err, CompileError::TBConflict { tb: 9, .. }));
}
