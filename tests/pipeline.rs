//! 2-node, 16-GPU linear pipeline: a single
//! chunk hops rank 0 → rank 15, one send per hop, alternating channel.

use loomc::collective::{Collective, FullyConnectedTopology, PipelineCollective};
use loomc::emit::{compile, AssignMode};
use loomc::ir::Buffer;
use loomc::op_id::RankId;
use loomc::testing::assert_schedule_invariants;
use loomc::ProgramBuilder;

const NUM_RANKS: u32 = 16;

fn build() -> anyhow::Result<(ProgramBuilder, PipelineCollective)> {
    let topology = FullyConnectedTopology::new(NUM_RANKS);
    let collective = PipelineCollective::new(NUM_RANKS as usize);
    let builder = ProgramBuilder::new("pipeline_2node", &collective, &topology);

    let mut chunk = builder.input(RankId(0), 0, 1)?;
    for hop in 0..NUM_RANKS - 1 {
        let channel = (hop % 2) as i32;
        chunk = chunk.send(RankId(hop + 1), Buffer::Output, 0, 1, None, None, Some(channel))?;
    }

    Ok((builder, collective))
}

#[test]
fn only_the_last_rank_requires_the_chunk_in_output() {
    let collective = PipelineCollective::new(NUM_RANKS as usize);
    for r in 0..NUM_RANKS - 1 {
        assert!(!collective.postcondition(RankId(r), 0));
    }
    assert!(collective.postcondition(RankId(NUM_RANKS - 1), 0));
}

#[test]
fn satisfies_postcondition() -> anyhow::Result<()> {
    let (builder, collective) = build()?;
    assert!(builder.check(&collective));
    Ok(())
}

#[test]
fn every_hop_is_one_send_matched_by_one_recv() -> anyhow::Result<()> {
    let (builder, _collective) = build()?;
    let program = compile(&builder, AssignMode::Auto)?;
    let total_sends: usize = program
        .gpus
        .iter()
        .flat_map(|gpu| gpu.ops.iter())
        .filter(|op| matches!(op.inst, loomc::ir::Instruction::Send))
        .count();
    // 15 hops; fusion may collapse an intermediate recv+send into RecvCopySend,
    // so a bare `Send` survives only for ranks that never also forward it on.
    assert!(total_sends <= (NUM_RANKS - 1) as usize);
    Ok(())
}

#[test]
fn channel_alternates_by_hop_parity() -> anyhow::Result<()> {
    let (builder, _collective) = build()?;
    let program = compile(&builder, AssignMode::Auto)?;
    for gpu in &program.gpus {
        for op in &gpu.ops {
            if op.channel >= 0 {
                assert!(op.channel == 0 || op.channel == 1);
            }
        }
    }
    Ok(())
}

#[test]
fn compiles_and_satisfies_schedule_invariants() -> anyhow::Result<()> {
    let (builder, _collective) = build()?;
    let program = compile(&builder, AssignMode::Auto)?;
    assert_schedule_invariants(&program);
    assert_eq!(program.gpus.len(), NUM_RANKS as usize);
    Ok(())
}
