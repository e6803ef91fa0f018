//! Hierarchical all-to-all: every
//! ordered `(src, dst)` pair exchanges exactly one chunk.

use loomc::collective::{AllToAllCollective, Collective, FullyConnectedTopology};
use loomc::emit::{compile, AssignMode};
use loomc::ir::Buffer;
use loomc::op_id::RankId;
use loomc::testing::assert_schedule_invariants;
use loomc::ProgramBuilder;

const NUM_RANKS: u32 = 4;

fn build() -> anyhow::Result<(ProgramBuilder, AllToAllCollective)> {
    let topology = FullyConnectedTopology::new(NUM_RANKS);
    let collective = AllToAllCollective::new(NUM_RANKS as usize);
    let builder = ProgramBuilder::new("alltoall_4gpu", &collective, &topology);

    for src in 0..NUM_RANKS {
        for dst in 0..NUM_RANKS {
            let chunk_index = collective.chunk_index(RankId(src), RankId(dst));
            let owned = builder.input(RankId(src), chunk_index, 1)?;
            if src == dst {
                owned.copy(Buffer::Output, chunk_index, 1, None, None)?;
            } else {
                owned.send(RankId(dst), Buffer::Output, chunk_index, 1, None, None, Some(0))?;
            }
        }
    }

    Ok((builder, collective))
}

#[test]
fn chunk_index_is_a_bijection_over_src_dst_pairs() {
    let collective = AllToAllCollective::new(NUM_RANKS as usize);
    let mut seen = std::collections::HashSet::new();
    for src in 0..NUM_RANKS {
        for dst in 0..NUM_RANKS {
            let idx = collective.chunk_index(RankId(src), RankId(dst));
            assert!(seen.insert(idx), "chunk index {idx} reused");
            assert!(collective.precondition(RankId(src), idx));
            assert!(collective.postcondition(RankId(dst), idx));
        }
    }
}

#[test]
fn satisfies_postcondition_and_compiles() -> anyhow::Result<()> {
    let (builder, collective) = build()?;
    assert!(builder.check(&collective));
    let program = compile(&builder, AssignMode::Auto)?;
    assert_schedule_invariants(&program);
    Ok(())
}
