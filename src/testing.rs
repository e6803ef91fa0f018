//! Testing utilities for programs compiled by this crate.
//!
//! A small, dependency-free facility end users (and this crate's own tests)
//! reach for instead of hand-rolling assertions: invariant checks over a
//! compiled [`Program`] and fixtures for the reference collectives.

use crate::collective::{AllReduceCollective, FullyConnectedTopology};
use crate::ir::{Instruction, Program};

/// Panics unless `program` satisfies its schedule invariants: every
/// threadblock's `step`s are a permutation of `0..len`, and `Copy`/`Start`
/// ops never carry a threadblock assignment.
pub fn assert_schedule_invariants(program: &Program) {
    for gpu in &program.gpus {
        for tb in &gpu.threadblocks {
            let mut steps: Vec<i32> = tb.ops.iter().map(|id| gpu.op(*id).step).collect();
            steps.sort_unstable();
            let expected: Vec<i32> = (0..tb.ops.len() as i32).collect();
            assert_eq!(
                steps, expected,
                "rank {}: threadblock steps are not a permutation of 0..{}",
                gpu.rank,
                tb.ops.len()
            );

            for id in &tb.ops {
                let op = gpu.op(*id);
                assert!(
                    !matches!(op.inst, Instruction::Copy | Instruction::Start),
                    "rank {}: {} op {} must never be assigned to a threadblock",
                    gpu.rank,
                    op.inst,
                    op.id
                );
            }
        }

        let assigned: std::collections::HashSet<_> = gpu.threadblocks.iter().flat_map(|tb| tb.ops.iter().copied()).collect();
        for op in &gpu.ops {
            if matches!(op.inst, Instruction::Copy | Instruction::Start) {
                assert!(
                    !assigned.contains(&op.id),
                    "rank {}: {} op {} unexpectedly carries a threadblock assignment",
                    gpu.rank,
                    op.inst,
                    op.id
                );
            }
        }
    }
}

/// A small, pre-wired collective/topology pair for tests that just need a
/// working `ProgramBuilder` without restating the reference types each time.
pub struct ProgramFixture {
    pub topology: FullyConnectedTopology,
    pub collective: AllReduceCollective,
}

impl ProgramFixture {
    /// An all-reduce fixture over a fully connected cluster of `num_ranks`.
    pub fn allreduce(num_ranks: u32) -> Self {
        Self {
            topology: FullyConnectedTopology::new(num_ranks),
            collective: AllReduceCollective::new(num_ranks as usize),
        }
    }

    pub fn builder(&self, name: &str) -> crate::builder::ProgramBuilder {
        crate::builder::ProgramBuilder::new(name, &self.collective, &self.topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assign::compatible;
    use crate::ir::{Buffer, ChunkRef, Op, Threadblock};
    use crate::op_id::{OpId, RankId};

    #[test]
    fn fixture_builder_seeds_identity_input() {
        let fixture = ProgramFixture::allreduce(3);
        let builder = fixture.builder("test");
        assert!(builder.input(RankId(1), 1, 1).is_ok());
        assert!(builder.input(RankId(1), 0, 1).is_err());
    }

    #[test]
    fn wildcard_threadblock_is_compatible_with_anything() {
        let tb = Threadblock::new(-1, -1, -1);
        let op = Op::new(
            OpId::new(0),
            Instruction::Send,
            ChunkRef::new(RankId(0), Buffer::Input, 0, 1),
            ChunkRef::new(RankId(1), Buffer::Output, 0, 1),
            Vec::new(),
        );
        assert!(compatible(&tb, &op));
    }
}
