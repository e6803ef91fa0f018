//! End-to-end demo: an 8-GPU all-pairs AllReduce.
//!
//! Each rank folds every peer's value into a running accumulator via
//! `reduce`, then broadcasts the fully reduced value back out so every rank
//! ends up with the same sum in every output slot. Per rank this records 7
//! sends into scratch, 7 reduces, and 7 sends of the reduced chunk, matching
//! the scenario the expanded spec describes.

use loomc::collective::{AllReduceCollective, FullyConnectedTopology};
use loomc::emit::{compile, AssignMode};
use loomc::ir::Buffer;
use loomc::op_id::RankId;
use loomc::testing::assert_schedule_invariants;
use loomc::ProgramBuilder;

const NUM_RANKS: u32 = 8;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let topology = FullyConnectedTopology::new(NUM_RANKS);
    let collective = AllReduceCollective::new(NUM_RANKS as usize);
    let builder = ProgramBuilder::new("allreduce_8gpu", &collective, &topology);

    for r in 0..NUM_RANKS {
        let rank = RankId(r);
        let mut acc = builder.input(rank, r as usize, 1)?;
        for p in 0..NUM_RANKS {
            if p == r {
                continue;
            }
            let peer_val = builder.input(RankId(p), p as usize, 1)?;
            let incoming = peer_val.send(rank, Buffer::Scratch("acc_in".to_string()), 0, 1, None, None, Some(0))?;
            acc = acc.reduce(&incoming, None, Some(0))?;
        }

        acc.copy(Buffer::Output, r as usize, 1, None, None)?;
        for q in 0..NUM_RANKS {
            if q == r {
                continue;
            }
            acc.send(RankId(q), Buffer::Output, r as usize, 1, None, None, Some(0))?;
        }
    }

    if !builder.check(&collective) {
        anyhow::bail!("allreduce program failed its postcondition check");
    }

    let program = compile(&builder, AssignMode::Auto)?;
    assert_schedule_invariants(&program);

    tracing::info!(
        ranks = program.gpus.len(),
        total_ops = program.gpus.iter().map(|g| g.ops.len()).sum::<usize>(),
        "allreduce demo compiled"
    );

    #[cfg(feature = "xml-backend")]
    {
        use loomc::xml_sink::{QuickXmlSink, ScheduleSink};
        let mut out = Vec::new();
        QuickXmlSink::new(&mut out).write(&program)?;
        println!("{}", String::from_utf8(out)?);
    }
    #[cfg(not(feature = "xml-backend"))]
    {
        println!("{program:#?}");
    }

    Ok(())
}
