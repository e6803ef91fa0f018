//! End-to-end demo: a 2-node, 16-GPU linear pipeline. A single chunk hops from rank 0 to rank 15, one send per
//! hop, alternating channel `0`/`1` by hop parity.

use loomc::collective::{FullyConnectedTopology, PipelineCollective};
use loomc::emit::{compile, AssignMode};
use loomc::ir::Buffer;
use loomc::op_id::RankId;
use loomc::testing::assert_schedule_invariants;
use loomc::ProgramBuilder;

const NUM_RANKS: u32 = 16;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let topology = FullyConnectedTopology::new(NUM_RANKS);
    let collective = PipelineCollective::new(NUM_RANKS as usize);
    let builder = ProgramBuilder::new("pipeline_2node", &collective, &topology);

    let mut chunk = builder.input(RankId(0), 0, 1)?;
    for hop in 0..NUM_RANKS - 1 {
        let channel = (hop % 2) as i32;
        chunk = chunk.send(RankId(hop + 1), Buffer::Output, 0, 1, None, None, Some(channel))?;
    }

    if !builder.check(&collective) {
        anyhow::bail!("pipeline program failed its postcondition check");
    }

    let program = compile(&builder, AssignMode::Auto)?;
    assert_schedule_invariants(&program);

    tracing::info!(
        ranks = program.gpus.len(),
        total_ops = program.gpus.iter().map(|g| g.ops.len()).sum::<usize>(),
        "pipeline demo compiled"
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
