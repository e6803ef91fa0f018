//! # loomc
//!
//! A middle-end compiler for GPU collective-communication programs: you
//! describe chunk movement between ranks with a small builder API, and this
//! crate turns it into a scheduled, thread-block-assigned program ready for
//! an external back-end to turn into device code.
//!
//! ## Pipeline
//!
//! 1. Build an IR graph under a [`builder::ProgramScope`], moving chunks
//!    between ranks with [`builder::Ref::send`], [`builder::Ref::copy`], and
//!    [`builder::Ref::reduce`].
//! 2. [`emit::compile`] runs the [`fusion`] peephole passes, then
//!    [`assign`]s every op to a thread-block and channel, then validates the
//!    result.
//! 3. Hand the resulting [`ir::Program`] to a [`xml_sink::ScheduleSink`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use loomc::builder::{ProgramBuilder, ProgramScope};
//! use loomc::collective::{AllReduceCollective, FullyConnectedTopology};
//! use loomc::emit::{compile, AssignMode};
//! use loomc::ir::Buffer;
//! use loomc::op_id::RankId;
//!
//! # fn main() -> anyhow::Result<()> {
//! let topology = FullyConnectedTopology::new(2);
//! let collective = AllReduceCollective::new(2);
//! let builder = ProgramBuilder::new("demo", &collective, &topology);
//! let scope = ProgramScope::enter(builder.clone())?;
//!
//! let mine = scope.builder().input(RankId(0), 0, 1)?;
//! let theirs = mine.send(RankId(1), Buffer::Output, 0, 1, None, None, None)?;
//! let _ = theirs;
//!
//! scope.exit()?;
//! let program = compile(&builder, AssignMode::Auto)?;
//! println!("{} ranks compiled", program.gpus.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`op_id`] — `OpId`/`RankId` newtypes used as arena indices everywhere.
//! - [`ir`] — the closed data model: `Buffer`, `ChunkRef`, `Instruction`, `Op`, `Program`.
//! - [`error`] — [`error::CompileError`], the closed set of fatal error kinds.
//! - [`rank_dag`] — the per-rank op arena and slot-keyed dependency tracker.
//! - [`builder`] — `ProgramBuilder`/`Ref`, the user-facing construction API.
//! - [`fusion`] — the peephole fusion passes.
//! - [`assign`] — thread-block and channel assignment.
//! - [`emit`] — the compile pipeline and cross-rank invariant checks.
//! - [`collective`] — `Topology`/`Collective` traits and reference implementations.
//! - [`xml_sink`] — the `ScheduleSink` trait and the `quick-xml` reference writer (feature: `xml-backend`).
//! - [`testing`] — schedule-invariant assertions and fixtures for tests.

pub mod assign;
pub mod builder;
pub mod collective;
pub mod emit;
pub mod error;
pub mod fusion;
pub mod ir;
pub mod op_id;
pub mod rank_dag;
pub mod testing;
pub mod xml_sink;

pub use builder::{ProgramBuilder, ProgramScope, Ref};
pub use collective::{AllReduceCollective, AllToAllCollective, Collective, FullyConnectedTopology, PipelineCollective, Topology};
pub use emit::{compile, AssignMode};
pub use error::CompileError;
pub use ir::{Buffer, ChunkRef, Instruction, Op, Program};
pub use op_id::{OpId, RankId};
pub use xml_sink::ScheduleSink;

#[cfg(feature = "xml-backend")]
pub use xml_sink::QuickXmlSink;
