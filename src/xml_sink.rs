//! The emitter facade's external back-end contract, plus a concrete
//! reference writer.
//!
//! The schedule format itself is out of core scope — `emit.rs` only promises
//! to hand a finished [`crate::ir::Program`] to whatever implements
//! [`ScheduleSink`]. `QuickXmlSink` is one concrete, always-buildable
//! implementation of that contract, kept behind the `xml-backend` feature
//! and built as a thin wrapper around a single serialization crate.

use crate::ir::Program;
use std::io;

/// An external back-end that turns a finished [`Program`] into schedule
/// output. `emit.rs` depends only on this trait, never on a concrete format.
pub trait ScheduleSink {
    fn write(&mut self, program: &Program) -> io::Result<()>;
}

#[cfg(feature = "xml-backend")]
pub use quick_xml_sink::QuickXmlSink;

#[cfg(feature = "xml-backend")]
mod quick_xml_sink {
    use super::ScheduleSink;
    use crate::ir::{Buffer, Instruction, Program};
    use quick_xml::events::{BytesEnd, BytesStart, Event};
    use quick_xml::Writer;
    use std::io::{self, Write};

    /// Writes a [`Program`] as
    /// `<algo><gpu rank=".."><tb id=".." send=".." recv=".." chan=".."><op .../></tb></gpu></algo>`.
    pub struct QuickXmlSink<W: Write> {
        writer: Writer<W>,
    }

    impl<W: Write> QuickXmlSink<W> {
        pub fn new(inner: W) -> Self {
            Self {
                writer: Writer::new_with_indent(inner, b' ', 2),
            }
        }
    }

    impl<W: Write> ScheduleSink for QuickXmlSink<W> {
        fn write(&mut self, program: &Program) -> io::Result<()> {
            self.write_program(program).map_err(to_io_error)
        }
    }

    impl<W: Write> QuickXmlSink<W> {
        fn write_program(&mut self, program: &Program) -> quick_xml::Result<()> {
            let mut algo = BytesStart::new("algo");
            algo.push_attribute(("name", program.name.as_str()));
            algo.push_attribute(("proto", program.protocol.as_str()));
            algo.push_attribute(("nchannels", program.threadblocks_hint.to_string().as_str()));
            self.writer.write_event(Event::Start(algo))?;

            for gpu in &program.gpus {
                let mut gpu_tag = BytesStart::new("gpu");
                let rank = gpu.rank.0.to_string();
                gpu_tag.push_attribute(("rank", rank.as_str()));
                self.writer.write_event(Event::Start(gpu_tag))?;

                for tb in &gpu.threadblocks {
                    let mut tb_tag = BytesStart::new("tb");
                    let send = tb.send.to_string();
                    let recv = tb.recv.to_string();
                    let chan = tb.channel.to_string();
                    tb_tag.push_attribute(("send", send.as_str()));
                    tb_tag.push_attribute(("recv", recv.as_str()));
                    tb_tag.push_attribute(("chan", chan.as_str()));
                    self.writer.write_event(Event::Start(tb_tag))?;

                    for id in &tb.ops {
                        let op = gpu.op(*id);
                        let mut op_tag = BytesStart::new("op");
                        op_tag.push_attribute(("step", op.step.to_string().as_str()));
                        op_tag.push_attribute(("type", instruction_name(op.inst)));
                        op_tag.push_attribute(("srcbuf", buffer_name(&op.src.buffer).as_str()));
                        op_tag.push_attribute(("srcoff", op.src.index.to_string().as_str()));
                        op_tag.push_attribute(("dstbuf", buffer_name(&op.dst.buffer).as_str()));
                        op_tag.push_attribute(("dstoff", op.dst.index.to_string().as_str()));
                        op_tag.push_attribute(("cnt", op.dst.size.to_string().as_str()));
                        self.writer.write_event(Event::Empty(op_tag))?;
                    }

                    self.writer.write_event(Event::End(BytesEnd::new("tb")))?;
                }

                self.writer.write_event(Event::End(BytesEnd::new("gpu")))?;
            }

            self.writer.write_event(Event::End(BytesEnd::new("algo")))?;
            Ok(())
        }
    }

    fn instruction_name(inst: Instruction) -> &'static str {
        match inst {
            Instruction::Start => "start",
            Instruction::Send => "s",
            Instruction::Recv => "r",
            Instruction::Copy => "cpy",
            Instruction::Reduce => "re",
            Instruction::RecvCopySend => "rcs",
            Instruction::RecvReduceCopy => "rrc",
            Instruction::RecvReduceSend => "rrs",
            Instruction::RecvReduceCopySend => "rrcs",
        }
    }

    fn buffer_name(buffer: &Buffer) -> String {
        match buffer {
            Buffer::Input => "i".to_string(),
            Buffer::Output => "o".to_string(),
            Buffer::Scratch(name) => format!("s:{name}"),
        }
    }

    fn to_io_error(err: quick_xml::Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, err)
    }
}

#[cfg(all(test, feature = "xml-backend"))]
mod tests {
    use super::*;
    use crate::ir::{GpuRecord, Program, Threadblock};
    use crate::op_id::RankId;

    #[test]
    fn writes_well_formed_xml_for_an_empty_program() {
        let program = Program {
            name: "test".to_string(),
            collective: "allreduce".to_string(),
            protocol: "Simple".to_string(),
            threadblocks_hint: -1,
            gpus: vec![GpuRecord {
                rank: RankId(0),
                ops: Vec::new(),
                threadblocks: vec![Threadblock::new(-1, -1, -1)],
            }],
        };
        let mut buf = Vec::new();
        let mut sink = QuickXmlSink::new(&mut buf);
        sink.write(&program).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains("<algo"));
        assert!(out.contains("<gpu rank=\"0\""));
    }
}
