//! Passive diagnostic tap on both directions of the debugger link.
//!
//! The tap runs its own pair of parser instances ("Kernel" for bytes the
//! stub sends, "WinDbg" for bytes the debugger sends), so observing the
//! stream never perturbs the session's parser. Output goes to two text
//! files in a caller-chosen directory: `parsed_packets.txt` with full
//! packet summaries and hex dumps, and `parsed_api.txt` with one line per
//! manipulate API call.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::api::api_name;
use crate::packet::{packet_type_name, KdPacket, PacketType};
use crate::parser::{ParseEvent, Parser};

/// Which side of the link produced the observed bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Stub to debugger (the stub speaks for the kernel).
    Kernel,
    /// Debugger to stub.
    WinDbg,
}

impl Direction {
    fn name(self) -> &'static str {
        match self {
            Direction::Kernel => "Kernel",
            Direction::WinDbg => "WinDbg",
        }
    }
}

pub struct DebugTap {
    packets: File,
    api: File,
    kernel: Parser,
    windbg: Parser,
    /// Set after the first write failure; the tap goes quiet instead of
    /// disturbing the session.
    broken: bool,
}

impl DebugTap {
    /// Creates the output files inside `dir` (created if missing).
    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(DebugTap {
            packets: File::create(dir.join("parsed_packets.txt"))?,
            api: File::create(dir.join("parsed_api.txt"))?,
            kernel: Parser::new("Kernel"),
            windbg: Parser::new("WinDbg"),
            broken: false,
        })
    }

    /// Feeds observed bytes from one direction through that direction's
    /// parser and logs every completed event.
    pub fn observe(&mut self, direction: Direction, bytes: &[u8]) {
        if self.broken {
            return;
        }
        let parser = match direction {
            Direction::Kernel => &mut self.kernel,
            Direction::WinDbg => &mut self.windbg,
        };
        for &byte in bytes {
            if let Some(event) = parser.feed(byte) {
                let payload = match event {
                    ParseEvent::Data(_) => parser.payload(),
                    _ => &[],
                };
                let result = write_packet_entry(&mut self.packets, direction, &event, payload)
                    .and_then(|()| write_api_entry(&mut self.api, direction, &event, payload));
                if let Err(err) = result {
                    log::warn!("Packet tap disabled after write error: {err}");
                    self.broken = true;
                    return;
                }
            }
        }
    }
}

fn write_packet_entry(
    out: &mut File,
    direction: Direction,
    event: &ParseEvent,
    payload: &[u8],
) -> io::Result<()> {
    writeln!(out, "FROM: {}", direction.name())?;
    match event {
        ParseEvent::BreakIn => writeln!(out, "CATCH BREAKIN BYTE")?,
        ParseEvent::Unknown { packet_type } => {
            writeln!(out, "ERROR: CATCH UNKNOWN PACKET TYPE: {packet_type:#x}")?
        }
        ParseEvent::Control(packet) => {
            writeln!(out, "CATCH CONTROL PACKET: {}", packet_type_name(packet.packet_type))?
        }
        ParseEvent::Data(packet) => write_data_packet(out, packet, payload)?,
        ParseEvent::Error(err) => writeln!(out, "ERROR: {err}")?,
    }
    writeln!(out)?;
    out.flush()
}

fn write_data_packet(out: &mut File, packet: &KdPacket, payload: &[u8]) -> io::Result<()> {
    writeln!(out, "CATCH DATA PACKET: {}", packet_type_name(packet.packet_type))?;
    writeln!(out, "Byte Count: {}", packet.byte_count)?;
    if packet.ty() == Some(PacketType::StateManipulate) && payload.len() >= 4 {
        writeln!(out, "Api: {}", api_name(LittleEndian::read_u32(&payload[0..4])))?;
    }
    for (i, byte) in payload.iter().enumerate() {
        if i % 16 == 0 && i != 0 {
            writeln!(out)?;
        }
        write!(out, "{byte:02x} ")?;
    }
    if payload.len() % 16 == 0 && !payload.is_empty() {
        writeln!(out)?;
    }
    writeln!(out, "aa")?;
    Ok(())
}

fn write_api_entry(
    out: &mut File,
    direction: Direction,
    event: &ParseEvent,
    payload: &[u8],
) -> io::Result<()> {
    match event {
        ParseEvent::BreakIn => writeln!(out, "BREAKIN BYTE")?,
        ParseEvent::Data(packet)
            if packet.ty() == Some(PacketType::StateManipulate) && payload.len() >= 4 =>
        {
            let api = LittleEndian::read_u32(&payload[0..4]);
            writeln!(out, "{}: {}", direction.name(), api_name(api))?;
        }
        _ => return Ok(()),
    }
    out.flush()
}
