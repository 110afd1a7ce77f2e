//! The debugger session: owns the transport, the parser, the packet-id
//! counters, and the breakpoint state, and turns parser events into
//! protocol actions.
//!
//! The host wires its callbacks to this object: transport bytes go to
//! [`Session::receive`], guest breakpoint hits to
//! [`Session::handle_breakpoint`], and the kernel-ready signal to
//! [`Session::on_load`]. Only one session may exist per process.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::api::{Dispatcher, Outcome};
use crate::breakpoints::BreakpointTable;
use crate::context::{self, CtrlAddrs};
use crate::debug_regs::DrShadow;
use crate::emu::{Emulator, Transport};
use crate::error::Error;
use crate::packet::{
    checksum, packet_type_name, KdPacket, PacketType, CONTROL_PACKET_LEADER, INITIAL_PACKET_ID,
    PACKET_LEADER, PACKET_MAX_SIZE, PACKET_TRAILING_BYTE, RESET_PACKET_ID, SYNC_PACKET_ID,
};
use crate::parser::{ParseEvent, Parser};
use crate::tap::{DebugTap, Direction};

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

pub struct Session<E: Emulator> {
    emu: E,
    chr: Box<dyn Transport>,
    parser: Parser,
    ctrl_packet_id: u32,
    data_packet_id: u32,
    is_loaded: bool,
    cpu_count: usize,
    ctrl_addrs: Option<CtrlAddrs>,
    breakpoints: BreakpointTable,
    dr_shadow: DrShadow,
    tap: Option<DebugTap>,
}

impl<E: Emulator> std::fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("ctrl_packet_id", &self.ctrl_packet_id)
            .field("data_packet_id", &self.data_packet_id)
            .field("is_loaded", &self.is_loaded)
            .field("cpu_count", &self.cpu_count)
            .finish_non_exhaustive()
    }
}

impl<E: Emulator> Session<E> {
    /// Largest byte chunk the host should hand to [`Session::receive`] at
    /// once; advertise this to the character layer.
    pub const MAX_RECEIVE: usize = PACKET_MAX_SIZE;

    /// Opens the transport named by `device_spec` and initializes the
    /// session. Fails with [`Error::SessionActive`] if a session already
    /// exists in this process; the host should treat that as fatal.
    pub fn start(mut emu: E, device_spec: &str) -> Result<Self, Error> {
        if SESSION_ACTIVE.swap(true, Ordering::SeqCst) {
            log::error!("Multiple debugger sessions are not supported");
            return Err(Error::SessionActive);
        }
        let chr = match emu.open_transport(device_spec) {
            Ok(chr) => chr,
            Err(err) => {
                SESSION_ACTIVE.store(false, Ordering::SeqCst);
                log::error!("Could not open debugger transport {device_spec}: {err}");
                return Err(err.into());
            }
        };
        let cpu_count = emu.cpu_count();
        log::info!("KD stub attached to {device_spec} ({cpu_count} cpus)");
        Ok(Session {
            emu,
            chr,
            parser: Parser::new("WinDbg"),
            ctrl_packet_id: RESET_PACKET_ID,
            data_packet_id: INITIAL_PACKET_ID | SYNC_PACKET_ID,
            is_loaded: false,
            cpu_count,
            ctrl_addrs: None,
            breakpoints: BreakpointTable::new(),
            dr_shadow: DrShadow::new(),
            tap: None,
        })
    }

    /// Attaches a diagnostic packet tap observing both directions.
    pub fn attach_tap(&mut self, tap: DebugTap) {
        self.tap = Some(tap);
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded
    }

    pub fn ctrl_packet_id(&self) -> u32 {
        self.ctrl_packet_id
    }

    pub fn data_packet_id(&self) -> u32 {
        self.data_packet_id
    }

    /// Signals that the guest kernel is far enough along for the KPCR walk
    /// to work. Bytes arriving before this are discarded.
    pub fn on_load(&mut self) {
        if self.is_loaded {
            return;
        }
        let ctrl = context::read_ctrl_addrs(&mut self.emu, 0);
        log::info!(
            "Guest kernel ready: KPCR {:#010x}, kernel base {:#010x}",
            ctrl.kpcr,
            ctrl.kernel_base
        );
        self.ctrl_addrs = Some(ctrl);
        self.is_loaded = true;
    }

    /// Feeds bytes received from the debugger into the session.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if let Some(tap) = &mut self.tap {
            tap.observe(Direction::WinDbg, bytes);
        }
        if !self.is_loaded {
            return Ok(());
        }
        for &byte in bytes {
            if let Some(event) = self.parser.feed(byte) {
                self.handle_event(event)?;
            }
        }
        Ok(())
    }

    /// Reports a guest breakpoint or watchpoint hit. The emulator has
    /// already paused the VM; the debugger is told why.
    pub fn handle_breakpoint(&mut self, cpu: usize) -> Result<(), Error> {
        self.send_exception(cpu)
    }

    fn handle_event(&mut self, event: ParseEvent) -> Result<(), Error> {
        match event {
            ParseEvent::BreakIn => self.break_in(),
            ParseEvent::Control(packet) => self.handle_control_packet(packet),
            ParseEvent::Data(packet) => self.handle_data_packet(packet),
            ParseEvent::Unknown { packet_type } => {
                log::error!("Caught unknown packet type {packet_type:#x}");
                self.send_resend()
            }
            ParseEvent::Error(err) => {
                log::error!("Framing error: {err}");
                self.send_resend()
            }
        }
    }

    fn handle_control_packet(&mut self, packet: KdPacket) -> Result<(), Error> {
        match packet.ty() {
            Some(PacketType::Acknowledge) => Ok(()),
            Some(PacketType::Reset) => {
                // Handshake: report the kernel symbols, echo the reset, and
                // drop the control counter back to its initial value.
                let ctrl = self.cached_ctrl_addrs();
                let payload = context::load_symbols_state_change(
                    &mut self.emu,
                    0,
                    self.cpu_count,
                    &ctrl,
                );
                self.send_data_packet(PacketType::StateChange64 as u16, &payload)?;
                self.send_control_packet(PacketType::Reset)?;
                self.ctrl_packet_id = INITIAL_PACKET_ID;
                Ok(())
            }
            _ => {
                log::error!(
                    "Caught unsupported control packet {}",
                    packet_type_name(packet.packet_type)
                );
                self.send_resend()
            }
        }
    }

    fn handle_data_packet(&mut self, packet: KdPacket) -> Result<(), Error> {
        match packet.ty() {
            Some(PacketType::StateManipulate) => {
                // The acknowledge always precedes the response.
                self.send_control_packet(PacketType::Acknowledge)?;
                self.handle_manipulate(packet)
            }
            _ => {
                log::error!(
                    "Caught unsupported data packet {}",
                    packet_type_name(packet.packet_type)
                );
                self.send_resend()
            }
        }
    }

    fn handle_manipulate(&mut self, packet: KdPacket) -> Result<(), Error> {
        let ctrl = self.cached_ctrl_addrs();
        let outcome = {
            let Session {
                emu,
                breakpoints,
                dr_shadow,
                parser,
                cpu_count,
                ..
            } = self;
            let mut dispatcher = Dispatcher {
                emu,
                breakpoints,
                dr_shadow,
                ctrl_addrs: &ctrl,
                cpu_count: *cpu_count,
            };
            dispatcher.dispatch(parser.payload_buf(), packet.byte_count as usize)
        };
        match outcome {
            Outcome::Reply { len } => Self::send_data_raw(
                self.chr.as_mut(),
                &mut self.tap,
                &mut self.data_packet_id,
                packet.packet_type,
                self.parser.staged(len),
            ),
            Outcome::Break { cpu } => self.send_exception(cpu),
            Outcome::NoReply | Outcome::Resumed => Ok(()),
        }
    }

    /// The debugger's out-of-band interrupt: pause the guest and report a
    /// breakpoint exception on CPU 0.
    fn break_in(&mut self) -> Result<(), Error> {
        self.emu.vm_stop();
        self.emu.single_step(0, false);
        self.send_exception(0)
    }

    fn send_exception(&mut self, cpu: usize) -> Result<(), Error> {
        let ctrl = self.cached_ctrl_addrs();
        let payload = context::exception_state_change(&mut self.emu, cpu, self.cpu_count, &ctrl);
        self.send_data_packet(PacketType::StateChange64 as u16, &payload)
    }

    fn cached_ctrl_addrs(&mut self) -> CtrlAddrs {
        match self.ctrl_addrs {
            Some(ctrl) => ctrl,
            None => {
                let ctrl = context::read_ctrl_addrs(&mut self.emu, 0);
                self.ctrl_addrs = Some(ctrl);
                ctrl
            }
        }
    }

    fn send_data_packet(&mut self, packet_type: u16, payload: &[u8]) -> Result<(), Error> {
        Self::send_data_raw(
            self.chr.as_mut(),
            &mut self.tap,
            &mut self.data_packet_id,
            packet_type,
            payload,
        )
    }

    fn send_data_raw(
        chr: &mut dyn Transport,
        tap: &mut Option<DebugTap>,
        packet_id: &mut u32,
        packet_type: u16,
        payload: &[u8],
    ) -> Result<(), Error> {
        let header = KdPacket {
            packet_leader: PACKET_LEADER,
            packet_type,
            byte_count: payload.len() as u16,
            packet_id: *packet_id,
            checksum: checksum(payload),
        }
        .to_bytes();
        let trailer = [PACKET_TRAILING_BYTE];

        chr.send(&header)?;
        chr.send(payload)?;
        chr.send(&trailer)?;
        if let Some(tap) = tap {
            tap.observe(Direction::Kernel, &header);
            tap.observe(Direction::Kernel, payload);
            tap.observe(Direction::Kernel, &trailer);
        }
        *packet_id ^= 1;
        Ok(())
    }

    fn send_control_packet(&mut self, packet_type: PacketType) -> Result<(), Error> {
        let header = KdPacket {
            packet_leader: CONTROL_PACKET_LEADER,
            packet_type: packet_type as u16,
            byte_count: 0,
            packet_id: self.ctrl_packet_id,
            checksum: 0,
        }
        .to_bytes();

        self.chr.send(&header)?;
        if let Some(tap) = &mut self.tap {
            tap.observe(Direction::Kernel, &header);
        }
        self.ctrl_packet_id ^= 1;
        Ok(())
    }

    /// Asks the debugger to resend; the control counter is forced to zero
    /// first so both sides agree on where the exchange restarts.
    fn send_resend(&mut self) -> Result<(), Error> {
        self.ctrl_packet_id = 0;
        self.send_control_packet(PacketType::Resend)
    }
}

impl<E: Emulator> Drop for Session<E> {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
        log::debug!("KD stub session closed");
    }
}

