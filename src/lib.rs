//! A WinDbg kernel-debugger (KD) stub for machine emulators.
//!
//! This crate speaks the Windows kernel debugger wire protocol to a remote
//! WinDbg over a byte-oriented transport (serial or named pipe) on behalf
//! of a running 32-bit x86 guest. The host emulator provides guest access
//! through the [`Emulator`] trait; the stub provides the protocol: packet
//! framing with resynchronization, the manipulate-state request surface
//! (memory and register access, breakpoints, continue), debug-register
//! reconciliation into emulator watchpoints, and the asynchronous
//! state-change notifications for break-in and breakpoint hits.
//!
//! The host creates one [`Session`] with [`Session::start`] and routes its
//! callbacks to it:
//!
//! ```no_run
//! # use windbg_stub::{Emulator, Session};
//! # fn host_setup<E: Emulator>(emu: E) -> Result<(), windbg_stub::Error> {
//! let mut session = Session::start(emu, "pipe:windbg")?;
//! // ... on transport bytes:       session.receive(&bytes)?;
//! // ... on guest breakpoint hit:  session.handle_breakpoint(cpu)?;
//! // ... once the kernel is ready: session.on_load();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod breakpoints;
pub mod context;
pub mod debug_regs;
pub mod emu;
pub mod error;
pub mod packet;
pub mod parser;
pub mod session;
pub mod tap;

pub use emu::{
    ControlRegs, DebugRegs, DescriptorTable, Emulator, FpuState, GpRegs, SegmentReg, Segments,
    Transport, XmmRegs,
};
pub use error::Error;
pub use session::Session;
pub use tap::{DebugTap, Direction};
