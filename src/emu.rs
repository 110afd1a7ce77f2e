//! The narrow interface the stub consumes from its host emulator.
//!
//! Everything the core needs from the machine (register access, guest
//! memory, breakpoints, watchpoints, run control, and the debugger
//! transport) goes through [`Emulator`], so the core can be exercised
//! against an in-memory fake.

use std::io;

use crate::debug_regs::WatchFlags;
use crate::error::Error;

/// General-purpose register snapshot of one virtual CPU.
#[derive(Clone, Copy, Debug, Default)]
pub struct GpRegs {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub eip: u32,
    pub eflags: u32,
}

/// One segment register: the visible selector plus the cached base/limit.
#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentReg {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
}

/// GDTR/IDTR image. `pad` mirrors the selector slot some emulators keep
/// alongside the descriptor-table registers; it travels in the wire format.
#[derive(Clone, Copy, Debug, Default)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u16,
    pub pad: u16,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Segments {
    pub cs: SegmentReg,
    pub ds: SegmentReg,
    pub es: SegmentReg,
    pub fs: SegmentReg,
    pub gs: SegmentReg,
    pub ss: SegmentReg,
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub tr: u16,
    pub ldtr: u16,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ControlRegs {
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DebugRegs {
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,
}

impl DebugRegs {
    /// DR0..DR3 by index.
    pub fn dr(&self, index: usize) -> u32 {
        match index {
            0 => self.dr0,
            1 => self.dr1,
            2 => self.dr2,
            3 => self.dr3,
            _ => panic!("debug register index {index} out of range"),
        }
    }
}

/// x87 state as the 32-bit CONTEXT needs it: control words, the 64-bit
/// last-instruction/last-operand pointers, and the eight 10-byte ST slots.
#[derive(Clone, Copy, Debug)]
pub struct FpuState {
    pub control: u16,
    pub status: u16,
    pub tag: u16,
    pub last_ip: u64,
    pub last_dp: u64,
    pub st: [[u8; 10]; 8],
}

impl Default for FpuState {
    fn default() -> Self {
        FpuState {
            control: 0,
            status: 0,
            tag: 0,
            last_ip: 0,
            last_dp: 0,
            st: [[0; 10]; 8],
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct XmmRegs {
    pub regs: [[u8; 16]; 8],
    pub mxcsr: u32,
}

impl Default for XmmRegs {
    fn default() -> Self {
        XmmRegs {
            regs: [[0; 16]; 8],
            mxcsr: 0,
        }
    }
}

/// Outbound half of the debugger link. Inbound bytes are pushed into
/// [`crate::Session::receive`] by the host's character layer.
pub trait Transport {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Host-emulator services consumed by the stub core.
///
/// Register accessors return snapshots; the session only calls them while
/// the VM is paused, so a consistent multi-word read is the host's easy
/// case. Guest memory accessors are non-faulting and report the number of
/// bytes actually transferred.
pub trait Emulator {
    fn cpu_count(&self) -> usize;

    fn gp_regs(&self, cpu: usize) -> GpRegs;
    fn segments(&self, cpu: usize) -> Segments;
    fn control_regs(&self, cpu: usize) -> ControlRegs;
    fn debug_regs(&self, cpu: usize) -> DebugRegs;
    fn fpu_state(&self, cpu: usize) -> FpuState;
    fn xmm_regs(&self, cpu: usize) -> XmmRegs;

    fn set_control_regs(&mut self, cpu: usize, regs: ControlRegs);
    fn set_debug_regs(&mut self, cpu: usize, regs: DebugRegs);

    /// Reads guest-virtual memory; returns the number of bytes read before
    /// the first translation failure.
    fn mem_read(&mut self, cpu: usize, addr: u32, buf: &mut [u8]) -> usize;
    /// Writes guest-virtual memory; returns the number of bytes written.
    fn mem_write(&mut self, cpu: usize, addr: u32, data: &[u8]) -> usize;

    fn phys_read(&mut self, addr: u64, buf: &mut [u8]) -> usize;
    fn phys_write(&mut self, addr: u64, data: &[u8]) -> usize;

    /// Port I/O; `size` is 1, 2, or 4.
    fn io_read(&mut self, port: u16, size: u8) -> u32;
    fn io_write(&mut self, port: u16, size: u8, value: u32);

    fn msr_read(&mut self, cpu: usize, msr: u32) -> u64;
    fn msr_write(&mut self, cpu: usize, msr: u32, value: u64);

    /// Installs a code breakpoint tagged with `flags` (the stub-owner tag).
    fn bp_insert(&mut self, cpu: usize, addr: u32, flags: WatchFlags) -> Result<(), Error>;
    fn bp_remove(&mut self, cpu: usize, addr: u32, flags: WatchFlags);

    /// Installs a data watchpoint. May fail, e.g. for a length the
    /// emulator cannot represent.
    fn wp_insert(&mut self, cpu: usize, addr: u32, len: u8, flags: WatchFlags)
        -> Result<(), Error>;
    fn wp_remove(&mut self, cpu: usize, addr: u32, len: u8, flags: WatchFlags);

    /// Discards translated code so newly inserted breakpoints take effect.
    fn tb_flush(&mut self, cpu: usize);

    fn vm_stop(&mut self);
    fn vm_start(&mut self);
    fn single_step(&mut self, cpu: usize, enable: bool);

    /// Opens the byte transport named by `device_spec` (e.g. `pipe:windbg`).
    fn open_transport(&mut self, device_spec: &str) -> io::Result<Box<dyn Transport>>;
}
