//! The KD "manipulate state" API: request decoding, execution against the
//! guest, and in-place response assembly.
//!
//! Every request is a `DBGKD_MANIPULATE_STATE64` header (16-byte fixed
//! prefix + 40-byte per-API union) optionally followed by payload bytes.
//! The reply reuses the staging buffer: handlers rewrite their union
//! fields, set `ReturnStatus`, and report how many extra payload bytes
//! follow the header.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::breakpoints::BreakpointTable;
use crate::context::{CpuContext, CtrlAddrs, KSpecialRegisters, CONTEXT_SIZE, KSPECIAL_SIZE};
use crate::debug_regs::{DrImage, DrOp, DrShadow, WatchFlags};
use crate::emu::Emulator;
use crate::packet::PACKET_MAX_SIZE;

pub const STATUS_SUCCESS: u32 = 0;
pub const STATUS_UNSUCCESSFUL: u32 = 0xC000_0001;

/// Size of the fixed manipulate header (prefix + union).
pub const M64_SIZE: usize = 56;
/// Offset of the per-API union inside the header.
const M64_UNION: usize = 16;
/// Payload room left after the header in a maximum-size packet.
const MAX_EXTRA: usize = PACKET_MAX_SIZE - M64_SIZE;

/// Size of the version block returned by `GetVersion`.
const VERSION_BLOCK_SIZE: usize = 40;

/// The manipulate APIs this stub implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum KdApi {
    ReadVirtualMemory = 0x3130,
    WriteVirtualMemory = 0x3131,
    GetContext = 0x3132,
    SetContext = 0x3133,
    WriteBreakPoint = 0x3134,
    RestoreBreakPoint = 0x3135,
    Continue = 0x3136,
    ReadControlSpace = 0x3137,
    WriteControlSpace = 0x3138,
    ReadIoSpace = 0x3139,
    WriteIoSpace = 0x313A,
    Continue2 = 0x313C,
    ReadPhysicalMemory = 0x313D,
    WritePhysicalMemory = 0x313E,
    GetVersion = 0x3146,
    ReadMachineSpecificRegister = 0x3152,
    WriteMachineSpecificRegister = 0x3153,
    SearchMemory = 0x3156,
    ClearAllInternalBreakpoints = 0x315A,
    FillMemory = 0x315B,
    QueryMemory = 0x315C,
}

impl KdApi {
    pub fn from_u32(value: u32) -> Option<Self> {
        let api = match value {
            0x3130 => KdApi::ReadVirtualMemory,
            0x3131 => KdApi::WriteVirtualMemory,
            0x3132 => KdApi::GetContext,
            0x3133 => KdApi::SetContext,
            0x3134 => KdApi::WriteBreakPoint,
            0x3135 => KdApi::RestoreBreakPoint,
            0x3136 => KdApi::Continue,
            0x3137 => KdApi::ReadControlSpace,
            0x3138 => KdApi::WriteControlSpace,
            0x3139 => KdApi::ReadIoSpace,
            0x313A => KdApi::WriteIoSpace,
            0x313C => KdApi::Continue2,
            0x313D => KdApi::ReadPhysicalMemory,
            0x313E => KdApi::WritePhysicalMemory,
            0x3146 => KdApi::GetVersion,
            0x3152 => KdApi::ReadMachineSpecificRegister,
            0x3153 => KdApi::WriteMachineSpecificRegister,
            0x3156 => KdApi::SearchMemory,
            0x315A => KdApi::ClearAllInternalBreakpoints,
            0x315B => KdApi::FillMemory,
            0x315C => KdApi::QueryMemory,
            _ => return None,
        };
        Some(api)
    }
}

/// Human-readable name for any API number, implemented or not.
pub fn api_name(value: u32) -> &'static str {
    match value {
        0x3130 => "ReadVirtualMemory",
        0x3131 => "WriteVirtualMemory",
        0x3132 => "GetContext",
        0x3133 => "SetContext",
        0x3134 => "WriteBreakPoint",
        0x3135 => "RestoreBreakPoint",
        0x3136 => "Continue",
        0x3137 => "ReadControlSpace",
        0x3138 => "WriteControlSpace",
        0x3139 => "ReadIoSpace",
        0x313A => "WriteIoSpace",
        0x313B => "Reboot",
        0x313C => "Continue2",
        0x313D => "ReadPhysicalMemory",
        0x313E => "WritePhysicalMemory",
        0x313F => "QuerySpecialCalls",
        0x3140 => "SetSpecialCall",
        0x3141 => "ClearSpecialCalls",
        0x3142 => "SetInternalBreakPoint",
        0x3143 => "GetInternalBreakPoint",
        0x3144 => "ReadIoSpaceExtended",
        0x3145 => "WriteIoSpaceExtended",
        0x3146 => "GetVersion",
        0x3147 => "WriteBreakPointEx",
        0x3148 => "RestoreBreakPointEx",
        0x3149 => "CauseBugCheck",
        0x3150 => "SwitchProcessor",
        0x3151 => "PageIn",
        0x3152 => "ReadMachineSpecificRegister",
        0x3153 => "WriteMachineSpecificRegister",
        0x3156 => "SearchMemory",
        0x3157 => "GetBusData",
        0x3158 => "SetBusData",
        0x3159 => "CheckLowMemory",
        0x315A => "ClearAllInternalBreakpoints",
        0x315B => "FillMemory",
        0x315C => "QueryMemory",
        0x315D => "SwitchPartition",
        _ => "<unknown api>",
    }
}

bitflags! {
    /// Memory attribute flags in a `QueryMemory` reply.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct QueryMemoryFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
        const FIXED = 0x08;
    }
}

/// `AddressSpace` value for kernel VAs in a `QueryMemory` reply.
const QUERY_MEMORY_KERNEL: u32 = 2;

/// What the session has to do after a request was executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Send the first `len` bytes of the staging buffer back as a data
    /// packet of the request's packet type.
    Reply { len: usize },
    /// Nothing goes back to the debugger.
    NoReply,
    /// The guest was resumed; nothing goes back.
    Resumed,
    /// One instruction was stepped; send a fresh exception state change
    /// for `cpu`.
    Break { cpu: usize },
}

/// Executes manipulate requests against the guest.
pub struct Dispatcher<'a, E: Emulator> {
    pub emu: &'a mut E,
    pub breakpoints: &'a mut BreakpointTable,
    pub dr_shadow: &'a mut DrShadow,
    pub ctrl_addrs: &'a CtrlAddrs,
    pub cpu_count: usize,
}

impl<'a, E: Emulator> Dispatcher<'a, E> {
    /// Handles one manipulate packet sitting in `buf[..byte_count]`.
    pub fn dispatch(&mut self, buf: &mut [u8], byte_count: usize) -> Outcome {
        if byte_count < M64_SIZE {
            log::error!("Manipulate packet shorter than its header ({byte_count} bytes)");
            return Outcome::NoReply;
        }
        let api_number = LittleEndian::read_u32(&buf[0..4]);
        let processor = LittleEndian::read_u16(&buf[6..8]) as usize;
        let cpu = if processor < self.cpu_count { processor } else { 0 };
        let extra_size = byte_count - M64_SIZE;

        log::debug!("{} on cpu {cpu}", api_name(api_number));
        put_status(buf, STATUS_SUCCESS);

        let extra = match KdApi::from_u32(api_number) {
            Some(KdApi::ReadVirtualMemory) => self.read_virtual_memory(cpu, buf),
            Some(KdApi::WriteVirtualMemory) => self.write_virtual_memory(cpu, buf, extra_size),
            Some(KdApi::GetContext) => self.get_context(cpu, buf),
            Some(KdApi::SetContext) => self.set_context(cpu, buf, extra_size),
            Some(KdApi::WriteBreakPoint) => self.write_breakpoint(cpu, buf),
            Some(KdApi::RestoreBreakPoint) => self.restore_breakpoint(cpu, buf),
            Some(KdApi::Continue) => {
                self.emu.single_step(cpu, false);
                self.emu.vm_start();
                return Outcome::Resumed;
            }
            Some(KdApi::Continue2) => {
                let trace = LittleEndian::read_u32(&buf[M64_UNION + 4..M64_UNION + 8]);
                if trace != 0 {
                    self.emu.single_step(cpu, true);
                    return Outcome::Break { cpu };
                }
                self.emu.single_step(cpu, false);
                self.emu.vm_start();
                return Outcome::Resumed;
            }
            Some(KdApi::ReadControlSpace) => self.read_control_space(cpu, buf),
            Some(KdApi::WriteControlSpace) => self.write_control_space(cpu, buf, extra_size),
            Some(KdApi::ReadIoSpace) => self.read_io_space(buf),
            Some(KdApi::WriteIoSpace) => self.write_io_space(buf),
            Some(KdApi::ReadPhysicalMemory) => self.read_physical_memory(buf),
            Some(KdApi::WritePhysicalMemory) => self.write_physical_memory(buf, extra_size),
            Some(KdApi::GetVersion) => self.get_version(cpu, buf),
            Some(KdApi::ReadMachineSpecificRegister) => self.read_msr(cpu, buf),
            Some(KdApi::WriteMachineSpecificRegister) => self.write_msr(cpu, buf),
            Some(KdApi::SearchMemory) => self.search_memory(cpu, buf, extra_size),
            Some(KdApi::FillMemory) => self.fill_memory(cpu, buf, extra_size),
            Some(KdApi::QueryMemory) => self.query_memory(buf),
            Some(KdApi::ClearAllInternalBreakpoints) => return Outcome::NoReply,
            None => {
                log::warn!("Unsupported API {:#x} ({})", api_number, api_name(api_number));
                put_status(buf, STATUS_UNSUCCESSFUL);
                0
            }
        };
        Outcome::Reply {
            len: M64_SIZE + extra,
        }
    }

    fn read_virtual_memory(&mut self, cpu: usize, buf: &mut [u8]) -> usize {
        let addr = LittleEndian::read_u64(&buf[M64_UNION..M64_UNION + 8]) as u32;
        let count = LittleEndian::read_u32(&buf[M64_UNION + 8..M64_UNION + 12]) as usize;
        let count = count.min(MAX_EXTRA);
        let actual = self.emu.mem_read(cpu, addr, &mut buf[M64_SIZE..M64_SIZE + count]);
        LittleEndian::write_u32(&mut buf[M64_UNION + 12..M64_UNION + 16], actual as u32);
        if actual == 0 && count > 0 {
            put_status(buf, STATUS_UNSUCCESSFUL);
        }
        actual
    }

    fn write_virtual_memory(&mut self, cpu: usize, buf: &mut [u8], extra_size: usize) -> usize {
        let addr = LittleEndian::read_u64(&buf[M64_UNION..M64_UNION + 8]) as u32;
        let count = LittleEndian::read_u32(&buf[M64_UNION + 8..M64_UNION + 12]) as usize;
        let count = count.min(extra_size);
        let data = buf[M64_SIZE..M64_SIZE + count].to_vec();
        let actual = self.emu.mem_write(cpu, addr, &data);
        LittleEndian::write_u32(&mut buf[M64_UNION + 12..M64_UNION + 16], actual as u32);
        if actual == 0 && count > 0 {
            put_status(buf, STATUS_UNSUCCESSFUL);
        }
        0
    }

    fn get_context(&mut self, cpu: usize, buf: &mut [u8]) -> usize {
        let context = CpuContext::capture(self.emu, cpu);
        buf[M64_SIZE..M64_SIZE + CONTEXT_SIZE].copy_from_slice(&context.encode());
        CONTEXT_SIZE
    }

    fn set_context(&mut self, cpu: usize, buf: &mut [u8], extra_size: usize) -> usize {
        let n = extra_size.min(CONTEXT_SIZE);
        let context = CpuContext::decode(&buf[M64_SIZE..M64_SIZE + n]);
        let image = DrImage {
            dr: [context.dr0, context.dr1, context.dr2, context.dr3],
            dr7: context.dr7,
        };
        let ops = self.dr_shadow.sync(&image);
        self.apply_dr_ops(cpu, ops);
        0
    }

    fn apply_dr_ops(&mut self, cpu: usize, ops: Vec<DrOp>) {
        for op in ops {
            match op {
                DrOp::Remove { addr, len, flags } => self.emu.wp_remove(cpu, addr, len, flags),
                DrOp::Insert { slot, addr, len, flags } => {
                    if let Err(err) = self.emu.wp_insert(cpu, addr, len, flags) {
                        log::warn!("Dropping debug-register slot {slot}: {err}");
                        self.dr_shadow.invalidate(slot);
                    }
                }
            }
        }
    }

    fn write_breakpoint(&mut self, cpu: usize, buf: &mut [u8]) -> usize {
        let addr = LittleEndian::read_u64(&buf[M64_UNION..M64_UNION + 8]) as u32;
        let mut handle = self.breakpoints.alloc(addr);
        if handle != 0 {
            match self.emu.bp_insert(cpu, addr, WatchFlags::STUB) {
                Ok(()) => self.emu.tb_flush(cpu),
                Err(err) => {
                    log::warn!("Breakpoint insert failed: {err}");
                    self.breakpoints.release(handle);
                    handle = 0;
                }
            }
        }
        if handle == 0 {
            put_status(buf, STATUS_UNSUCCESSFUL);
        }
        LittleEndian::write_u32(&mut buf[M64_UNION + 8..M64_UNION + 12], handle);
        0
    }

    fn restore_breakpoint(&mut self, cpu: usize, buf: &mut [u8]) -> usize {
        let handle = LittleEndian::read_u32(&buf[M64_UNION..M64_UNION + 4]);
        match self.breakpoints.release(handle) {
            Some(addr) => self.emu.bp_remove(cpu, addr, WatchFlags::STUB),
            None => put_status(buf, STATUS_UNSUCCESSFUL),
        }
        0
    }

    /// Control space is laid out as the processor state block: the CONTEXT
    /// record first, KSPECIAL_REGISTERS right after it.
    fn read_control_space(&mut self, cpu: usize, buf: &mut [u8]) -> usize {
        let base = LittleEndian::read_u64(&buf[M64_UNION..M64_UNION + 8]);
        let count = LittleEndian::read_u32(&buf[M64_UNION + 8..M64_UNION + 12]) as usize;
        let special = KSpecialRegisters::capture(self.emu, cpu, self.dr_shadow).encode();

        let actual = match control_space_offset(base) {
            Some(offset) => {
                let n = count.min(KSPECIAL_SIZE - offset).min(MAX_EXTRA);
                buf[M64_SIZE..M64_SIZE + n].copy_from_slice(&special[offset..offset + n]);
                n
            }
            None => 0,
        };
        LittleEndian::write_u32(&mut buf[M64_UNION + 12..M64_UNION + 16], actual as u32);
        if actual == 0 && count > 0 {
            put_status(buf, STATUS_UNSUCCESSFUL);
        }
        actual
    }

    fn write_control_space(&mut self, cpu: usize, buf: &mut [u8], extra_size: usize) -> usize {
        let base = LittleEndian::read_u64(&buf[M64_UNION..M64_UNION + 8]);
        let count = LittleEndian::read_u32(&buf[M64_UNION + 8..M64_UNION + 12]) as usize;

        let actual = match control_space_offset(base) {
            Some(offset) => {
                let n = count.min(extra_size).min(KSPECIAL_SIZE - offset);
                let mut image = KSpecialRegisters::capture(self.emu, cpu, self.dr_shadow).encode();
                image[offset..offset + n].copy_from_slice(&buf[M64_SIZE..M64_SIZE + n]);
                KSpecialRegisters::decode(&image).apply(self.emu, cpu);
                n
            }
            None => 0,
        };
        LittleEndian::write_u32(&mut buf[M64_UNION + 12..M64_UNION + 16], actual as u32);
        if actual == 0 && count > 0 {
            put_status(buf, STATUS_UNSUCCESSFUL);
        }
        0
    }

    fn read_io_space(&mut self, buf: &mut [u8]) -> usize {
        let port = LittleEndian::read_u64(&buf[M64_UNION..M64_UNION + 8]) as u16;
        let size = LittleEndian::read_u32(&buf[M64_UNION + 8..M64_UNION + 12]);
        match size {
            1 | 2 | 4 => {
                let value = self.emu.io_read(port, size as u8);
                LittleEndian::write_u32(&mut buf[M64_UNION + 12..M64_UNION + 16], value);
            }
            _ => put_status(buf, STATUS_UNSUCCESSFUL),
        }
        0
    }

    fn write_io_space(&mut self, buf: &mut [u8]) -> usize {
        let port = LittleEndian::read_u64(&buf[M64_UNION..M64_UNION + 8]) as u16;
        let size = LittleEndian::read_u32(&buf[M64_UNION + 8..M64_UNION + 12]);
        let value = LittleEndian::read_u32(&buf[M64_UNION + 12..M64_UNION + 16]);
        match size {
            1 | 2 | 4 => self.emu.io_write(port, size as u8, value),
            _ => put_status(buf, STATUS_UNSUCCESSFUL),
        }
        0
    }

    fn read_physical_memory(&mut self, buf: &mut [u8]) -> usize {
        let addr = LittleEndian::read_u64(&buf[M64_UNION..M64_UNION + 8]);
        let count = LittleEndian::read_u32(&buf[M64_UNION + 8..M64_UNION + 12]) as usize;
        let count = count.min(MAX_EXTRA);
        let actual = self.emu.phys_read(addr, &mut buf[M64_SIZE..M64_SIZE + count]);
        LittleEndian::write_u32(&mut buf[M64_UNION + 12..M64_UNION + 16], actual as u32);
        if actual == 0 && count > 0 {
            put_status(buf, STATUS_UNSUCCESSFUL);
        }
        actual
    }

    fn write_physical_memory(&mut self, buf: &mut [u8], extra_size: usize) -> usize {
        let addr = LittleEndian::read_u64(&buf[M64_UNION..M64_UNION + 8]);
        let count = LittleEndian::read_u32(&buf[M64_UNION + 8..M64_UNION + 12]) as usize;
        let count = count.min(extra_size);
        let data = buf[M64_SIZE..M64_SIZE + count].to_vec();
        let actual = self.emu.phys_write(addr, &data);
        LittleEndian::write_u32(&mut buf[M64_UNION + 12..M64_UNION + 16], actual as u32);
        if actual == 0 && count > 0 {
            put_status(buf, STATUS_UNSUCCESSFUL);
        }
        0
    }

    fn get_version(&mut self, cpu: usize, buf: &mut [u8]) -> usize {
        let version_addr = self.ctrl_addrs.version;
        let n = self
            .emu
            .mem_read(cpu, version_addr, &mut buf[M64_UNION..M64_UNION + VERSION_BLOCK_SIZE]);
        if n < VERSION_BLOCK_SIZE {
            log::warn!("Short read of the guest version block at {version_addr:#x}");
            put_status(buf, STATUS_UNSUCCESSFUL);
        }
        0
    }

    fn read_msr(&mut self, cpu: usize, buf: &mut [u8]) -> usize {
        let msr = LittleEndian::read_u32(&buf[M64_UNION..M64_UNION + 4]);
        let value = self.emu.msr_read(cpu, msr);
        LittleEndian::write_u32(&mut buf[M64_UNION + 4..M64_UNION + 8], value as u32);
        LittleEndian::write_u32(&mut buf[M64_UNION + 8..M64_UNION + 12], (value >> 32) as u32);
        0
    }

    fn write_msr(&mut self, cpu: usize, buf: &mut [u8]) -> usize {
        let msr = LittleEndian::read_u32(&buf[M64_UNION..M64_UNION + 4]);
        let low = LittleEndian::read_u32(&buf[M64_UNION + 4..M64_UNION + 8]) as u64;
        let high = LittleEndian::read_u32(&buf[M64_UNION + 8..M64_UNION + 12]) as u64;
        self.emu.msr_write(cpu, msr, high << 32 | low);
        0
    }

    fn search_memory(&mut self, cpu: usize, buf: &mut [u8], extra_size: usize) -> usize {
        let start = LittleEndian::read_u64(&buf[M64_UNION..M64_UNION + 8]);
        let length = LittleEndian::read_u64(&buf[M64_UNION + 8..M64_UNION + 16]);
        let pat_len = LittleEndian::read_u32(&buf[M64_UNION + 16..M64_UNION + 20]) as usize;
        let pat_len = pat_len.min(extra_size);
        if pat_len == 0 {
            put_status(buf, STATUS_UNSUCCESSFUL);
            return 0;
        }
        let pattern = buf[M64_SIZE..M64_SIZE + pat_len].to_vec();

        match self.search_guest(cpu, start, length, &pattern) {
            Some(found) => LittleEndian::write_u64(&mut buf[M64_UNION..M64_UNION + 8], found),
            None => put_status(buf, STATUS_UNSUCCESSFUL),
        }
        0
    }

    /// Scans `[start, start+length)` for `pattern` in overlapping chunks,
    /// stopping at the first unmapped byte.
    fn search_guest(&mut self, cpu: usize, start: u64, length: u64, pattern: &[u8]) -> Option<u64> {
        let pat_len = pattern.len();
        let end = start.saturating_add(length);
        let mut chunk = vec![0u8; 0x400 + pat_len - 1];
        let mut addr = start;
        while addr < end {
            let want = ((end - addr).min(chunk.len() as u64)) as usize;
            let got = self.emu.mem_read(cpu, addr as u32, &mut chunk[..want]);
            if got >= pat_len {
                if let Some(pos) = chunk[..got].windows(pat_len).position(|w| w == pattern) {
                    return Some(addr + pos as u64);
                }
            }
            if got < want || want < chunk.len() {
                return None;
            }
            // Overlap by pat_len-1 so boundary-straddling matches are seen.
            addr += (want - (pat_len - 1)) as u64;
        }
        None
    }

    fn fill_memory(&mut self, cpu: usize, buf: &mut [u8], extra_size: usize) -> usize {
        const FILL_PHYSICAL: u16 = 0x2;

        let addr = LittleEndian::read_u64(&buf[M64_UNION..M64_UNION + 8]);
        let length = LittleEndian::read_u32(&buf[M64_UNION + 8..M64_UNION + 12]) as usize;
        let flags = LittleEndian::read_u16(&buf[M64_UNION + 12..M64_UNION + 14]);
        let pat_len = LittleEndian::read_u16(&buf[M64_UNION + 14..M64_UNION + 16]) as usize;
        let pat_len = pat_len.min(extra_size);
        if pat_len == 0 {
            put_status(buf, STATUS_UNSUCCESSFUL);
            return 0;
        }
        let pattern = buf[M64_SIZE..M64_SIZE + pat_len].to_vec();

        let mut written = 0usize;
        while written < length {
            let n = pat_len.min(length - written);
            let offset = addr + written as u64;
            let done = if flags & FILL_PHYSICAL != 0 {
                self.emu.phys_write(offset, &pattern[..n])
            } else {
                self.emu.mem_write(cpu, offset as u32, &pattern[..n])
            };
            written += done;
            if done < n {
                break;
            }
        }
        if written == 0 && length > 0 {
            put_status(buf, STATUS_UNSUCCESSFUL);
        }
        0
    }

    fn query_memory(&mut self, buf: &mut [u8]) -> usize {
        // Everything the debugger asks about is kernel address space with
        // full access, matching what a kernel target reports.
        LittleEndian::write_u32(&mut buf[M64_UNION + 16..M64_UNION + 20], QUERY_MEMORY_KERNEL);
        LittleEndian::write_u32(
            &mut buf[M64_UNION + 20..M64_UNION + 24],
            (QueryMemoryFlags::READ | QueryMemoryFlags::WRITE | QueryMemoryFlags::EXECUTE).bits(),
        );
        0
    }
}

fn put_status(buf: &mut [u8], status: u32) {
    LittleEndian::write_u32(&mut buf[8..12], status);
}

fn control_space_offset(base: u64) -> Option<usize> {
    let offset = base.checked_sub(CONTEXT_SIZE as u64)?;
    let offset = usize::try_from(offset).ok()?;
    (offset < KSPECIAL_SIZE).then_some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::testing::{EmuCall, FakeEmu};
    use crate::packet::PACKET_MAX_SIZE;

    fn staging() -> Vec<u8> {
        vec![0u8; PACKET_MAX_SIZE]
    }

    fn put_request(buf: &mut [u8], api: u32, processor: u16) {
        LittleEndian::write_u32(&mut buf[0..4], api);
        LittleEndian::write_u16(&mut buf[6..8], processor);
    }

    fn status_of(buf: &[u8]) -> u32 {
        LittleEndian::read_u32(&buf[8..12])
    }

    fn dispatch_on(
        emu: &mut FakeEmu,
        bps: &mut BreakpointTable,
        shadow: &mut DrShadow,
        buf: &mut [u8],
        byte_count: usize,
    ) -> Outcome {
        let ctrl = CtrlAddrs::default();
        let mut dispatcher = Dispatcher {
            emu,
            breakpoints: bps,
            dr_shadow: shadow,
            ctrl_addrs: &ctrl,
            cpu_count: 1,
        };
        dispatcher.dispatch(buf, byte_count)
    }

    #[test]
    fn read_virtual_memory_returns_the_bytes() {
        let mut emu = FakeEmu::new();
        emu.map_bytes(0x8000_0000, &[0xde, 0xad, 0xbe, 0xef]);
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::ReadVirtualMemory as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x8000_0000);
        LittleEndian::write_u32(&mut buf[24..28], 4);

        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::Reply { len: M64_SIZE + 4 });
        assert_eq!(status_of(&buf), STATUS_SUCCESS);
        assert_eq!(LittleEndian::read_u32(&buf[28..32]), 4); // ActualBytesRead
        assert_eq!(&buf[M64_SIZE..M64_SIZE + 4], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn read_of_unmapped_memory_fails_with_zero_bytes() {
        let mut emu = FakeEmu::new();
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::ReadVirtualMemory as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x1234);
        LittleEndian::write_u32(&mut buf[24..28], 16);

        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::Reply { len: M64_SIZE });
        assert_eq!(status_of(&buf), STATUS_UNSUCCESSFUL);
        assert_eq!(LittleEndian::read_u32(&buf[28..32]), 0);
    }

    #[test]
    fn partial_read_reports_achieved_count_as_success() {
        let mut emu = FakeEmu::new();
        emu.map_bytes(0x9000_0000, &[1, 2, 3]);
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::ReadVirtualMemory as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x9000_0000);
        LittleEndian::write_u32(&mut buf[24..28], 8);

        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::Reply { len: M64_SIZE + 3 });
        assert_eq!(status_of(&buf), STATUS_SUCCESS);
        assert_eq!(LittleEndian::read_u32(&buf[28..32]), 3);
    }

    #[test]
    fn write_virtual_memory_honors_transfer_count() {
        let mut emu = FakeEmu::new();
        emu.map_bytes(0x8000_1000, &[0; 8]);
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::WriteVirtualMemory as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x8000_1000);
        LittleEndian::write_u32(&mut buf[24..28], 4);
        buf[M64_SIZE..M64_SIZE + 6].copy_from_slice(&[9, 8, 7, 6, 5, 4]);

        // Six payload bytes arrive but TransferCount asks for four.
        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE + 6);
        assert_eq!(outcome, Outcome::Reply { len: M64_SIZE });
        assert_eq!(LittleEndian::read_u32(&buf[28..32]), 4);
        assert_eq!(emu.mem.get(&0x8000_1000), Some(&9));
        assert_eq!(emu.mem.get(&0x8000_1003), Some(&6));
        assert_eq!(emu.mem.get(&0x8000_1004), Some(&0));
    }

    #[test]
    fn get_context_replies_with_a_full_context_record() {
        let mut emu = FakeEmu::new();
        emu.gp.eip = 0xcafe_f00d;
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::GetContext as u32, 0);

        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::Reply { len: M64_SIZE + CONTEXT_SIZE });
        let ctx = CpuContext::decode(&buf[M64_SIZE..M64_SIZE + CONTEXT_SIZE]);
        assert_eq!(ctx.eip, 0xcafe_f00d);
    }

    #[test]
    fn set_context_programs_one_write_watchpoint() {
        let mut emu = FakeEmu::new();
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut context = CpuContext::default();
        context.dr0 = 0x4141_4140;
        context.dr7 = 0x0001_0401; // L0, type write, len 1

        let mut buf = staging();
        put_request(&mut buf, KdApi::SetContext as u32, 0);
        buf[M64_SIZE..M64_SIZE + CONTEXT_SIZE].copy_from_slice(&context.encode());

        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE + CONTEXT_SIZE);
        assert_eq!(outcome, Outcome::Reply { len: M64_SIZE });
        assert_eq!(status_of(&buf), STATUS_SUCCESS);
        assert_eq!(
            emu.watch_calls(),
            vec![EmuCall::WpInsert {
                cpu: 0,
                addr: 0x4141_4140,
                len: 1,
                flags: WatchFlags::WRITE | WatchFlags::STUB,
            }]
        );
        assert!(shadow.any_installed());
        assert_eq!(shadow.slot_addr(0), Some(0x4141_4140));

        // The same image again is a no-op.
        let mut buf2 = staging();
        put_request(&mut buf2, KdApi::SetContext as u32, 0);
        buf2[M64_SIZE..M64_SIZE + CONTEXT_SIZE].copy_from_slice(&context.encode());
        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf2, M64_SIZE + CONTEXT_SIZE);
        assert_eq!(emu.watch_calls().len(), 1);
    }

    #[test]
    fn rejected_watchpoint_invalidates_the_slot() {
        let mut emu = FakeEmu::new();
        emu.reject_wp_lens.push(8);
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut context = CpuContext::default();
        context.dr0 = 0x5000;
        // L0, type write, len field 2 -> 8 bytes.
        context.dr7 = 0x0009_0001;

        let mut buf = staging();
        put_request(&mut buf, KdApi::SetContext as u32, 0);
        buf[M64_SIZE..M64_SIZE + CONTEXT_SIZE].copy_from_slice(&context.encode());
        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE + CONTEXT_SIZE);

        assert_eq!(emu.watch_calls(), vec![]);
        assert!(!shadow.any_installed());
    }

    #[test]
    fn breakpoint_cycle_matches_the_table_and_emulator() {
        let mut emu = FakeEmu::new();
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::WriteBreakPoint as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x1000);
        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(status_of(&buf), STATUS_SUCCESS);
        assert_eq!(LittleEndian::read_u32(&buf[24..28]), 1); // handle
        assert_eq!(
            emu.calls,
            vec![
                EmuCall::BpInsert { cpu: 0, addr: 0x1000 },
                EmuCall::TbFlush { cpu: 0 },
            ]
        );

        let mut buf = staging();
        put_request(&mut buf, KdApi::RestoreBreakPoint as u32, 0);
        LittleEndian::write_u32(&mut buf[16..20], 1);
        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(status_of(&buf), STATUS_SUCCESS);
        assert_eq!(emu.calls.last(), Some(&EmuCall::BpRemove { cpu: 0, addr: 0x1000 }));

        // Restoring the same handle again fails and removes nothing.
        let removes_before = emu.calls.len();
        let mut buf = staging();
        put_request(&mut buf, KdApi::RestoreBreakPoint as u32, 0);
        LittleEndian::write_u32(&mut buf[16..20], 1);
        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(status_of(&buf), STATUS_UNSUCCESSFUL);
        assert_eq!(emu.calls.len(), removes_before);
    }

    #[test]
    fn control_space_reads_special_registers_after_the_context() {
        let mut emu = FakeEmu::new();
        emu.cr.cr3 = 0x0039_d000;
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::ReadControlSpace as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], CONTEXT_SIZE as u64);
        LittleEndian::write_u32(&mut buf[24..28], KSPECIAL_SIZE as u32);

        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::Reply { len: M64_SIZE + KSPECIAL_SIZE });
        let special = KSpecialRegisters::decode(&buf[M64_SIZE..M64_SIZE + KSPECIAL_SIZE]);
        assert_eq!(special.cr3, 0x0039_d000);
    }

    #[test]
    fn control_space_below_the_context_is_rejected() {
        let mut emu = FakeEmu::new();
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::ReadControlSpace as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x10);
        LittleEndian::write_u32(&mut buf[24..28], 4);

        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(status_of(&buf), STATUS_UNSUCCESSFUL);
    }

    #[test]
    fn write_control_space_applies_control_registers() {
        let mut emu = FakeEmu::new();
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut special = KSpecialRegisters::default();
        special.cr3 = 0x1234_5000;
        let image = special.encode();

        let mut buf = staging();
        put_request(&mut buf, KdApi::WriteControlSpace as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], CONTEXT_SIZE as u64);
        LittleEndian::write_u32(&mut buf[24..28], KSPECIAL_SIZE as u32);
        buf[M64_SIZE..M64_SIZE + KSPECIAL_SIZE].copy_from_slice(&image);

        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE + KSPECIAL_SIZE);
        assert_eq!(emu.cr.cr3, 0x1234_5000);
        assert_eq!(LittleEndian::read_u32(&buf[28..32]), KSPECIAL_SIZE as u32);
    }

    #[test]
    fn continue_resumes_the_guest_without_a_reply() {
        let mut emu = FakeEmu::new();
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::Continue as u32, 0);
        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::Resumed);
        assert_eq!(
            emu.calls,
            vec![
                EmuCall::SingleStep { cpu: 0, enable: false },
                EmuCall::VmStart,
            ]
        );
    }

    #[test]
    fn continue2_with_trace_flag_steps_and_breaks() {
        let mut emu = FakeEmu::new();
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::Continue2 as u32, 0);
        LittleEndian::write_u32(&mut buf[20..24], 1); // ControlSet.TraceFlag
        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::Break { cpu: 0 });
        assert_eq!(emu.calls, vec![EmuCall::SingleStep { cpu: 0, enable: true }]);
    }

    #[test]
    fn get_version_copies_the_guest_version_block() {
        let mut emu = FakeEmu::new();
        let version: Vec<u8> = (0u8..40).collect();
        emu.map_bytes(0x8300_0000, &version);
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();
        let ctrl = CtrlAddrs { version: 0x8300_0000, ..CtrlAddrs::default() };

        let mut buf = staging();
        put_request(&mut buf, KdApi::GetVersion as u32, 0);
        let mut dispatcher = Dispatcher {
            emu: &mut emu,
            breakpoints: &mut bps,
            dr_shadow: &mut shadow,
            ctrl_addrs: &ctrl,
            cpu_count: 1,
        };
        let outcome = dispatcher.dispatch(&mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::Reply { len: M64_SIZE });
        assert_eq!(status_of(&buf), STATUS_SUCCESS);
        assert_eq!(&buf[16..56], version.as_slice());
    }

    #[test]
    fn io_space_round_trip() {
        let mut emu = FakeEmu::new();
        emu.io_value = 0xab;
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::ReadIoSpace as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x3f8);
        LittleEndian::write_u32(&mut buf[24..28], 1);
        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(LittleEndian::read_u32(&buf[28..32]), 0xab);

        let mut buf = staging();
        put_request(&mut buf, KdApi::WriteIoSpace as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x3f8);
        LittleEndian::write_u32(&mut buf[24..28], 3); // bogus size
        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(status_of(&buf), STATUS_UNSUCCESSFUL);
    }

    #[test]
    fn msr_round_trip() {
        let mut emu = FakeEmu::new();
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::WriteMachineSpecificRegister as u32, 0);
        LittleEndian::write_u32(&mut buf[16..20], 0x1b); // IA32_APIC_BASE
        LittleEndian::write_u32(&mut buf[20..24], 0xfee0_0900);
        LittleEndian::write_u32(&mut buf[24..28], 0x1);
        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(emu.msrs.get(&0x1b), Some(&0x1_fee0_0900));

        let mut buf = staging();
        put_request(&mut buf, KdApi::ReadMachineSpecificRegister as u32, 0);
        LittleEndian::write_u32(&mut buf[16..20], 0x1b);
        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(LittleEndian::read_u32(&buf[20..24]), 0xfee0_0900);
        assert_eq!(LittleEndian::read_u32(&buf[24..28]), 0x1);
    }

    #[test]
    fn search_memory_finds_a_pattern() {
        let mut emu = FakeEmu::new();
        let mut region = vec![0u8; 0x1000];
        region[0x7fe..0x802].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        emu.map_bytes(0x8000_0000, &region);
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::SearchMemory as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x8000_0000);
        LittleEndian::write_u64(&mut buf[24..32], 0x1000);
        LittleEndian::write_u32(&mut buf[32..36], 4);
        buf[M64_SIZE..M64_SIZE + 4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE + 4);
        assert_eq!(status_of(&buf), STATUS_SUCCESS);
        // The match straddles the first chunk boundary.
        assert_eq!(LittleEndian::read_u64(&buf[16..24]), 0x8000_07fe);
    }

    #[test]
    fn search_memory_misses_cleanly() {
        let mut emu = FakeEmu::new();
        emu.map_bytes(0x8000_0000, &[0u8; 64]);
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::SearchMemory as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x8000_0000);
        LittleEndian::write_u64(&mut buf[24..32], 64);
        LittleEndian::write_u32(&mut buf[32..36], 2);
        buf[M64_SIZE..M64_SIZE + 2].copy_from_slice(&[0xaa, 0xbb]);

        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE + 2);
        assert_eq!(status_of(&buf), STATUS_UNSUCCESSFUL);
    }

    #[test]
    fn fill_memory_repeats_the_pattern() {
        let mut emu = FakeEmu::new();
        emu.map_bytes(0x8000_2000, &[0u8; 8]);
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::FillMemory as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x8000_2000);
        LittleEndian::write_u32(&mut buf[24..28], 7); // length
        LittleEndian::write_u16(&mut buf[28..30], 0x1); // virtual
        LittleEndian::write_u16(&mut buf[30..32], 3); // pattern length
        buf[M64_SIZE..M64_SIZE + 3].copy_from_slice(&[1, 2, 3]);

        dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE + 3);
        let got: Vec<u8> = (0..8).map(|i| emu.mem[&(0x8000_2000 + i)]).collect();
        assert_eq!(got, vec![1, 2, 3, 1, 2, 3, 1, 0]);
    }

    #[test]
    fn query_memory_reports_kernel_rwx() {
        let mut emu = FakeEmu::new();
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::QueryMemory as u32, 0);
        LittleEndian::write_u64(&mut buf[16..24], 0x8010_0000);
        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::Reply { len: M64_SIZE });
        assert_eq!(LittleEndian::read_u32(&buf[32..36]), QUERY_MEMORY_KERNEL);
        assert_eq!(LittleEndian::read_u32(&buf[36..40]), 0x7);
    }

    #[test]
    fn unsupported_api_replies_header_only_with_failure() {
        let mut emu = FakeEmu::new();
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, 0x3149, 0); // CauseBugCheck, not implemented
        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::Reply { len: M64_SIZE });
        assert_eq!(status_of(&buf), STATUS_UNSUCCESSFUL);
    }

    #[test]
    fn clear_all_internal_breakpoints_is_a_silent_noop() {
        let mut emu = FakeEmu::new();
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::ClearAllInternalBreakpoints as u32, 0);
        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::NoReply);
        assert!(emu.calls.is_empty());
    }

    #[test]
    fn out_of_range_processor_index_falls_back_to_cpu_zero() {
        let mut emu = FakeEmu::new();
        emu.map_bytes(0x8000_0000, &[0x77]);
        let mut bps = BreakpointTable::new();
        let mut shadow = DrShadow::new();

        let mut buf = staging();
        put_request(&mut buf, KdApi::ReadVirtualMemory as u32, 9);
        LittleEndian::write_u64(&mut buf[16..24], 0x8000_0000);
        LittleEndian::write_u32(&mut buf[24..28], 1);
        let outcome = dispatch_on(&mut emu, &mut bps, &mut shadow, &mut buf, M64_SIZE);
        assert_eq!(outcome, Outcome::Reply { len: M64_SIZE + 1 });
        assert_eq!(buf[M64_SIZE], 0x77);
    }
}
