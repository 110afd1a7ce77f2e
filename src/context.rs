//! Wire-format views of guest CPU state: the 32-bit `CONTEXT` record, the
//! `KSPECIAL_REGISTERS` block, the control-address walk through the KPCR,
//! and the two state-change notifications the stub sends on its own
//! initiative (exception and load-symbols).
//!
//! All layouts are the 32-bit x86 ones, serialized field by field in
//! little-endian; no struct is ever reinterpreted from raw memory.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::debug_regs::DrShadow;
use crate::emu::{DebugRegs, DescriptorTable, Emulator};

/// Size of the 32-bit CONTEXT record on the wire.
pub const CONTEXT_SIZE: usize = 716;
/// Size of KSPECIAL_REGISTERS on the wire.
pub const KSPECIAL_SIZE: usize = 84;
/// Size of DBGKD_ANY_WAIT_STATE_CHANGE as this stub lays it out.
pub const STATE_CHANGE_SIZE: usize = 236;

/// `NewState` values of a wait-state-change notification.
pub const EXCEPTION_STATE_CHANGE: u32 = 0x0000_3030;
pub const LOAD_SYMBOLS_STATE_CHANGE: u32 = 0x0000_3031;

/// STATUS_BREAKPOINT, reported for every stop.
pub const STATUS_BREAKPOINT: u32 = 0x8000_0003;

/// KPCR.Prcb on 32-bit NT.
pub const OFFSET_KPRCB: u32 = 0x120;
/// KPCR.KdVersionBlock.
pub const OFFSET_VERSION: u32 = 0x34;
/// KernBase inside the KD version block.
pub const OFFSET_KRNL_BASE: u32 = 0x10;
/// KPRCB.CurrentThread.
pub const OFFSET_KPRCB_CURRTHREAD: u32 = 0x4;

/// Fixed guest VA of the kernel image path (wide string, Win7 layout).
pub const NT_KRNL_PNAME_ADDR: u32 = 0x8900_0fb8;

/// Reported processor level (family); Pentium 4 class.
const PROCESSOR_LEVEL: u16 = 6;

bitflags! {
    /// CONTEXT_* selector bits of the 32-bit context record.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        const I386 = 0x0001_0000;
        const CONTROL = Self::I386.bits() | 0x01;
        const INTEGER = Self::I386.bits() | 0x02;
        const SEGMENTS = Self::I386.bits() | 0x04;
        const FLOATING_POINT = Self::I386.bits() | 0x08;
        const DEBUG_REGISTERS = Self::I386.bits() | 0x10;
        const EXTENDED_REGISTERS = Self::I386.bits() | 0x20;
        const FULL = Self::CONTROL.bits() | Self::INTEGER.bits() | Self::SEGMENTS.bits();
        const ALL = Self::FULL.bits()
            | Self::FLOATING_POINT.bits()
            | Self::DEBUG_REGISTERS.bits()
            | Self::EXTENDED_REGISTERS.bits();
    }
}

/// FLOATING_SAVE_AREA: the x87 portion of the context record.
#[derive(Clone, Copy, Debug)]
pub struct FloatSave {
    pub control_word: u32,
    pub status_word: u32,
    pub tag_word: u32,
    pub error_offset: u32,
    pub error_selector: u32,
    pub data_offset: u32,
    pub data_selector: u32,
    pub register_area: [u8; 80],
    pub cr0_npx_state: u32,
}

impl Default for FloatSave {
    fn default() -> Self {
        FloatSave {
            control_word: 0,
            status_word: 0,
            tag_word: 0,
            error_offset: 0,
            error_selector: 0,
            data_offset: 0,
            data_selector: 0,
            register_area: [0; 80],
            cr0_npx_state: 0,
        }
    }
}

/// The 32-bit CONTEXT record, field for field.
#[derive(Clone, Debug)]
pub struct CpuContext {
    pub context_flags: u32,
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,
    pub float_save: FloatSave,
    pub seg_gs: u32,
    pub seg_fs: u32,
    pub seg_es: u32,
    pub seg_ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub seg_cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub seg_ss: u32,
    pub extended_registers: [u8; 512],
}

impl Default for CpuContext {
    fn default() -> Self {
        CpuContext {
            context_flags: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            dr7: 0,
            float_save: FloatSave::default(),
            seg_gs: 0,
            seg_fs: 0,
            seg_es: 0,
            seg_ds: 0,
            edi: 0,
            esi: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            ebp: 0,
            eip: 0,
            seg_cs: 0,
            eflags: 0,
            esp: 0,
            seg_ss: 0,
            extended_registers: [0; 512],
        }
    }
}

impl CpuContext {
    /// Snapshots the full context of one CPU, with `ContextFlags = ALL`.
    pub fn capture<E: Emulator>(emu: &mut E, cpu: usize) -> Self {
        let gp = emu.gp_regs(cpu);
        let segs = emu.segments(cpu);
        let cr = emu.control_regs(cpu);
        let dr = emu.debug_regs(cpu);
        let fpu = emu.fpu_state(cpu);
        let xmm = emu.xmm_regs(cpu);

        let mut float_save = FloatSave {
            control_word: fpu.control as u32,
            status_word: fpu.status as u32,
            tag_word: fpu.tag as u32,
            error_offset: fpu.last_ip as u32,
            error_selector: (fpu.last_ip >> 32) as u32,
            data_offset: fpu.last_dp as u32,
            data_selector: (fpu.last_dp >> 32) as u32,
            register_area: [0; 80],
            cr0_npx_state: cr.cr0,
        };
        for (i, st) in fpu.st.iter().enumerate() {
            float_save.register_area[i * 10..i * 10 + 10].copy_from_slice(st);
        }

        // The extended area is an FXSAVE image: XMM0..7 at offset 160,
        // MXCSR at offset 24.
        let mut extended_registers = [0u8; 512];
        LittleEndian::write_u32(&mut extended_registers[24..28], xmm.mxcsr);
        for (i, reg) in xmm.regs.iter().enumerate() {
            let off = 160 + i * 16;
            extended_registers[off..off + 16].copy_from_slice(reg);
        }
        extended_registers[0] = 0xaa;

        CpuContext {
            context_flags: ContextFlags::ALL.bits(),
            dr0: dr.dr0,
            dr1: dr.dr1,
            dr2: dr.dr2,
            dr3: dr.dr3,
            dr6: dr.dr6,
            dr7: dr.dr7,
            float_save,
            seg_gs: segs.gs.selector as u32,
            seg_fs: segs.fs.selector as u32,
            seg_es: segs.es.selector as u32,
            seg_ds: segs.ds.selector as u32,
            edi: gp.edi,
            esi: gp.esi,
            ebx: gp.ebx,
            edx: gp.edx,
            ecx: gp.ecx,
            eax: gp.eax,
            ebp: gp.ebp,
            eip: gp.eip,
            seg_cs: segs.cs.selector as u32,
            eflags: gp.eflags,
            esp: gp.esp,
            seg_ss: segs.ss.selector as u32,
            extended_registers,
        }
    }

    pub fn encode(&self) -> [u8; CONTEXT_SIZE] {
        let mut buf = [0u8; CONTEXT_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.context_flags);
        LittleEndian::write_u32(&mut buf[4..8], self.dr0);
        LittleEndian::write_u32(&mut buf[8..12], self.dr1);
        LittleEndian::write_u32(&mut buf[12..16], self.dr2);
        LittleEndian::write_u32(&mut buf[16..20], self.dr3);
        LittleEndian::write_u32(&mut buf[20..24], self.dr6);
        LittleEndian::write_u32(&mut buf[24..28], self.dr7);
        let fs = &self.float_save;
        LittleEndian::write_u32(&mut buf[28..32], fs.control_word);
        LittleEndian::write_u32(&mut buf[32..36], fs.status_word);
        LittleEndian::write_u32(&mut buf[36..40], fs.tag_word);
        LittleEndian::write_u32(&mut buf[40..44], fs.error_offset);
        LittleEndian::write_u32(&mut buf[44..48], fs.error_selector);
        LittleEndian::write_u32(&mut buf[48..52], fs.data_offset);
        LittleEndian::write_u32(&mut buf[52..56], fs.data_selector);
        buf[56..136].copy_from_slice(&fs.register_area);
        LittleEndian::write_u32(&mut buf[136..140], fs.cr0_npx_state);
        LittleEndian::write_u32(&mut buf[140..144], self.seg_gs);
        LittleEndian::write_u32(&mut buf[144..148], self.seg_fs);
        LittleEndian::write_u32(&mut buf[148..152], self.seg_es);
        LittleEndian::write_u32(&mut buf[152..156], self.seg_ds);
        LittleEndian::write_u32(&mut buf[156..160], self.edi);
        LittleEndian::write_u32(&mut buf[160..164], self.esi);
        LittleEndian::write_u32(&mut buf[164..168], self.ebx);
        LittleEndian::write_u32(&mut buf[168..172], self.edx);
        LittleEndian::write_u32(&mut buf[172..176], self.ecx);
        LittleEndian::write_u32(&mut buf[176..180], self.eax);
        LittleEndian::write_u32(&mut buf[180..184], self.ebp);
        LittleEndian::write_u32(&mut buf[184..188], self.eip);
        LittleEndian::write_u32(&mut buf[188..192], self.seg_cs);
        LittleEndian::write_u32(&mut buf[192..196], self.eflags);
        LittleEndian::write_u32(&mut buf[196..200], self.esp);
        LittleEndian::write_u32(&mut buf[200..204], self.seg_ss);
        buf[204..716].copy_from_slice(&self.extended_registers);
        buf
    }

    /// Parses a context record; short input is treated as zero-padded.
    pub fn decode(data: &[u8]) -> Self {
        let mut buf = [0u8; CONTEXT_SIZE];
        let n = data.len().min(CONTEXT_SIZE);
        buf[..n].copy_from_slice(&data[..n]);

        let mut float_save = FloatSave {
            control_word: LittleEndian::read_u32(&buf[28..32]),
            status_word: LittleEndian::read_u32(&buf[32..36]),
            tag_word: LittleEndian::read_u32(&buf[36..40]),
            error_offset: LittleEndian::read_u32(&buf[40..44]),
            error_selector: LittleEndian::read_u32(&buf[44..48]),
            data_offset: LittleEndian::read_u32(&buf[48..52]),
            data_selector: LittleEndian::read_u32(&buf[52..56]),
            register_area: [0; 80],
            cr0_npx_state: LittleEndian::read_u32(&buf[136..140]),
        };
        float_save.register_area.copy_from_slice(&buf[56..136]);

        let mut extended_registers = [0u8; 512];
        extended_registers.copy_from_slice(&buf[204..716]);

        CpuContext {
            context_flags: LittleEndian::read_u32(&buf[0..4]),
            dr0: LittleEndian::read_u32(&buf[4..8]),
            dr1: LittleEndian::read_u32(&buf[8..12]),
            dr2: LittleEndian::read_u32(&buf[12..16]),
            dr3: LittleEndian::read_u32(&buf[16..20]),
            dr6: LittleEndian::read_u32(&buf[20..24]),
            dr7: LittleEndian::read_u32(&buf[24..28]),
            float_save,
            seg_gs: LittleEndian::read_u32(&buf[140..144]),
            seg_fs: LittleEndian::read_u32(&buf[144..148]),
            seg_es: LittleEndian::read_u32(&buf[148..152]),
            seg_ds: LittleEndian::read_u32(&buf[152..156]),
            edi: LittleEndian::read_u32(&buf[156..160]),
            esi: LittleEndian::read_u32(&buf[160..164]),
            ebx: LittleEndian::read_u32(&buf[164..168]),
            edx: LittleEndian::read_u32(&buf[168..172]),
            ecx: LittleEndian::read_u32(&buf[172..176]),
            eax: LittleEndian::read_u32(&buf[176..180]),
            ebp: LittleEndian::read_u32(&buf[180..184]),
            eip: LittleEndian::read_u32(&buf[184..188]),
            seg_cs: LittleEndian::read_u32(&buf[188..192]),
            eflags: LittleEndian::read_u32(&buf[192..196]),
            esp: LittleEndian::read_u32(&buf[196..200]),
            seg_ss: LittleEndian::read_u32(&buf[200..204]),
            extended_registers,
        }
    }
}

/// KSPECIAL_REGISTERS: control registers, kernel debug registers, and the
/// descriptor tables.
#[derive(Clone, Copy, Debug, Default)]
pub struct KSpecialRegisters {
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub kernel_dr0: u32,
    pub kernel_dr1: u32,
    pub kernel_dr2: u32,
    pub kernel_dr3: u32,
    pub kernel_dr6: u32,
    pub kernel_dr7: u32,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub tr: u16,
    pub ldtr: u16,
    pub reserved: [u32; 6],
}

impl KSpecialRegisters {
    /// Snapshots the special registers. Kernel debug registers prefer the
    /// debugger-written shadow over the live CPU values, so the debugger
    /// reads back what it programmed.
    pub fn capture<E: Emulator>(emu: &mut E, cpu: usize, shadow: &DrShadow) -> Self {
        let cr = emu.control_regs(cpu);
        let dr = emu.debug_regs(cpu);
        let segs = emu.segments(cpu);

        KSpecialRegisters {
            cr0: cr.cr0,
            cr2: cr.cr2,
            cr3: cr.cr3,
            cr4: cr.cr4,
            kernel_dr0: shadow.kernel_dr(0, dr.dr0),
            kernel_dr1: shadow.kernel_dr(1, dr.dr1),
            kernel_dr2: shadow.kernel_dr(2, dr.dr2),
            kernel_dr3: shadow.kernel_dr(3, dr.dr3),
            kernel_dr6: dr.dr6,
            kernel_dr7: shadow.kernel_dr7(dr.dr7),
            gdtr: segs.gdt,
            idtr: segs.idt,
            tr: segs.tr,
            ldtr: segs.ldtr,
            reserved: [0; 6],
        }
    }

    /// Applies the writable parts back to the CPU: CR0..CR4 and the kernel
    /// debug-register image. Descriptor tables are not writable through
    /// the emulator interface and are left alone.
    pub fn apply<E: Emulator>(&self, emu: &mut E, cpu: usize) {
        let mut cr = emu.control_regs(cpu);
        cr.cr0 = self.cr0;
        cr.cr2 = self.cr2;
        cr.cr3 = self.cr3;
        cr.cr4 = self.cr4;
        emu.set_control_regs(cpu, cr);
        emu.set_debug_regs(
            cpu,
            DebugRegs {
                dr0: self.kernel_dr0,
                dr1: self.kernel_dr1,
                dr2: self.kernel_dr2,
                dr3: self.kernel_dr3,
                dr6: self.kernel_dr6,
                dr7: self.kernel_dr7,
            },
        );
    }

    pub fn encode(&self) -> [u8; KSPECIAL_SIZE] {
        let mut buf = [0u8; KSPECIAL_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.cr0);
        LittleEndian::write_u32(&mut buf[4..8], self.cr2);
        LittleEndian::write_u32(&mut buf[8..12], self.cr3);
        LittleEndian::write_u32(&mut buf[12..16], self.cr4);
        LittleEndian::write_u32(&mut buf[16..20], self.kernel_dr0);
        LittleEndian::write_u32(&mut buf[20..24], self.kernel_dr1);
        LittleEndian::write_u32(&mut buf[24..28], self.kernel_dr2);
        LittleEndian::write_u32(&mut buf[28..32], self.kernel_dr3);
        LittleEndian::write_u32(&mut buf[32..36], self.kernel_dr6);
        LittleEndian::write_u32(&mut buf[36..40], self.kernel_dr7);
        LittleEndian::write_u16(&mut buf[40..42], self.gdtr.pad);
        LittleEndian::write_u16(&mut buf[42..44], self.gdtr.limit);
        LittleEndian::write_u32(&mut buf[44..48], self.gdtr.base);
        LittleEndian::write_u16(&mut buf[48..50], self.idtr.pad);
        LittleEndian::write_u16(&mut buf[50..52], self.idtr.limit);
        LittleEndian::write_u32(&mut buf[52..56], self.idtr.base);
        LittleEndian::write_u16(&mut buf[56..58], self.tr);
        LittleEndian::write_u16(&mut buf[58..60], self.ldtr);
        for (i, r) in self.reserved.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[60 + i * 4..64 + i * 4], *r);
        }
        buf
    }

    /// Parses a special-registers block; short input is zero-padded.
    pub fn decode(data: &[u8]) -> Self {
        let mut buf = [0u8; KSPECIAL_SIZE];
        let n = data.len().min(KSPECIAL_SIZE);
        buf[..n].copy_from_slice(&data[..n]);

        let mut reserved = [0u32; 6];
        for (i, r) in reserved.iter_mut().enumerate() {
            *r = LittleEndian::read_u32(&buf[60 + i * 4..64 + i * 4]);
        }

        KSpecialRegisters {
            cr0: LittleEndian::read_u32(&buf[0..4]),
            cr2: LittleEndian::read_u32(&buf[4..8]),
            cr3: LittleEndian::read_u32(&buf[8..12]),
            cr4: LittleEndian::read_u32(&buf[12..16]),
            kernel_dr0: LittleEndian::read_u32(&buf[16..20]),
            kernel_dr1: LittleEndian::read_u32(&buf[20..24]),
            kernel_dr2: LittleEndian::read_u32(&buf[24..28]),
            kernel_dr3: LittleEndian::read_u32(&buf[28..32]),
            kernel_dr6: LittleEndian::read_u32(&buf[32..36]),
            kernel_dr7: LittleEndian::read_u32(&buf[36..40]),
            gdtr: DescriptorTable {
                pad: LittleEndian::read_u16(&buf[40..42]),
                limit: LittleEndian::read_u16(&buf[42..44]),
                base: LittleEndian::read_u32(&buf[44..48]),
            },
            idtr: DescriptorTable {
                pad: LittleEndian::read_u16(&buf[48..50]),
                limit: LittleEndian::read_u16(&buf[50..52]),
                base: LittleEndian::read_u32(&buf[52..56]),
            },
            tr: LittleEndian::read_u16(&buf[56..58]),
            ldtr: LittleEndian::read_u16(&buf[58..60]),
            reserved,
        }
    }
}

/// Kernel control addresses discovered by walking from the KPCR.
#[derive(Clone, Copy, Debug, Default)]
pub struct CtrlAddrs {
    pub kpcr: u32,
    pub kprcb: u32,
    pub version: u32,
    pub kernel_base: u32,
}

/// Reads one guest u32, zero on translation failure.
fn read_guest_u32<E: Emulator>(emu: &mut E, cpu: usize, addr: u32) -> u32 {
    let mut buf = [0u8; 4];
    emu.mem_read(cpu, addr, &mut buf);
    u32::from_le_bytes(buf)
}

/// Walks KPCR (segment FS base) -> KPRCB / version block -> kernel base.
pub fn read_ctrl_addrs<E: Emulator>(emu: &mut E, cpu: usize) -> CtrlAddrs {
    let kpcr = emu.segments(cpu).fs.base;
    let kprcb = read_guest_u32(emu, cpu, kpcr.wrapping_add(OFFSET_KPRCB));
    let version = read_guest_u32(emu, cpu, kpcr.wrapping_add(OFFSET_VERSION));
    let kernel_base = read_guest_u32(emu, cpu, version.wrapping_add(OFFSET_KRNL_BASE));
    CtrlAddrs {
        kpcr,
        kprcb,
        version,
        kernel_base,
    }
}

/// Builds the DBGKD_ANY_WAIT_STATE_CHANGE common to both notifications:
/// breakpoint exception on `cpu`, current thread, program counter, and the
/// x86 control report with 16 bytes of instruction stream.
fn build_wait_state_change<E: Emulator>(
    emu: &mut E,
    cpu: usize,
    cpu_count: usize,
    ctrl: &CtrlAddrs,
) -> [u8; STATE_CHANGE_SIZE] {
    let gp = emu.gp_regs(cpu);
    let dr = emu.debug_regs(cpu);
    let segs = emu.segments(cpu);
    let thread = read_guest_u32(emu, cpu, ctrl.kprcb.wrapping_add(OFFSET_KPRCB_CURRTHREAD));

    let mut buf = [0u8; STATE_CHANGE_SIZE];
    LittleEndian::write_u32(&mut buf[0..4], EXCEPTION_STATE_CHANGE);
    LittleEndian::write_u16(&mut buf[4..6], PROCESSOR_LEVEL);
    LittleEndian::write_u16(&mut buf[6..8], cpu as u16);
    LittleEndian::write_u32(&mut buf[8..12], cpu_count as u32);
    LittleEndian::write_u64(&mut buf[16..24], thread as u64);
    LittleEndian::write_u64(&mut buf[24..32], gp.eip as u64);

    // EXCEPTION_RECORD64 + FirstChance. NumberParameters and the
    // ExceptionInformation slots stay zero.
    LittleEndian::write_u32(&mut buf[32..36], STATUS_BREAKPOINT);
    LittleEndian::write_u64(&mut buf[48..56], gp.eip as u64);
    LittleEndian::write_u32(&mut buf[184..188], 1); // FirstChance

    // X86 control report.
    LittleEndian::write_u32(&mut buf[192..196], dr.dr6);
    LittleEndian::write_u32(&mut buf[196..200], dr.dr7);
    emu.mem_read(cpu, gp.eip, &mut buf[204..220]); // InstructionStream
    LittleEndian::write_u16(&mut buf[220..222], segs.cs.selector);
    LittleEndian::write_u16(&mut buf[222..224], segs.ds.selector);
    LittleEndian::write_u16(&mut buf[224..226], segs.es.selector);
    LittleEndian::write_u16(&mut buf[226..228], segs.fs.selector);
    LittleEndian::write_u16(&mut buf[228..230], segs.gs.selector);
    LittleEndian::write_u16(&mut buf[230..232], segs.ss.selector);
    LittleEndian::write_u32(&mut buf[232..236], gp.eflags);

    buf
}

/// Payload of the exception state-change data packet.
pub fn exception_state_change<E: Emulator>(
    emu: &mut E,
    cpu: usize,
    cpu_count: usize,
    ctrl: &CtrlAddrs,
) -> Vec<u8> {
    let mut payload = build_wait_state_change(emu, cpu, cpu_count, ctrl).to_vec();
    // Trailing marker word the debugger expects after the state change.
    payload.extend_from_slice(&1u32.to_le_bytes());
    payload
}

/// Payload of the load-symbols state-change data packet: the state change
/// with the LoadSymbols union member, followed by the ASCII kernel path.
pub fn load_symbols_state_change<E: Emulator>(
    emu: &mut E,
    cpu: usize,
    cpu_count: usize,
    ctrl: &CtrlAddrs,
) -> Vec<u8> {
    let mut sc = build_wait_state_change(emu, cpu, cpu_count, ctrl);
    LittleEndian::write_u32(&mut sc[0..4], LOAD_SYMBOLS_STATE_CHANGE);

    // The union carried exception data; clear it for LoadSymbols. BaseOfDll,
    // ProcessId, CheckSum, SizeOfImage, UnloadSymbols stay zero.
    sc[32..192].fill(0);

    let path = read_kernel_image_path(emu, cpu);
    LittleEndian::write_u32(&mut sc[32..36], path.len() as u32); // PathNameLength

    let mut payload = sc.to_vec();
    payload.extend_from_slice(&path);
    payload
}

/// Reads the kernel image path: up to 128 bytes of wide characters at the
/// fixed guest address, compacted to ASCII and cut at the terminator. The
/// returned buffer includes the NUL when one was found.
fn read_kernel_image_path<E: Emulator>(emu: &mut E, cpu: usize) -> Vec<u8> {
    let mut wide = [0u8; 128];
    emu.mem_read(cpu, NT_KRNL_PNAME_ADDR, &mut wide);

    let mut path: Vec<u8> = wide.iter().step_by(2).copied().collect();
    if let Some(nul) = memchr::memchr(0, &path) {
        path.truncate(nul + 1);
    }
    path
}
