//! x86 debug-register decoding and the hardware-breakpoint reconciler.
//!
//! The debugger programs DR0–DR3/DR7 through `SetContext`; the stub mirrors
//! that image into the emulator's watchpoint table. [`DrShadow`] remembers
//! the last image and plans the minimal remove/insert sequence for a new
//! one.

use bitflags::bitflags;

/// Bit position of the R/W field for slot 0 in DR7.
pub const DR7_TYPE_SHIFT: u32 = 16;
/// Bit position of the LEN field for slot 0 in DR7.
pub const DR7_LEN_SHIFT: u32 = 18;

bitflags! {
    /// Access flags attached to breakpoints and watchpoints handed to the
    /// emulator. `STUB` is the owner tag that keeps this stub's entries
    /// apart from any other debugger frontend cohabiting the emulator.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WatchFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const ACCESS = 0x03;
        const STUB = 0x10;
    }
}

/// The R/W field of one DR7 slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrAccess {
    Execute,
    Write,
    Io,
    ReadWrite,
}

/// Whether slot `index` is enabled, locally or globally.
pub fn is_enabled(dr7: u32, index: usize) -> bool {
    (dr7 >> (index * 2)) & 3 != 0
}

/// The access type of slot `index`.
pub fn access(dr7: u32, index: usize) -> DrAccess {
    match (dr7 >> (DR7_TYPE_SHIFT as usize + index * 4)) & 3 {
        0 => DrAccess::Execute,
        1 => DrAccess::Write,
        2 => DrAccess::Io,
        _ => DrAccess::ReadWrite,
    }
}

/// The length in bytes watched by slot `index`.
pub fn length(dr7: u32, index: usize) -> u8 {
    match (dr7 >> (DR7_LEN_SHIFT as usize + index * 4)) & 3 {
        0 => 1,
        1 => 2,
        2 => 8,
        _ => 4,
    }
}

/// Watchpoint access flags for a slot type, without the owner tag.
/// Execute- and IO-typed slots do not map to data watchpoints.
pub fn watch_flags(access: DrAccess) -> Option<WatchFlags> {
    match access {
        DrAccess::Write => Some(WatchFlags::WRITE),
        DrAccess::ReadWrite => Some(WatchFlags::ACCESS),
        DrAccess::Execute | DrAccess::Io => None,
    }
}

/// A debugger-written debug-register image: DR0–DR3 plus DR7.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrImage {
    pub dr: [u32; 4],
    pub dr7: u32,
}

/// One watchpoint action the emulator must perform. Removals for a slot
/// are always planned before the replacement insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrOp {
    Remove { addr: u32, len: u8, flags: WatchFlags },
    Insert { slot: usize, addr: u32, len: u8, flags: WatchFlags },
}

#[derive(Clone, Copy, Debug, Default)]
struct DrSlot {
    addr: u32,
    installed: bool,
}

/// Mirror of the last debugger-written debug-register image, tracking
/// which DR slots currently have a watchpoint installed in the emulator.
#[derive(Clone, Copy, Debug, Default)]
pub struct DrShadow {
    slots: [DrSlot; 4],
    dr7: u32,
}

impl DrShadow {
    pub fn new() -> Self {
        DrShadow::default()
    }

    /// The shadowed DR7 value.
    pub fn dr7(&self) -> u32 {
        self.dr7
    }

    /// True if any slot has an installed watchpoint.
    pub fn any_installed(&self) -> bool {
        self.slots.iter().any(|s| s.installed)
    }

    /// Shadowed address of slot `index`, if a watchpoint is installed.
    pub fn slot_addr(&self, index: usize) -> Option<u32> {
        let slot = &self.slots[index];
        slot.installed.then_some(slot.addr)
    }

    /// Kernel debug register for reports: the shadowed value when a
    /// watchpoint is installed for the slot, otherwise the live one.
    pub fn kernel_dr(&self, index: usize, live: u32) -> u32 {
        self.slot_addr(index).unwrap_or(live)
    }

    /// Kernel DR7 for reports, by the same rule.
    pub fn kernel_dr7(&self, live: u32) -> u32 {
        if self.any_installed() {
            self.dr7
        } else {
            live
        }
    }

    /// Marks a slot as not installed after the emulator rejected its
    /// insert (e.g. an unrepresentable length). The old watchpoint was
    /// already removed by then.
    pub fn invalidate(&mut self, slot: usize) {
        self.slots[slot].installed = false;
    }

    /// Diffs `image` against the shadow and returns the watchpoint
    /// operations that bring the emulator in sync. The shadow is updated
    /// assuming every returned insert succeeds; the caller reports
    /// failures back through [`DrShadow::invalidate`].
    ///
    /// Feeding the same image twice plans nothing the second time.
    pub fn sync(&mut self, image: &DrImage) -> Vec<DrOp> {
        let mut ops = Vec::new();
        for i in 0..4 {
            let old = self.installed_watch(i);
            let new = Self::wanted_watch(image, i);
            if old == new {
                continue;
            }
            if let Some((addr, len, flags)) = old {
                ops.push(DrOp::Remove { addr, len, flags });
                self.slots[i].installed = false;
            }
            if let Some((addr, len, flags)) = new {
                ops.push(DrOp::Insert { slot: i, addr, len, flags });
                self.slots[i] = DrSlot { addr, installed: true };
            }
        }
        self.dr7 = image.dr7;
        ops
    }

    /// The watchpoint currently installed for slot `i`, per the shadow.
    fn installed_watch(&self, i: usize) -> Option<(u32, u8, WatchFlags)> {
        if !self.slots[i].installed {
            return None;
        }
        let flags = watch_flags(access(self.dr7, i)).unwrap_or(WatchFlags::ACCESS);
        Some((self.slots[i].addr, length(self.dr7, i), flags | WatchFlags::STUB))
    }

    /// The watchpoint `image` asks for in slot `i`, if any.
    fn wanted_watch(image: &DrImage, i: usize) -> Option<(u32, u8, WatchFlags)> {
        if !is_enabled(image.dr7, i) {
            return None;
        }
        let flags = watch_flags(access(image.dr7, i))?;
        Some((image.dr[i], length(image.dr7, i), flags | WatchFlags::STUB))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// DR7 with slot `i` locally enabled, plus the given type/len fields.
    fn dr7_slot(i: usize, ty: u32, len: u32) -> u32 {
        (1u32 << (i * 2))
            | (ty << (DR7_TYPE_SHIFT as usize + i * 4))
            | (len << (DR7_LEN_SHIFT as usize + i * 4))
    }

    #[test]
    fn decode_enable_bits() {
        assert!(is_enabled(0x1, 0)); // local
        assert!(is_enabled(0x2, 0)); // global
        assert!(!is_enabled(0x1, 1));
        assert!(is_enabled(0x40, 3));
        assert!(!is_enabled(0x400, 1)); // reserved bit 10 enables nothing
    }

    #[test]
    fn decode_type_field() {
        assert_eq!(access(dr7_slot(0, 0, 0), 0), DrAccess::Execute);
        assert_eq!(access(dr7_slot(0, 1, 0), 0), DrAccess::Write);
        assert_eq!(access(dr7_slot(0, 2, 0), 0), DrAccess::Io);
        assert_eq!(access(dr7_slot(0, 3, 0), 0), DrAccess::ReadWrite);
        assert_eq!(access(dr7_slot(2, 1, 0), 2), DrAccess::Write);
    }

    #[test]
    fn decode_len_field() {
        assert_eq!(length(dr7_slot(0, 1, 0), 0), 1);
        assert_eq!(length(dr7_slot(0, 1, 1), 0), 2);
        assert_eq!(length(dr7_slot(0, 1, 2), 0), 8);
        assert_eq!(length(dr7_slot(0, 1, 3), 0), 4);
        assert_eq!(length(dr7_slot(3, 1, 2), 3), 8);
    }

    #[test]
    fn flags_for_types() {
        assert_eq!(watch_flags(DrAccess::Write), Some(WatchFlags::WRITE));
        assert_eq!(watch_flags(DrAccess::ReadWrite), Some(WatchFlags::ACCESS));
        assert_eq!(watch_flags(DrAccess::Execute), None);
        assert_eq!(watch_flags(DrAccess::Io), None);
    }

    #[test]
    fn installs_a_write_watchpoint() {
        let mut shadow = DrShadow::new();
        let image = DrImage {
            dr: [0x4141_4140, 0, 0, 0],
            // Local-enable slot 0, type write, len 1, reserved bit 10 set
            // the way Windows writes DR7.
            dr7: 0x400 | dr7_slot(0, 1, 0),
        };
        let ops = shadow.sync(&image);
        assert_eq!(
            ops,
            vec![DrOp::Insert {
                slot: 0,
                addr: 0x4141_4140,
                len: 1,
                flags: WatchFlags::WRITE | WatchFlags::STUB,
            }]
        );
        assert!(shadow.any_installed());
        assert_eq!(shadow.slot_addr(0), Some(0x4141_4140));
        assert_eq!(shadow.dr7(), image.dr7);
    }

    #[test]
    fn identical_image_plans_nothing() {
        let mut shadow = DrShadow::new();
        let image = DrImage {
            dr: [0x1000, 0x2000, 0, 0],
            dr7: dr7_slot(0, 1, 0) | dr7_slot(1, 3, 3),
        };
        assert_eq!(shadow.sync(&image).len(), 2);
        assert_eq!(shadow.sync(&image), vec![]);
    }

    #[test]
    fn disabling_a_slot_removes_its_watchpoint() {
        let mut shadow = DrShadow::new();
        let image = DrImage {
            dr: [0x1000, 0, 0, 0],
            dr7: dr7_slot(0, 1, 1),
        };
        shadow.sync(&image);
        let ops = shadow.sync(&DrImage { dr: [0x1000, 0, 0, 0], dr7: 0 });
        assert_eq!(
            ops,
            vec![DrOp::Remove {
                addr: 0x1000,
                len: 2,
                flags: WatchFlags::WRITE | WatchFlags::STUB,
            }]
        );
        assert!(!shadow.any_installed());
    }

    #[test]
    fn retargeting_removes_before_inserting() {
        let mut shadow = DrShadow::new();
        shadow.sync(&DrImage { dr: [0x1000, 0, 0, 0], dr7: dr7_slot(0, 1, 0) });
        let ops = shadow.sync(&DrImage { dr: [0x2000, 0, 0, 0], dr7: dr7_slot(0, 1, 0) });
        assert_eq!(
            ops,
            vec![
                DrOp::Remove {
                    addr: 0x1000,
                    len: 1,
                    flags: WatchFlags::WRITE | WatchFlags::STUB,
                },
                DrOp::Insert {
                    slot: 0,
                    addr: 0x2000,
                    len: 1,
                    flags: WatchFlags::WRITE | WatchFlags::STUB,
                },
            ]
        );
    }

    #[test]
    fn length_change_retargets_with_old_length_removed() {
        let mut shadow = DrShadow::new();
        shadow.sync(&DrImage { dr: [0x1000, 0, 0, 0], dr7: dr7_slot(0, 3, 3) });
        let ops = shadow.sync(&DrImage { dr: [0x1000, 0, 0, 0], dr7: dr7_slot(0, 3, 0) });
        assert_eq!(
            ops,
            vec![
                DrOp::Remove {
                    addr: 0x1000,
                    len: 4,
                    flags: WatchFlags::ACCESS | WatchFlags::STUB,
                },
                DrOp::Insert {
                    slot: 0,
                    addr: 0x1000,
                    len: 1,
                    flags: WatchFlags::ACCESS | WatchFlags::STUB,
                },
            ]
        );
    }

    #[test]
    fn execute_slots_are_not_installed() {
        let mut shadow = DrShadow::new();
        // Enabled but execute-typed: decoded, never installed.
        let ops = shadow.sync(&DrImage { dr: [0x1000, 0, 0, 0], dr7: 0x401 });
        assert_eq!(ops, vec![]);
        assert!(!shadow.any_installed());
        assert_eq!(shadow.dr7(), 0x401);
    }

    #[test]
    fn switching_to_execute_removes_the_old_watchpoint() {
        let mut shadow = DrShadow::new();
        shadow.sync(&DrImage { dr: [0x1000, 0, 0, 0], dr7: dr7_slot(0, 1, 0) });
        let ops = shadow.sync(&DrImage { dr: [0x1000, 0, 0, 0], dr7: dr7_slot(0, 0, 0) });
        assert_eq!(
            ops,
            vec![DrOp::Remove {
                addr: 0x1000,
                len: 1,
                flags: WatchFlags::WRITE | WatchFlags::STUB,
            }]
        );
        assert!(!shadow.any_installed());
    }

    #[test]
    fn invalidate_clears_installed_state() {
        let mut shadow = DrShadow::new();
        shadow.sync(&DrImage { dr: [0x1000, 0, 0, 0], dr7: dr7_slot(0, 1, 2) });
        assert!(shadow.any_installed());
        shadow.invalidate(0);
        assert!(!shadow.any_installed());
        assert_eq!(shadow.slot_addr(0), None);
        // Kernel-DR reporting falls back to the live value.
        assert_eq!(shadow.kernel_dr(0, 0xdead), 0xdead);
    }

    #[test]
    fn final_state_matches_the_last_image() {
        // Whatever the history, the installed set equals the decode of the
        // final image.
        let mut shadow = DrShadow::new();
        let images = [
            DrImage { dr: [0x10, 0x20, 0x30, 0x40], dr7: dr7_slot(0, 1, 0) | dr7_slot(2, 3, 3) },
            DrImage { dr: [0x10, 0x20, 0x30, 0x40], dr7: dr7_slot(1, 1, 1) },
            DrImage { dr: [0x11, 0x21, 0x31, 0x41], dr7: dr7_slot(1, 1, 1) | dr7_slot(3, 3, 2) },
        ];
        let mut installed: Vec<(u32, u8, WatchFlags)> = Vec::new();
        for image in &images {
            for op in shadow.sync(image) {
                match op {
                    DrOp::Remove { addr, len, flags } => {
                        let pos = installed
                            .iter()
                            .position(|&w| w == (addr, len, flags))
                            .expect("removal of something not installed");
                        installed.remove(pos);
                    }
                    DrOp::Insert { addr, len, flags, .. } => installed.push((addr, len, flags)),
                }
            }
        }
        installed.sort_by_key(|w| w.0);
        assert_eq!(
            installed,
            vec![
                (0x21, 2, WatchFlags::WRITE | WatchFlags::STUB),
                (0x41, 8, WatchFlags::ACCESS | WatchFlags::STUB),
            ]
        );
    }
}
