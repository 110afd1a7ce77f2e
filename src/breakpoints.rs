//! Fixed-capacity handle table for the debugger's software breakpoints.
//!
//! Handles given out to the debugger are 1-based slot indices; 0 is the
//! reserved "invalid" handle. The table only does the bookkeeping; the
//! dispatcher performs the actual emulator breakpoint calls.

/// Capacity of the software-breakpoint table.
pub const KD_BREAKPOINT_MAX: usize = 32;

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    addr: u32,
    occupied: bool,
}

pub struct BreakpointTable {
    slots: [Slot; KD_BREAKPOINT_MAX],
}

impl BreakpointTable {
    pub fn new() -> Self {
        BreakpointTable {
            slots: [Slot::default(); KD_BREAKPOINT_MAX],
        }
    }

    /// Claims the first free slot for `addr` and returns its handle, or 0
    /// if the table is full.
    pub fn alloc(&mut self, addr: u32) -> u32 {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.occupied {
                *slot = Slot { addr, occupied: true };
                return (i + 1) as u32;
            }
        }
        0
    }

    /// Releases `handle` and returns the address it guarded, or None if
    /// the handle is invalid or the slot is already free.
    pub fn release(&mut self, handle: u32) -> Option<u32> {
        let slot = self.slot_mut(handle)?;
        if !slot.occupied {
            return None;
        }
        let addr = slot.addr;
        *slot = Slot::default();
        Some(addr)
    }

    fn slot_mut(&mut self, handle: u32) -> Option<&mut Slot> {
        let index = (handle as usize).checked_sub(1)?;
        self.slots.get_mut(index)
    }
}

impl Default for BreakpointTable {
    fn default() -> Self {
        BreakpointTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_one_based_and_sequential_from_empty() {
        let mut table = BreakpointTable::new();
        assert_eq!(table.alloc(0x1000), 1);
        assert_eq!(table.alloc(0x2000), 2);
        assert_eq!(table.release(1), Some(0x1000));
        assert_eq!(table.release(2), Some(0x2000));
    }

    #[test]
    fn double_release_fails() {
        let mut table = BreakpointTable::new();
        let handle = table.alloc(0x1000);
        assert_eq!(table.release(handle), Some(0x1000));
        assert_eq!(table.release(handle), None);
    }

    #[test]
    fn invalid_handles_are_rejected() {
        let mut table = BreakpointTable::new();
        assert_eq!(table.release(0), None);
        assert_eq!(table.release(KD_BREAKPOINT_MAX as u32 + 1), None);
    }

    #[test]
    fn full_table_returns_the_invalid_handle() {
        let mut table = BreakpointTable::new();
        for i in 0..KD_BREAKPOINT_MAX {
            assert_ne!(table.alloc(i as u32 * 4), 0);
        }
        assert_eq!(table.alloc(0xffff_0000), 0);

        // Releasing one slot makes allocation possible again.
        assert_eq!(table.release(5), Some(4 * 4));
        assert_eq!(table.alloc(0xffff_0000), 5);
    }

    #[test]
    fn live_handles_are_distinct_and_in_range() {
        let mut table = BreakpointTable::new();
        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(table.alloc(0x8000_0000 + i));
        }
        let mut deduped = handles.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), handles.len());
        assert!(handles.iter().all(|&h| (1..=KD_BREAKPOINT_MAX as u32).contains(&h)));
    }

    #[test]
    fn breakpoint_at_address_zero_is_representable() {
        let mut table = BreakpointTable::new();
        let handle = table.alloc(0);
        assert_eq!(handle, 1);
        assert_eq!(table.release(handle), Some(0));
    }
}
