use crate::instructions::instructions::{NUM_GP_REGISTERS, Operand};

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct RegStatusEntry {
    pub(crate) rob_slot_index: u16,
    // True if a not yet committed instruction is going to write this register.
    pub(crate) busy: bool,
}

/// The register status table. For every architectural register it records the ROB entry
/// that will produce its next value. As long as such an entry exists, readers have to wait
/// on (or copy from) that ROB entry instead of reading the register file.
pub(crate) struct RegisterStatusTable {
    int_table: Vec<RegStatusEntry>,
    fp_table: Vec<RegStatusEntry>,
}

impl RegisterStatusTable {
    pub(crate) fn new() -> Self {
        let idle = RegStatusEntry { rob_slot_index: 0, busy: false };
        Self {
            int_table: vec![idle; NUM_GP_REGISTERS as usize],
            fp_table: vec![idle; NUM_GP_REGISTERS as usize],
        }
    }

    fn entry(&self, reg: Operand) -> &RegStatusEntry {
        match reg {
            Operand::IntReg(index) => &self.int_table[index as usize],
            Operand::FpReg(index) => &self.fp_table[index as usize],
            _ => panic!("Operand is not a register but of type {:?}", reg),
        }
    }

    fn entry_mut(&mut self, reg: Operand) -> &mut RegStatusEntry {
        match reg {
            Operand::IntReg(index) => &mut self.int_table[index as usize],
            Operand::FpReg(index) => &mut self.fp_table[index as usize],
            _ => panic!("Operand is not a register but of type {:?}", reg),
        }
    }

    /// The ROB entry that will write `reg`, or `None` when the register file is up to date.
    pub(crate) fn get(&self, reg: Operand) -> Option<u16> {
        let entry = self.entry(reg);
        if entry.busy { Some(entry.rob_slot_index) } else { None }
    }

    pub(crate) fn set_pending(&mut self, reg: Operand, rob_slot_index: u16) {
        let entry = self.entry_mut(reg);
        entry.rob_slot_index = rob_slot_index;
        entry.busy = true;
    }

    /// Clears the busy flag, but only when no younger instruction has renamed `reg` since.
    pub(crate) fn clear_if_pending(&mut self, reg: Operand, rob_slot_index: u16) -> bool {
        let entry = self.entry_mut(reg);
        if entry.busy && entry.rob_slot_index == rob_slot_index {
            entry.busy = false;
            true
        } else {
            false
        }
    }

    pub(crate) fn flush(&mut self) {
        for entry in self.int_table.iter_mut().chain(self.fp_table.iter_mut()) {
            entry.busy = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::instructions::Operand::{FpReg, IntReg};

    #[test]
    fn test_int_and_fp_tables_are_separate() {
        let mut table = RegisterStatusTable::new();
        table.set_pending(IntReg(3), 5);

        assert_eq!(table.get(IntReg(3)), Some(5));
        assert_eq!(table.get(FpReg(3)), None);
    }

    #[test]
    fn test_clear_only_when_tag_matches() {
        let mut table = RegisterStatusTable::new();
        table.set_pending(IntReg(1), 0);
        // a younger instruction renames the same register
        table.set_pending(IntReg(1), 2);

        assert!(!table.clear_if_pending(IntReg(1), 0));
        assert_eq!(table.get(IntReg(1)), Some(2));
        assert!(table.clear_if_pending(IntReg(1), 2));
        assert_eq!(table.get(IntReg(1)), None);
    }

    #[test]
    fn test_flush() {
        let mut table = RegisterStatusTable::new();
        table.set_pending(IntReg(1), 0);
        table.set_pending(FpReg(31), 1);
        table.flush();

        assert_eq!(table.get(IntReg(1)), None);
        assert_eq!(table.get(FpReg(31)), None);
    }
}
