use std::fmt;
use std::fmt::Display;
use std::ops::Range;

use crate::instructions::instructions::{CodeAddressType, EOP, Instr, mnemonic, Operand, WordType};

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ROBSlotState {
    UNUSED,
    ISSUE,
    EXECUTE,
    WRITE_RESULT,
    // only stores linger here; they occupy the commit stage while writing memory.
    COMMIT,
    // retired, but the slot can only be reused from the next cycle on.
    COMMITTED,
}

impl ROBSlotState {
    fn name(self) -> &'static str {
        match self {
            ROBSlotState::UNUSED => "-",
            ROBSlotState::ISSUE => "ISSUE",
            ROBSlotState::EXECUTE => "EXE",
            ROBSlotState::WRITE_RESULT => "WR",
            ROBSlotState::COMMIT => "COMMIT",
            ROBSlotState::COMMITTED => "COMMITTED",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Destination {
    Unused,
    Register(Operand),
    // the effective address of a store; None until it executes.
    Memory(Option<WordType>),
}

impl Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Unused | Destination::Memory(None) => write!(f, "-"),
            Destination::Register(reg) => write!(f, "{}", reg),
            Destination::Memory(Some(addr)) => write!(f, "0x{:08x}", addr),
        }
    }
}

/// The cycles in which an instruction entered each pipeline stage.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StageTimes {
    pub issue: Option<u64>,
    pub execute: Option<u64>,
    pub write_result: Option<u64>,
    pub commit: Option<u64>,
}

/// A line of the execution log; appended whenever an instruction retires.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LogEntry {
    pub pc: CodeAddressType,
    pub times: StageTimes,
}

pub struct ExecutionLog<'a>(pub &'a [LogEntry]);

fn write_cycle(f: &mut fmt::Formatter<'_>, cycle: Option<u64>) -> fmt::Result {
    match cycle {
        Some(cycle) => write!(f, "{:>8}", cycle),
        None => write!(f, "{:>8}", "-"),
    }
}

impl Display for ExecutionLog<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "EXECUTION LOG")?;
        writeln!(f, "{:<12}{:>8}{:>8}{:>8}{:>8}", "PC", "Issue", "Exe", "WR", "Commit")?;
        for entry in self.0 {
            write!(f, "0x{:08x}  ", entry.pc)?;
            write_cycle(f, entry.times.issue)?;
            write_cycle(f, entry.times.execute)?;
            write_cycle(f, entry.times.write_result)?;
            write_cycle(f, entry.times.commit)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

pub(crate) struct ROBSlot {
    pub(crate) index: u16,
    pub(crate) instr: Instr,
    pub(crate) pc: CodeAddressType,
    pub(crate) state: ROBSlotState,
    pub(crate) ready: bool,
    pub(crate) destination: Destination,
    pub(crate) value: Option<WordType>,
    pub(crate) rs_index: Option<u16>,
    pub(crate) eu_index: Option<u8>,
    pub(crate) times: StageTimes,
    // cycles a store still needs in the commit stage.
    pub(crate) commit_cycles_remaining: u8,
    // a load that read outside of the data memory; only fatal once it commits.
    pub(crate) fault_addr: Option<WordType>,
}

impl ROBSlot {
    fn new(index: u16) -> Self {
        Self {
            index,
            instr: EOP,
            pc: 0,
            state: ROBSlotState::UNUSED,
            ready: false,
            destination: Destination::Unused,
            value: None,
            rs_index: None,
            eu_index: None,
            times: StageTimes::default(),
            commit_cycles_remaining: 0,
            fault_addr: None,
        }
    }

    fn reset(&mut self) {
        *self = ROBSlot::new(self.index);
    }
}

/// The reorder buffer. A ring of slots addressed by ever increasing sequence numbers;
/// the slot index of a sequence number is `seq % capacity`.
///
/// `head..seq_committed` holds retired slots that are released at the start of the next cycle,
/// `seq_committed..tail` the instructions in flight.
pub(crate) struct ROB {
    pub(crate) capacity: u16,
    // everything before this point is released.
    head: u64,
    pub(crate) seq_committed: u64,
    tail: u64,
    slots: Vec<ROBSlot>,
}

impl ROB {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        for k in 0..capacity {
            slots.push(ROBSlot::new(k));
        }

        Self {
            capacity,
            head: 0,
            seq_committed: 0,
            tail: 0,
            slots,
        }
    }

    pub(crate) fn to_index(&self, seq: u64) -> u16 {
        (seq % self.capacity as u64) as u16
    }

    pub(crate) fn get(&self, slot_index: u16) -> &ROBSlot {
        &self.slots[slot_index as usize]
    }

    pub(crate) fn get_mut(&mut self, slot_index: u16) -> &mut ROBSlot {
        &mut self.slots[slot_index as usize]
    }

    pub(crate) fn allocate(&mut self) -> u16 {
        assert!(self.has_space(), "ROB: Can't allocate if no space.");

        let index = self.to_index(self.tail);
        debug_assert_eq!(self.slots[index as usize].state, ROBSlotState::UNUSED);
        self.tail += 1;
        index
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn has_space(&self) -> bool {
        self.capacity > self.size()
    }

    /// Sequence numbers of the instructions in flight, oldest first.
    pub(crate) fn in_flight(&self) -> Range<u64> {
        self.seq_committed..self.tail
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.seq_committed < self.tail
    }

    pub(crate) fn head_index(&self) -> u16 {
        assert!(self.has_in_flight(), "ROB: there is no head to commit");
        self.to_index(self.seq_committed)
    }

    pub(crate) fn commit_head(&mut self) -> u16 {
        let index = self.head_index();
        self.slots[index as usize].state = ROBSlotState::COMMITTED;
        self.seq_committed += 1;
        index
    }

    /// Frees the slots committed during the previous cycle and returns their indexes.
    pub(crate) fn release_committed(&mut self) -> Vec<u16> {
        let mut released = Vec::new();
        for seq in self.head..self.seq_committed {
            let index = self.to_index(seq);
            let slot = &mut self.slots[index as usize];
            debug_assert_eq!(slot.state, ROBSlotState::COMMITTED);
            slot.reset();
            released.push(index);
        }
        self.head = self.seq_committed;
        released
    }

    /// Discards every instruction in flight and returns how many were squashed.
    pub(crate) fn flush_in_flight(&mut self) -> u64 {
        let squashed = self.tail - self.seq_committed;
        for seq in self.in_flight() {
            let index = self.to_index(seq);
            self.slots[index as usize].reset();
        }
        self.tail = self.seq_committed;
        squashed
    }

    pub(crate) fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
        }
        self.head = 0;
        self.seq_committed = 0;
        self.tail = 0;
    }
}

impl Display for ROB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "REORDER BUFFER")?;
        writeln!(f, "{:<6}{:<6}{:<7}{:<12}{:<11}{:<12}{}", "Entry", "Busy", "Ready", "PC", "State", "Dest", "Value")?;
        for slot in &self.slots {
            let busy = if slot.state == ROBSlotState::UNUSED { "no" } else { "yes" };
            let ready = if slot.ready { "yes" } else { "no" };
            write!(f, "{:<6}{:<6}{:<7}", slot.index, busy, ready)?;
            if slot.state == ROBSlotState::UNUSED {
                writeln!(f, "{:<12}{:<11}{:<12}-", "-", "-", "-")?;
                continue;
            }

            let pc = format!("0x{:08x}", slot.pc);
            write!(f, "{:<12}{:<11}{:<12}", pc, slot.state.name(), slot.destination.to_string())?;
            match slot.value {
                Some(value) => writeln!(f, "0x{:08x} ({})", value, mnemonic(slot.instr.opcode))?,
                None => writeln!(f, "- ({})", mnemonic(slot.instr.opcode))?,
            }
        }
        Ok(())
    }
}
