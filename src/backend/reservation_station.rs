use std::fmt;
use std::fmt::Display;

use crate::cpu::CPUConfig;
use crate::instructions::instructions::{CodeAddressType, MAX_SOURCE_COUNT, Opcode, RSType, WordType};

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RSState {
    IDLE,
    BUSY,
    // the result has been written; the station is released at the start of the next cycle.
    COMPLETED,
}

/// A source operand of a reservation station: either the value itself, or the
/// ROB entry that is going to produce it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RSOperand {
    Waiting(u16),
    Ready(WordType),
}

impl RSOperand {
    pub(crate) fn value(self) -> Option<WordType> {
        match self {
            RSOperand::Ready(value) => Some(value),
            RSOperand::Waiting(_) => None,
        }
    }
}

// A single reservation station
#[derive(Clone, Copy, Debug)]
pub(crate) struct RS {
    pub(crate) index: u16,
    pub(crate) rs_type: RSType,
    // position within its bank.
    pub(crate) name: u16,
    pub(crate) state: RSState,
    pub(crate) rob_slot_index: Option<u16>,
    pub(crate) opcode: Opcode,
    pub(crate) pc: CodeAddressType,
    pub(crate) source: [RSOperand; MAX_SOURCE_COUNT],
    pub(crate) immediate: i32,
    pub(crate) address: Option<WordType>,
}

impl RS {
    fn new(index: u16, rs_type: RSType, name: u16) -> Self {
        Self {
            index,
            rs_type,
            name,
            state: RSState::IDLE,
            rob_slot_index: None,
            opcode: Opcode::EOP,
            pc: 0,
            source: [RSOperand::Ready(0), RSOperand::Ready(0)],
            immediate: 0,
            address: None,
        }
    }

    fn reset(&mut self) {
        *self = RS::new(self.index, self.rs_type, self.name);
    }

    fn is_free(&self) -> bool {
        self.state == RSState::IDLE
    }
}

fn bank_name(rs_type: RSType) -> &'static str {
    match rs_type {
        RSType::INTEGER => "Int",
        RSType::ADD => "Add",
        RSType::MULT => "Mult",
        RSType::LOAD => "Load",
    }
}

/// All reservation station banks in a single array; a station is addressed by its index.
pub(crate) struct RSTable {
    array: Vec<RS>,
}

impl RSTable {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Self {
        let banks = [
            (RSType::INTEGER, cpu_config.int_rs_count),
            (RSType::ADD, cpu_config.add_rs_count),
            (RSType::MULT, cpu_config.mult_rs_count),
            (RSType::LOAD, cpu_config.load_buffer_count),
        ];

        let mut array = Vec::new();
        for (rs_type, count) in banks {
            for name in 0..count {
                array.push(RS::new(array.len() as u16, rs_type, name));
            }
        }

        RSTable { array }
    }

    pub(crate) fn get(&self, rs_index: u16) -> &RS {
        &self.array[rs_index as usize]
    }

    pub(crate) fn get_mut(&mut self, rs_index: u16) -> &mut RS {
        &mut self.array[rs_index as usize]
    }

    /// Claims the lowest numbered idle station of the given bank.
    pub(crate) fn allocate(&mut self, rs_type: RSType) -> Option<u16> {
        let rs = self.array.iter_mut().find(|rs| rs.rs_type == rs_type && rs.is_free())?;
        rs.state = RSState::BUSY;
        Some(rs.index)
    }

    pub(crate) fn complete(&mut self, rs_index: u16) {
        let rs = &mut self.array[rs_index as usize];
        debug_assert_eq!(rs.state, RSState::BUSY);
        rs.state = RSState::COMPLETED;
    }

    pub(crate) fn release_completed(&mut self) {
        for rs in &mut self.array {
            if rs.state == RSState::COMPLETED {
                rs.reset();
            }
        }
    }

    /// Hands a value broadcast on the CDB to every station waiting for that ROB entry.
    pub(crate) fn wakeup(&mut self, rob_slot_index: u16, value: WordType) {
        for rs in &mut self.array {
            if rs.state != RSState::BUSY {
                continue;
            }

            for operand in &mut rs.source {
                if *operand == RSOperand::Waiting(rob_slot_index) {
                    *operand = RSOperand::Ready(value);
                }
            }
        }
    }

    pub(crate) fn has_waiting_on(&self, rob_slot_index: u16) -> bool {
        self.array.iter().any(|rs| {
            rs.state == RSState::BUSY && rs.source.contains(&RSOperand::Waiting(rob_slot_index))
        })
    }

    pub(crate) fn flush(&mut self) {
        for rs in &mut self.array {
            rs.reset();
        }
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: Option<WordType>) -> fmt::Result {
    match value {
        Some(value) => write!(f, "  0x{:08x}", value),
        None => write!(f, "{:>12}", "-"),
    }
}

fn write_tag(f: &mut fmt::Formatter<'_>, operand: RSOperand) -> fmt::Result {
    match operand {
        RSOperand::Waiting(rob_slot_index) => write!(f, "{:>6}", rob_slot_index),
        RSOperand::Ready(_) => write!(f, "{:>6}", "-"),
    }
}

impl Display for RSTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RESERVATION STATIONS")?;
        writeln!(f, "{:>7}{:>6}{:>12}{:>12}{:>12}{:>6}{:>6}{:>6}{:>12}",
                 "Name", "Busy", "PC", "Vj", "Vk", "Qj", "Qk", "Dest", "Address")?;
        for rs in &self.array {
            let name = format!("{}{}", bank_name(rs.rs_type), rs.name + 1);
            write!(f, "{:>7}", name)?;
            if rs.is_free() {
                writeln!(f, "{:>6}{:>12}{:>12}{:>12}{:>6}{:>6}{:>6}{:>12}", "no", "-", "-", "-", "-", "-", "-", "-")?;
                continue;
            }

            write!(f, "{:>6}", "yes")?;
            write_value(f, Some(rs.pc))?;
            write_value(f, rs.source[0].value())?;
            write_value(f, rs.source[1].value())?;
            write_tag(f, rs.source[0])?;
            write_tag(f, rs.source[1])?;
            match rs.rob_slot_index {
                Some(rob_slot_index) => write!(f, "{:>6}", rob_slot_index)?,
                None => write!(f, "{:>6}", "-")?,
            }
            write_value(f, rs.address)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
