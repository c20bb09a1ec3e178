use std::fmt;

use crate::cpu::CPUConfig;
use crate::instructions::instructions::WordType;

// Uninitialized data memory reads as all ones.
pub const UNINITIALIZED_BYTE: u8 = 0xFF;

const WORD_SIZE: usize = 4;

/// Byte addressable data memory. Words are stored little-endian.
pub(crate) struct MemorySubsystem {
    pub(crate) memory: Vec<u8>,
}

impl MemorySubsystem {
    pub fn new(cpu_config: &CPUConfig) -> MemorySubsystem {
        MemorySubsystem {
            memory: vec![UNINITIALIZED_BYTE; cpu_config.memory_size as usize],
        }
    }

    pub(crate) fn reset(&mut self) {
        self.memory.fill(UNINITIALIZED_BYTE);
    }

    fn word_range(&self, addr: WordType) -> Option<std::ops::Range<usize>> {
        let start = addr as usize;
        let end = start.checked_add(WORD_SIZE)?;
        if end <= self.memory.len() { Some(start..end) } else { None }
    }

    /// Reads a word; `None` when any of its bytes lies outside the memory.
    pub(crate) fn read_word(&self, addr: WordType) -> Option<WordType> {
        let range = self.word_range(addr)?;
        let mut bytes = [0u8; WORD_SIZE];
        bytes.copy_from_slice(&self.memory[range]);
        Some(WordType::from_le_bytes(bytes))
    }

    /// Writes a word; returns false when any of its bytes lies outside the memory.
    pub(crate) fn write_word(&mut self, addr: WordType, value: WordType) -> bool {
        match self.word_range(addr) {
            Some(range) => {
                self.memory[range].copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    pub(crate) fn dump(&self, start: usize, end: usize) -> MemoryDump<'_> {
        let end = end.min(self.memory.len());
        MemoryDump { memory: &self.memory, start: start.min(end), end }
    }
}

/// Hex dump of a memory range, four bytes per line.
pub struct MemoryDump<'a> {
    memory: &'a [u8],
    start: usize,
    end: usize,
}

impl fmt::Display for MemoryDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DATA MEMORY[0x{:08x}:0x{:08x}]", self.start, self.end)?;
        for addr in self.start..self.end {
            if addr % WORD_SIZE == 0 || addr == self.start {
                write!(f, "0x{:08x}:", addr)?;
            }
            write!(f, " {:02x}", self.memory[addr])?;
            if addr % WORD_SIZE == WORD_SIZE - 1 || addr + 1 == self.end {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn new_memory(size: u32) -> MemorySubsystem {
        let mut cpu_config = CPUConfig::default();
        cpu_config.memory_size = size;
        MemorySubsystem::new(&cpu_config)
    }

    #[test]
    fn test_memory_starts_as_all_ones() {
        let memory = new_memory(16);
        assert_eq!(memory.read_word(0), Some(0xFFFF_FFFF));
        assert_eq!(memory.read_word(12), Some(0xFFFF_FFFF));
    }

    #[test]
    fn test_words_are_little_endian() {
        let mut memory = new_memory(16);
        assert!(memory.write_word(4, 0x1122_3344));
        assert_eq!(&memory.memory[4..8], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(memory.read_word(4), Some(0x1122_3344));
        // unaligned access straddles two words
        assert_eq!(memory.read_word(5), Some(0xFF11_2233));
    }

    #[test]
    fn test_out_of_range_access() {
        let mut memory = new_memory(16);
        assert_eq!(memory.read_word(13), None);
        assert_eq!(memory.read_word(u32::MAX), None);
        assert!(!memory.write_word(16, 1));

        memory.write_word(0, 0);
        memory.reset();
        assert_eq!(memory.read_word(0), Some(0xFFFF_FFFF));
    }

    #[test]
    fn test_dump() {
        let mut memory = new_memory(8);
        memory.write_word(0, 0x0403_0201);
        let dump = memory.dump(0, 8).to_string();
        assert_eq!(dump, "DATA MEMORY[0x00000000:0x00000008]\n0x00000000: 01 02 03 04\n0x00000004: ff ff ff ff\n");
    }
}
