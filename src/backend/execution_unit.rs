use crate::cpu::{ConfigError, CPUConfig};
use crate::instructions::instructions::{CodeAddressType, EUType, INSTR_SIZE, Opcode, WordType};

// The value a division by zero produces.
pub(crate) const DIV_BY_ZERO_RESULT: WordType = 0xFFFF_FFFF;

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EUState {
    IDLE,
    EXECUTING,
    // the result has been written; the unit is released at the start of the next cycle.
    COMPLETED,
}

/// A single execution unit.
pub(crate) struct EU {
    pub(crate) index: u8,
    pub(crate) eu_type: EUType,
    pub(crate) latency: u8,
    pub(crate) rob_slot_index: Option<u16>,
    pub(crate) cycles_remaining: u8,
    // staged until the write-result stage; stores don't produce one.
    pub(crate) result: Option<WordType>,
    pub(crate) state: EUState,
}

impl EU {
    fn reset(&mut self) {
        self.rob_slot_index = None;
        self.cycles_remaining = 0;
        self.result = None;
        self.state = EUState::IDLE;
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == EUState::EXECUTING && self.cycles_remaining == 0
    }
}

/// The table containing all execution units of the CPU.
pub(crate) struct EUTable {
    array: Vec<EU>,
}

impl EUTable {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Result<EUTable, ConfigError> {
        let mut array = Vec::new();
        for eu_config in &cpu_config.execution_units {
            if eu_config.latency == 0 {
                return Err(ConfigError::Invalid(format!("latency of {:?} must be larger than 0", eu_config.eu_type)));
            }

            for _ in 0..eu_config.instances {
                array.push(EU {
                    index: array.len() as u8,
                    eu_type: eu_config.eu_type,
                    latency: eu_config.latency,
                    rob_slot_index: None,
                    cycles_remaining: 0,
                    result: None,
                    state: EUState::IDLE,
                });
            }
        }

        if array.is_empty() {
            return Err(ConfigError::NoExecutionUnits);
        }

        Ok(EUTable { array })
    }

    pub(crate) fn get(&self, eu_index: u8) -> &EU {
        &self.array[eu_index as usize]
    }

    pub(crate) fn latency(&self, eu_type: EUType) -> Option<u8> {
        self.array.iter().find(|eu| eu.eu_type == eu_type).map(|eu| eu.latency)
    }

    pub(crate) fn supports(&self, opcode: Opcode) -> Result<(), ConfigError> {
        match opcode.eu_type() {
            None => Ok(()),
            Some(eu_type) if self.latency(eu_type).is_some() => Ok(()),
            Some(eu_type) => Err(ConfigError::MissingExecutionUnit { opcode, eu_type }),
        }
    }

    /// Returns the first idle unit able to execute `opcode`, or `None` when all of them are busy.
    pub(crate) fn acquire(&self, opcode: Opcode) -> Result<Option<u8>, ConfigError> {
        if self.array.is_empty() {
            return Err(ConfigError::NoExecutionUnits);
        }

        let eu_type = match opcode.eu_type() {
            Some(eu_type) => eu_type,
            None => return Ok(None),
        };

        self.supports(opcode)?;

        Ok(self.array.iter()
            .find(|eu| eu.eu_type == eu_type && eu.state == EUState::IDLE)
            .map(|eu| eu.index))
    }

    /// Occupies the unit for `cycles` cycles; the cycle of the call counts as the first one.
    pub(crate) fn start(&mut self, eu_index: u8, rob_slot_index: u16, cycles: u8, result: Option<WordType>) {
        let eu = &mut self.array[eu_index as usize];
        debug_assert_eq!(eu.state, EUState::IDLE);
        debug_assert!(cycles > 0);

        eu.state = EUState::EXECUTING;
        eu.rob_slot_index = Some(rob_slot_index);
        eu.cycles_remaining = cycles - 1;
        eu.result = result;
    }

    /// Advances every executing unit by one cycle.
    pub(crate) fn tick(&mut self) {
        for eu in &mut self.array {
            if eu.state == EUState::EXECUTING {
                eu.cycles_remaining = eu.cycles_remaining.saturating_sub(1);
            }
        }
    }

    pub(crate) fn complete(&mut self, eu_index: u8) {
        let eu = &mut self.array[eu_index as usize];
        debug_assert!(eu.is_done());
        eu.state = EUState::COMPLETED;
    }

    pub(crate) fn release_completed(&mut self) {
        for eu in &mut self.array {
            if eu.state == EUState::COMPLETED {
                eu.reset();
            }
        }
    }

    pub(crate) fn flush(&mut self) {
        for eu in &mut self.array {
            eu.reset();
        }
    }
}

fn int_op(v1: WordType, v2: WordType, op: fn(i32, i32) -> i32) -> WordType {
    op(v1 as i32, v2 as i32) as WordType
}

fn fp_op(v1: WordType, v2: WordType, op: fn(f32, f32) -> f32) -> WordType {
    op(f32::from_bits(v1), f32::from_bits(v2)).to_bits()
}

fn branch(taken: bool, immediate: i32, pc: CodeAddressType) -> WordType {
    let fall_through = pc.wrapping_add(INSTR_SIZE);
    if taken {
        fall_through.wrapping_add(immediate as WordType)
    } else {
        fall_through
    }
}

/// Computes the result of an arithmetic instruction, or the next PC of a branch or jump.
///
/// Integer operands are 32 bit two's complement, floating point operands are the raw bits of
/// an `f32`. Branches test `v1` against zero.
pub(crate) fn alu(opcode: Opcode, v1: WordType, v2: WordType, immediate: i32, pc: CodeAddressType) -> WordType {
    let cond = v1 as i32;
    match opcode {
        Opcode::ADD | Opcode::ADDI => int_op(v1, v2, i32::wrapping_add),
        Opcode::SUB | Opcode::SUBI => int_op(v1, v2, i32::wrapping_sub),
        Opcode::XOR => v1 ^ v2,
        Opcode::AND => v1 & v2,
        Opcode::MULT => int_op(v1, v2, i32::wrapping_mul),
        Opcode::DIV => {
            if v2 == 0 {
                DIV_BY_ZERO_RESULT
            } else {
                int_op(v1, v2, i32::wrapping_div)
            }
        }
        Opcode::ADDS => fp_op(v1, v2, |a, b| a + b),
        Opcode::SUBS => fp_op(v1, v2, |a, b| a - b),
        Opcode::MULTS => fp_op(v1, v2, |a, b| a * b),
        Opcode::DIVS => fp_op(v1, v2, |a, b| a / b),
        Opcode::BEQZ => branch(cond == 0, immediate, pc),
        Opcode::BNEZ => branch(cond != 0, immediate, pc),
        Opcode::BLTZ => branch(cond < 0, immediate, pc),
        Opcode::BGTZ => branch(cond > 0, immediate, pc),
        Opcode::BLEZ => branch(cond <= 0, immediate, pc),
        Opcode::BGEZ => branch(cond >= 0, immediate, pc),
        Opcode::JUMP => branch(true, immediate, pc),
        Opcode::LW | Opcode::SW | Opcode::LWS | Opcode::SWS | Opcode::EOP => {
            panic!("{:?} is not executed by the ALU", opcode)
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::cpu::EUConfig;

    use super::*;

    fn f(value: f32) -> WordType {
        value.to_bits()
    }

    #[rstest]
    #[case(Opcode::ADD, 5, 7, 12)]
    #[case(Opcode::ADDI, i32::MAX as u32, 1, i32::MIN as u32)]
    #[case(Opcode::SUB, 3, 5, -2i32 as u32)]
    #[case(Opcode::SUBI, 10, 4, 6)]
    #[case(Opcode::XOR, 0b1100, 0b1010, 0b0110)]
    #[case(Opcode::AND, 0b1100, 0b1010, 0b1000)]
    #[case(Opcode::MULT, -3i32 as u32, 4, -12i32 as u32)]
    #[case(Opcode::DIV, -7i32 as u32, 2, -3i32 as u32)]
    #[case(Opcode::DIV, 7, 0, DIV_BY_ZERO_RESULT)]
    #[case(Opcode::DIV, i32::MIN as u32, -1i32 as u32, i32::MIN as u32)]
    fn test_integer_alu(#[case] opcode: Opcode, #[case] v1: WordType, #[case] v2: WordType, #[case] expected: WordType) {
        assert_eq!(alu(opcode, v1, v2, 0, 0), expected);
    }

    #[rstest]
    #[case(Opcode::ADDS, 1.5, 2.25, 3.75)]
    #[case(Opcode::SUBS, 1.0, 2.5, -1.5)]
    #[case(Opcode::MULTS, 1.5, -2.0, -3.0)]
    #[case(Opcode::DIVS, 1.0, 4.0, 0.25)]
    fn test_fp_alu(#[case] opcode: Opcode, #[case] v1: f32, #[case] v2: f32, #[case] expected: f32) {
        assert_eq!(alu(opcode, f(v1), f(v2), 0, 0), f(expected));
    }

    #[rstest]
    #[case(Opcode::BEQZ, 0, true)]
    #[case(Opcode::BEQZ, 1, false)]
    #[case(Opcode::BNEZ, 1, true)]
    #[case(Opcode::BLTZ, -1, true)]
    #[case(Opcode::BLTZ, 0, false)]
    #[case(Opcode::BGTZ, 1, true)]
    #[case(Opcode::BGTZ, -1, false)]
    #[case(Opcode::BLEZ, 0, true)]
    #[case(Opcode::BGEZ, -5, false)]
    #[case(Opcode::JUMP, 0, true)]
    fn test_branch(#[case] opcode: Opcode, #[case] cond: i32, #[case] taken: bool) {
        let pc = 0x100;
        let expected = if taken { 0x104 + 8 } else { 0x104 };
        assert_eq!(alu(opcode, cond as WordType, 0, 8, pc), expected);
    }

    #[test]
    fn test_backward_branch() {
        assert_eq!(alu(Opcode::BNEZ, 1, 0, -12, 0x10), 0x8);
    }

    fn config(units: Vec<EUConfig>) -> CPUConfig {
        let mut cpu_config = CPUConfig::default();
        cpu_config.execution_units = units;
        cpu_config
    }

    #[test]
    fn test_no_units_is_an_error() {
        assert!(matches!(EUTable::new(&config(vec![])), Err(ConfigError::NoExecutionUnits)));
    }

    #[test]
    fn test_acquire() {
        let table = EUTable::new(&config(vec![
            EUConfig { eu_type: EUType::INTEGER, latency: 1, instances: 2 },
        ])).unwrap();

        assert_eq!(table.acquire(Opcode::ADD).unwrap(), Some(0));
        assert!(matches!(
            table.acquire(Opcode::LW),
            Err(ConfigError::MissingExecutionUnit { eu_type: EUType::MEMORY, .. })
        ));
    }

    #[test]
    fn test_unit_lifecycle() {
        let mut table = EUTable::new(&config(vec![
            EUConfig { eu_type: EUType::MULTIPLIER, latency: 3, instances: 1 },
        ])).unwrap();

        table.start(0, 7, 3, Some(42));
        assert_eq!(table.acquire(Opcode::MULT).unwrap(), None);
        assert!(!table.get(0).is_done());
        table.tick();
        table.tick();
        assert!(table.get(0).is_done());
        assert_eq!(table.get(0).result, Some(42));

        table.complete(0);
        assert_eq!(table.acquire(Opcode::MULT).unwrap(), None);
        table.release_completed();
        assert_eq!(table.acquire(Opcode::MULT).unwrap(), Some(0));
    }
}
