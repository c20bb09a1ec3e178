use std::cell::RefCell;
use std::fmt;
use std::fmt::Display;
use std::fs::File;
use std::path::Path;
use std::rc::Rc;

use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::backend::Backend;
use crate::backend::reorder_buffer::{ExecutionLog, LogEntry};
use crate::frontend::frontend::{Frontend, FrontendControl};
use crate::instructions::instructions::{CodeAddressType, EUType, InstrQueue, NUM_GP_REGISTERS, Opcode, Operand, Program, RegisterType, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read the config: {0}")]
    IO(#[from] std::io::Error),
    #[error("failed to parse the config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("the CPU has no execution units")]
    NoExecutionUnits,
    #[error("{opcode:?} needs an execution unit of type {eu_type:?} but none is configured")]
    MissingExecutionUnit { opcode: Opcode, eu_type: EUType },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("instruction at 0x{pc:08x} accessed 0x{addr:08x} outside of the data memory")]
    MemoryFault { pc: CodeAddressType, addr: WordType },
    #[error("address 0x{0:08x} is outside of the data memory")]
    AddressOutOfRange(WordType),
    #[error("no program loaded")]
    NoProgram,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PerfCounters {
    pub fetch_cnt: u64,
    pub issue_cnt: u64,
    pub execute_cnt: u64,
    pub write_result_cnt: u64,
    pub retired_cnt: u64,
    pub cycle_cnt: u64,
    pub branch_good_predictions_cnt: u64,
    pub branch_miss_prediction_cnt: u64,
    pub pipeline_flushes: u64,
    pub bad_speculation_cnt: u64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpi(&self) -> f32 {
        if self.retired_cnt == 0 {
            0.0
        } else {
            self.cycle_cnt as f32 / self.retired_cnt as f32
        }
    }

    pub fn ipc(&self) -> f32 {
        if self.cycle_cnt == 0 {
            0.0
        } else {
            self.retired_cnt as f32 / self.cycle_cnt as f32
        }
    }
}

impl Display for PerfCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Cycles:{}][Fetched={}][Issued={}][Executed={}][Written={}][Retired={}][IPC={:.2}][CPI={:.2}]",
               self.cycle_cnt,
               self.fetch_cnt,
               self.issue_cnt,
               self.execute_cnt,
               self.write_result_cnt,
               self.retired_cnt,
               self.ipc(),
               self.cpi())?;
        write!(f, "[Branch Good={}][Branch Miss={}][Flushes={}][Squashed={}]",
               self.branch_good_predictions_cnt,
               self.branch_miss_prediction_cnt,
               self.pipeline_flushes,
               self.bad_speculation_cnt)
    }
}

#[derive(Clone, Deserialize, Debug, Default)]
#[serde(default)]
pub struct Trace {
    pub fetch: bool,
    pub issue: bool,
    pub execute: bool,
    pub write_result: bool,
    pub commit: bool,
    pub cycle: bool,
    pub pipeline_flush: bool,
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
pub struct EUConfig {
    pub eu_type: EUType,
    // the number of cycles an instruction occupies the unit.
    pub latency: u8,
    pub instances: u8,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct CPUConfig {
    // the size of the data memory in bytes
    pub memory_size: u32,
    // the capacity of the reorder buffer; also the capacity of the instruction queue
    pub rob_capacity: u16,
    pub int_rs_count: u16,
    pub add_rs_count: u16,
    pub mult_rs_count: u16,
    pub load_buffer_count: u16,
    // the number of instructions that can be fetched and issued every clock cycle.
    pub issue_n_wide: u8,
    // the number of instructions that can retire per clock cycle
    pub retire_n_wide: u8,
    // the number of results that can be broadcast per clock cycle
    pub cdb_count: u8,
    pub execution_units: Vec<EUConfig>,
    // if processing of a single instruction should be traced (logged)
    pub trace: Trace,
}

impl Default for CPUConfig {
    fn default() -> Self {
        CPUConfig {
            memory_size: 64 * 1024,
            rob_capacity: 8,
            int_rs_count: 2,
            add_rs_count: 2,
            mult_rs_count: 2,
            load_buffer_count: 2,
            issue_n_wide: 1,
            retire_n_wide: 1,
            cdb_count: 1,
            execution_units: vec![
                EUConfig { eu_type: EUType::INTEGER, latency: 1, instances: 1 },
                EUConfig { eu_type: EUType::ADDER, latency: 2, instances: 1 },
                EUConfig { eu_type: EUType::MULTIPLIER, latency: 4, instances: 1 },
                EUConfig { eu_type: EUType::DIVIDER, latency: 8, instances: 1 },
                EUConfig { eu_type: EUType::MEMORY, latency: 2, instances: 1 },
            ],
            trace: Trace::default(),
        }
    }
}

impl CPUConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("rob_capacity", self.rob_capacity as u32),
            ("int_rs_count", self.int_rs_count as u32),
            ("add_rs_count", self.add_rs_count as u32),
            ("mult_rs_count", self.mult_rs_count as u32),
            ("load_buffer_count", self.load_buffer_count as u32),
            ("issue_n_wide", self.issue_n_wide as u32),
            ("retire_n_wide", self.retire_n_wide as u32),
            ("cdb_count", self.cdb_count as u32),
        ];

        for (name, size) in sizes {
            if size == 0 {
                return Err(ConfigError::Invalid(format!("{} must be larger than 0", name)));
            }
        }

        if self.execution_units.iter().all(|eu_config| eu_config.instances == 0) {
            return Err(ConfigError::NoExecutionUnits);
        }

        Ok(())
    }
}

pub fn load_cpu_config<P: AsRef<Path>>(file_path: P) -> Result<CPUConfig, ConfigError> {
    let file = File::open(file_path)?;
    let config: CPUConfig = serde_yaml::from_reader(file)?;
    config.validate()?;
    Ok(config)
}

pub struct CPU {
    backend: Backend,
    frontend: Frontend,
    memory_subsystem: Rc<RefCell<MemorySubsystem>>,
    arch_reg_file: Rc<RefCell<ArgRegFile>>,
    instr_queue: Rc<RefCell<InstrQueue>>,
    trace: Trace,
    perf_counters: Rc<RefCell<PerfCounters>>,
    program_option: Option<Rc<Program>>,
}

impl CPU {
    pub fn new(cpu_config: &CPUConfig) -> Result<CPU, ConfigError> {
        cpu_config.validate()?;

        let instr_queue = Rc::new(RefCell::new(InstrQueue::new(cpu_config.rob_capacity)));

        let perf_counters = Rc::new(RefCell::new(PerfCounters::new()));

        let memory_subsystem = Rc::new(RefCell::new(
            MemorySubsystem::new(cpu_config)));

        let arch_reg_file = Rc::new(RefCell::new(
            ArgRegFile::new(NUM_GP_REGISTERS)));

        let frontend_control = Rc::new(RefCell::new(
            FrontendControl::new()));

        let backend = Backend::new(
            cpu_config,
            Rc::clone(&instr_queue),
            Rc::clone(&memory_subsystem),
            Rc::clone(&arch_reg_file),
            Rc::clone(&frontend_control),
            Rc::clone(&perf_counters),
        )?;

        let frontend = Frontend::new(
            cpu_config,
            Rc::clone(&instr_queue),
            Rc::clone(&frontend_control),
            Rc::clone(&perf_counters),
        );

        Ok(CPU {
            backend,
            frontend,
            memory_subsystem,
            arch_reg_file,
            instr_queue,
            trace: cpu_config.trace.clone(),
            perf_counters,
            program_option: None,
        })
    }

    /// Installs the program and points fetch at its first instruction. Fails when the
    /// program uses an instruction none of the configured execution units can execute.
    pub fn load_program(&mut self, program: Program) -> Result<(), ConfigError> {
        for instr in &program.code {
            self.backend.supports(instr.opcode)?;
        }

        let program = Rc::new(program);
        self.frontend.init(&program);
        self.backend.init(&program);
        self.program_option = Some(program);
        Ok(())
    }

    /// Advances the clock `cycles` cycles, or until the program completes when `cycles` is 0.
    /// The clock doesn't advance once the program has completed.
    pub fn run(&mut self, cycles: u64) -> Result<(), SimError> {
        if self.program_option.is_none() {
            return Err(SimError::NoProgram);
        }

        let mut cycle = 0;
        while !self.backend.exit && (cycles == 0 || cycle < cycles) {
            self.do_cycle()?;
            cycle += 1;
        }

        if self.backend.exit && self.trace.cycle {
            info!("Program complete!");
        }
        Ok(())
    }

    fn do_cycle(&mut self) -> Result<(), SimError> {
        if self.trace.cycle {
            info!("{}", self.perf_counters.borrow());
        }

        // downstream stages go first so that every result becomes visible a cycle later.
        self.backend.do_cycle_retire_side()?;
        if !self.backend.exit {
            self.frontend.do_cycle();
            self.backend.do_cycle_issue_side();
        }

        self.perf_counters.borrow_mut().cycle_cnt += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.backend.exit
    }

    /// Brings the CPU back to its initial state: registers and the pipeline are cleared and
    /// memory is uninitialized again. The loaded program and the configuration are kept.
    pub fn reset(&mut self) {
        self.backend.reset();
        self.instr_queue.borrow_mut().flush();
        self.memory_subsystem.borrow_mut().reset();
        self.arch_reg_file.borrow_mut().reset();
        *self.perf_counters.borrow_mut() = PerfCounters::new();
        if let Some(program) = &self.program_option {
            self.frontend.init(program);
        }
    }

    pub fn get_int_register(&self, reg: RegisterType) -> i32 {
        check_register(reg);
        self.arch_reg_file.borrow().get_value(Operand::IntReg(reg)) as i32
    }

    pub fn set_int_register(&mut self, reg: RegisterType, value: i32) {
        check_register(reg);
        self.arch_reg_file.borrow_mut().set_value(Operand::IntReg(reg), value as WordType);
    }

    pub fn get_fp_register(&self, reg: RegisterType) -> f32 {
        check_register(reg);
        f32::from_bits(self.arch_reg_file.borrow().get_value(Operand::FpReg(reg)))
    }

    pub fn set_fp_register(&mut self, reg: RegisterType, value: f32) {
        check_register(reg);
        self.arch_reg_file.borrow_mut().set_value(Operand::FpReg(reg), value.to_bits());
    }

    /// The ROB entry that is going to write the integer register, if any.
    pub fn get_int_register_tag(&self, reg: RegisterType) -> Option<u16> {
        check_register(reg);
        self.backend.register_tag(Operand::IntReg(reg))
    }

    pub fn get_fp_register_tag(&self, reg: RegisterType) -> Option<u16> {
        check_register(reg);
        self.backend.register_tag(Operand::FpReg(reg))
    }

    pub fn write_memory(&mut self, address: WordType, value: WordType) -> Result<(), SimError> {
        if self.memory_subsystem.borrow_mut().write_word(address, value) {
            Ok(())
        } else {
            Err(SimError::AddressOutOfRange(address))
        }
    }

    pub fn read_memory(&self, address: WordType) -> Result<WordType, SimError> {
        self.memory_subsystem.borrow().read_word(address).ok_or(SimError::AddressOutOfRange(address))
    }

    pub fn dump_memory(&self, start: WordType, end: WordType) -> String {
        self.memory_subsystem.borrow().dump(start as usize, end as usize).to_string()
    }

    pub fn get_instructions_executed(&self) -> u64 {
        self.perf_counters.borrow().retired_cnt
    }

    pub fn get_clock_cycles(&self) -> u64 {
        self.perf_counters.borrow().cycle_cnt
    }

    pub fn get_cpi(&self) -> f32 {
        self.perf_counters.borrow().cpi()
    }

    pub fn get_ipc(&self) -> f32 {
        self.perf_counters.borrow().ipc()
    }

    pub fn perf_counters(&self) -> PerfCounters {
        self.perf_counters.borrow().clone()
    }

    pub fn execution_log(&self) -> &[LogEntry] {
        &self.backend.exec_log
    }

    pub fn print_execution_log(&self) -> String {
        ExecutionLog(&self.backend.exec_log).to_string()
    }

    pub fn print_rob(&self) -> String {
        self.backend.rob_to_string()
    }

    pub fn print_reservation_stations(&self) -> String {
        self.backend.rs_table_to_string()
    }

    /// The register files; a register with a pending write shows the ROB entry producing it.
    pub fn print_registers(&self) -> String {
        let arch_reg_file = self.arch_reg_file.borrow();
        let mut out = String::from("GENERAL PURPOSE REGISTERS\n");
        out.push_str(&format!("{:>8}{:>12}{:>16}\n", "Register", "Value", "ROB"));
        let int_regs = (0..NUM_GP_REGISTERS).map(Operand::IntReg);
        let fp_regs = (0..NUM_GP_REGISTERS).map(Operand::FpReg);
        for reg in int_regs.chain(fp_regs) {
            match self.backend.register_tag(reg) {
                Some(rob_slot_index) => out.push_str(&format!("{:>8}{:>12}{:>16}\n", reg.to_string(), "-", rob_slot_index)),
                None => {
                    let value = arch_reg_file.get_value(reg);
                    let rendered = match reg {
                        Operand::FpReg(_) => format!("{:.2}", f32::from_bits(value)),
                        _ => format!("{}", value as i32),
                    };
                    out.push_str(&format!("{:>8}{:>12}{:>16}\n", reg.to_string(), rendered, "-"));
                }
            }
        }
        out
    }
}

/// The architectural register files: integer and floating point, both stored as raw 32 bit words.
pub(crate) struct ArgRegFile {
    int_entries: Vec<WordType>,
    fp_entries: Vec<WordType>,
}

fn check_register(reg: RegisterType) {
    assert!(reg < NUM_GP_REGISTERS, "Register {} out of range, there are {} registers per kind", reg, NUM_GP_REGISTERS);
}

impl ArgRegFile {
    pub(crate) fn new(reg_count: u16) -> ArgRegFile {
        ArgRegFile {
            int_entries: vec![0; reg_count as usize],
            fp_entries: vec![0; reg_count as usize],
        }
    }

    pub(crate) fn get_value(&self, reg: Operand) -> WordType {
        match reg {
            Operand::IntReg(index) => self.int_entries[index as usize],
            Operand::FpReg(index) => self.fp_entries[index as usize],
            _ => panic!("Operand is not a register but of type {:?}", reg),
        }
    }

    pub(crate) fn set_value(&mut self, reg: Operand, value: WordType) {
        match reg {
            Operand::IntReg(index) => self.int_entries[index as usize] = value,
            Operand::FpReg(index) => self.fp_entries[index as usize] = value,
            _ => panic!("Operand is not a register but of type {:?}", reg),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.int_entries.fill(0);
        self.fp_entries.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_load_cpu_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "rob_capacity: 16").unwrap();
        writeln!(file, "issue_n_wide: 2").unwrap();
        writeln!(file, "execution_units:").unwrap();
        writeln!(file, "  - eu_type: INTEGER").unwrap();
        writeln!(file, "    latency: 1").unwrap();
        writeln!(file, "    instances: 2").unwrap();
        writeln!(file, "trace:").unwrap();
        writeln!(file, "  commit: true").unwrap();

        let config = load_cpu_config(file.path()).unwrap();
        assert_eq!(config.rob_capacity, 16);
        assert_eq!(config.issue_n_wide, 2);
        // missing fields take their defaults
        assert_eq!(config.cdb_count, 1);
        assert_eq!(config.execution_units, vec![EUConfig { eu_type: EUType::INTEGER, latency: 1, instances: 2 }]);
        assert!(config.trace.commit);
        assert!(!config.trace.issue);
    }

    #[test]
    fn test_shipped_config_matches_default() {
        let config = load_cpu_config("cpu.yaml").unwrap();
        let default = CPUConfig::default();
        assert_eq!(config.rob_capacity, default.rob_capacity);
        assert_eq!(config.memory_size, default.memory_size);
        assert_eq!(config.execution_units, default.execution_units);
    }

    #[test]
    fn test_load_cpu_config_missing_file() {
        assert!(matches!(load_cpu_config("does/not/exist.yaml"), Err(ConfigError::IO(_))));
    }

    #[test]
    fn test_load_cpu_config_bad_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "rob_capacity: lots").unwrap();
        assert!(matches!(load_cpu_config(file.path()), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let mut config = CPUConfig::default();
        config.rob_capacity = 0;
        assert!(matches!(CPU::new(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_no_execution_units_is_rejected() {
        let mut config = CPUConfig::default();
        config.execution_units.clear();
        assert!(matches!(CPU::new(&config), Err(ConfigError::NoExecutionUnits)));
    }

    #[test]
    fn test_cpi_without_instructions() {
        let perf_counters = PerfCounters::new();
        assert_eq!(perf_counters.cpi(), 0.0);
        assert_eq!(perf_counters.ipc(), 0.0);
    }
}
