use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info};

use crate::backend::execution_unit::{alu, EUTable};
use crate::backend::register_status::RegisterStatusTable;
use crate::backend::reorder_buffer::{Destination, LogEntry, ROB, ROBSlot, ROBSlotState};
use crate::backend::reservation_station::{RSOperand, RSTable};
use crate::cpu::{ArgRegFile, ConfigError, CPUConfig, PerfCounters, SimError, Trace};
use crate::frontend::frontend::FrontendControl;
use crate::instructions::instructions::{CodeAddressType, EUType, INSTR_SIZE, InstrClass, InstrQueue, Opcode, Operand, Program, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

// What a load read before a faulting access is flushed or committed.
const UNDEFINED_VALUE: WordType = 0xFFFF_FFFF;

struct CDBBroadcast {
    rob_slot_index: u16,
    value: WordType,
}

// Where a load gets its value from.
enum LoadSource {
    // an older store still has to execute or commit; try again next cycle.
    Blocked,
    Forward(WordType),
    Memory,
}

// What happened to the head of the ROB in the commit stage.
enum CommitOutcome {
    Stall,
    Exit,
    Retired { redirect: Option<CodeAddressType> },
}

pub(crate) struct Backend {
    instr_queue: Rc<RefCell<InstrQueue>>,
    arch_reg_file: Rc<RefCell<ArgRegFile>>,
    memory_subsystem: Rc<RefCell<MemorySubsystem>>,
    frontend_control: Rc<RefCell<FrontendControl>>,
    program_option: Option<Rc<Program>>,
    rs_table: RSTable,
    reg_status: RegisterStatusTable,
    rob: ROB,
    eu_table: EUTable,
    trace: Trace,
    retire_n_wide: u8,
    issue_n_wide: u8,
    cdb_count: u8,
    // the number of cycles a store occupies the commit stage.
    store_commit_cycles: u8,
    cdb_broadcast_buffer: Vec<CDBBroadcast>,
    pub(crate) exec_log: Vec<LogEntry>,
    pub(crate) exit: bool,
    perf_counters: Rc<RefCell<PerfCounters>>,
}

impl Backend {
    pub(crate) fn new(cpu_config: &CPUConfig,
                      instr_queue: Rc<RefCell<InstrQueue>>,
                      memory_subsystem: Rc<RefCell<MemorySubsystem>>,
                      arch_reg_file: Rc<RefCell<ArgRegFile>>,
                      frontend_control: Rc<RefCell<FrontendControl>>,
                      perf_counters: Rc<RefCell<PerfCounters>>) -> Result<Backend, ConfigError> {
        let eu_table = EUTable::new(cpu_config)?;
        let store_commit_cycles = eu_table.latency(EUType::MEMORY).unwrap_or(1);

        Ok(Backend {
            trace: cpu_config.trace.clone(),
            instr_queue,
            memory_subsystem,
            arch_reg_file,
            frontend_control,
            program_option: None,
            rs_table: RSTable::new(cpu_config),
            reg_status: RegisterStatusTable::new(),
            rob: ROB::new(cpu_config.rob_capacity),
            eu_table,
            retire_n_wide: cpu_config.retire_n_wide,
            issue_n_wide: cpu_config.issue_n_wide,
            cdb_count: cpu_config.cdb_count,
            store_commit_cycles,
            cdb_broadcast_buffer: Vec::with_capacity(cpu_config.cdb_count as usize),
            exec_log: Vec::new(),
            exit: false,
            perf_counters,
        })
    }

    pub(crate) fn init(&mut self, program: &Rc<Program>) {
        self.program_option = Some(Rc::clone(program));
        self.reset();
    }

    pub(crate) fn supports(&self, opcode: Opcode) -> Result<(), ConfigError> {
        self.eu_table.supports(opcode)
    }

    pub(crate) fn register_tag(&self, reg: Operand) -> Option<u16> {
        self.reg_status.get(reg)
    }

    pub(crate) fn rob_to_string(&self) -> String {
        self.rob.to_string()
    }

    pub(crate) fn rs_table_to_string(&self) -> String {
        self.rs_table.to_string()
    }

    pub(crate) fn reset(&mut self) {
        self.rob.reset();
        self.rs_table.flush();
        self.eu_table.flush();
        self.reg_status.flush();
        self.cdb_broadcast_buffer.clear();
        self.exec_log.clear();
        self.exit = false;
    }

    /// Runs the stages downstream of fetch: release, commit, write-result and execute.
    pub(crate) fn do_cycle_retire_side(&mut self) -> Result<(), SimError> {
        self.cycle_release();
        self.cycle_commit()?;
        if self.exit {
            return Ok(());
        }
        self.cycle_write_result();
        self.cycle_execute()
    }

    /// Runs the stages upstream of fetch: issue and the CDB wakeup at the end of the cycle.
    pub(crate) fn do_cycle_issue_side(&mut self) {
        self.cycle_issue();
        self.cdb_broadcast();
    }

    fn now(&self) -> u64 {
        self.perf_counters.borrow().cycle_cnt
    }

    // Frees everything that was retired or written back in the previous cycle.
    fn cycle_release(&mut self) {
        for rob_slot_index in self.rob.release_committed() {
            debug_assert!(!self.rs_table.has_waiting_on(rob_slot_index),
                          "ROB slot {} released while a reservation station still waits on it", rob_slot_index);
        }
        self.rs_table.release_completed();
        self.eu_table.release_completed();
    }

    fn cycle_commit(&mut self) -> Result<(), SimError> {
        for _ in 0..self.retire_n_wide {
            if !self.rob.has_in_flight() {
                break;
            }

            match self.commit_head()? {
                CommitOutcome::Stall => break,
                CommitOutcome::Exit => {
                    self.exit = true;
                    break;
                }
                CommitOutcome::Retired { redirect: None } => {}
                CommitOutcome::Retired { redirect: Some(target) } => {
                    self.flush(target);
                    break;
                }
            }
        }
        Ok(())
    }

    fn commit_head(&mut self) -> Result<CommitOutcome, SimError> {
        let cycle = self.now();
        let rob_slot_index = self.rob.head_index();
        let rob_slot = self.rob.get_mut(rob_slot_index);

        match rob_slot.state {
            ROBSlotState::WRITE_RESULT | ROBSlotState::COMMIT => {}
            _ => return Ok(CommitOutcome::Stall),
        }
        debug_assert!(rob_slot.ready);

        let instr = rob_slot.instr;
        let pc = rob_slot.pc;
        let mut redirect = None;

        match instr.class() {
            InstrClass::Exit => {
                if self.trace.commit {
                    info!("Committed [EOP] at 0x{:08x}", pc);
                }
                return Ok(CommitOutcome::Exit);
            }
            InstrClass::Store => {
                if rob_slot.state == ROBSlotState::WRITE_RESULT {
                    rob_slot.state = ROBSlotState::COMMIT;
                    rob_slot.times.commit = Some(cycle);
                    rob_slot.commit_cycles_remaining = self.store_commit_cycles;
                }

                rob_slot.commit_cycles_remaining -= 1;
                if rob_slot.commit_cycles_remaining > 0 {
                    return Ok(CommitOutcome::Stall);
                }

                let (addr, value) = match (rob_slot.destination, rob_slot.value) {
                    (Destination::Memory(Some(addr)), Some(value)) => (addr, value),
                    (destination, value) => panic!("Store at 0x{:08x} committed without address or value: {} {:?}", pc, destination, value),
                };

                if !self.memory_subsystem.borrow_mut().write_word(addr, value) {
                    return Err(SimError::MemoryFault { pc, addr });
                }
            }
            InstrClass::Branch | InstrClass::Jump => {
                let target = rob_slot.value.unwrap_or(UNDEFINED_VALUE);
                let mut perf_counters = self.perf_counters.borrow_mut();
                if target == pc.wrapping_add(INSTR_SIZE) {
                    perf_counters.branch_good_predictions_cnt += 1;
                } else {
                    perf_counters.branch_miss_prediction_cnt += 1;
                    redirect = Some(target);
                }
            }
            InstrClass::Load | InstrClass::IntAlu | InstrClass::FpAlu => {
                if let Some(addr) = rob_slot.fault_addr {
                    return Err(SimError::MemoryFault { pc, addr });
                }

                if let (Destination::Register(reg), Some(value)) = (rob_slot.destination, rob_slot.value) {
                    self.arch_reg_file.borrow_mut().set_value(reg, value);
                    self.reg_status.clear_if_pending(reg, rob_slot_index);
                }
            }
        }

        if rob_slot.times.commit.is_none() {
            rob_slot.times.commit = Some(cycle);
        }
        self.exec_log.push(LogEntry { pc, times: rob_slot.times });
        self.rob.commit_head();
        self.perf_counters.borrow_mut().retired_cnt += 1;

        if self.trace.commit {
            info!("Committed [{}] at 0x{:08x}", instr, pc);
        }

        Ok(CommitOutcome::Retired { redirect })
    }

    // Discards all speculative state after a mispredicted branch retired and
    // redirects the frontend to the actual target.
    fn flush(&mut self, target: CodeAddressType) {
        let squashed = self.rob.flush_in_flight();
        self.rs_table.flush();
        self.eu_table.flush();
        self.reg_status.flush();
        self.cdb_broadcast_buffer.clear();
        self.instr_queue.borrow_mut().flush();

        let mut frontend_control = self.frontend_control.borrow_mut();
        frontend_control.redirect(target);

        let mut perf_counters = self.perf_counters.borrow_mut();
        perf_counters.pipeline_flushes += 1;
        perf_counters.bad_speculation_cnt += squashed;

        if self.trace.pipeline_flush {
            info!("Pipeline flush: {} instructions squashed, fetch resumes at 0x{:08x}", squashed, target);
        }
    }

    // Oldest first, up to cdb_count finished instructions put their result on the CDB.
    fn cycle_write_result(&mut self) {
        let cycle = self.now();
        let mut broadcasts = 0;

        for seq in self.rob.in_flight() {
            if broadcasts == self.cdb_count {
                break;
            }

            let rob_slot_index = self.rob.to_index(seq);
            let rob_slot = self.rob.get_mut(rob_slot_index);
            if rob_slot.state != ROBSlotState::EXECUTE {
                continue;
            }

            let (eu_index, rs_index) = match (rob_slot.eu_index, rob_slot.rs_index) {
                (Some(eu_index), Some(rs_index)) => (eu_index, rs_index),
                _ => panic!("ROB slot {} is executing without a reservation station or execution unit", rob_slot_index),
            };

            let eu = self.eu_table.get(eu_index);
            if !eu.is_done() {
                continue;
            }
            debug_assert_eq!(eu.rob_slot_index, Some(rob_slot_index));

            let result = eu.result;
            self.eu_table.complete(eu_index);
            self.rs_table.complete(rs_index);

            if rob_slot.instr.class() != InstrClass::Store {
                rob_slot.value = result;
            }
            rob_slot.ready = true;
            rob_slot.state = ROBSlotState::WRITE_RESULT;
            rob_slot.times.write_result = Some(cycle);

            if let (Destination::Register(_), Some(value)) = (rob_slot.destination, rob_slot.value) {
                self.cdb_broadcast_buffer.push(CDBBroadcast { rob_slot_index, value });
            }

            if self.trace.write_result {
                info!("Write result [{}] value {:?}", rob_slot.instr, rob_slot.value);
            }

            broadcasts += 1;
            self.perf_counters.borrow_mut().write_result_cnt += 1;
        }
    }

    // Starts every instruction whose operands and execution unit are available, oldest first.
    // An instruction never executes in the cycle it was issued.
    fn cycle_execute(&mut self) -> Result<(), SimError> {
        let cycle = self.now();
        self.eu_table.tick();

        for seq in self.rob.in_flight() {
            let rob_slot_index = self.rob.to_index(seq);
            let rob_slot = self.rob.get(rob_slot_index);
            if rob_slot.state != ROBSlotState::ISSUE || rob_slot.times.issue == Some(cycle) {
                continue;
            }

            let rs_index = rob_slot.rs_index;
            if let Some(rs_index) = rs_index {
                self.try_execute(seq, rob_slot_index, rs_index, cycle)?;
            }
        }
        Ok(())
    }

    fn try_execute(&mut self, seq: u64, rob_slot_index: u16, rs_index: u16, cycle: u64) -> Result<(), SimError> {
        let instr = self.rob.get(rob_slot_index).instr;

        // the address of a load or store resolves as soon as its base register is known.
        if let Some(base_index) = instr.base_source_index() {
            let rs = self.rs_table.get_mut(rs_index);
            if rs.address.is_none() {
                if let RSOperand::Ready(base) = rs.source[base_index] {
                    rs.address = Some(base.wrapping_add(rs.immediate as WordType));
                }
            }
        }

        let rs = *self.rs_table.get(rs_index);
        let mut fault_addr = None;
        let mut store = None;

        // `fixed_cycles` overrides the latency of the unit.
        let (result, fixed_cycles) = match instr.class() {
            InstrClass::Load => {
                let addr = match rs.address {
                    Some(addr) => addr,
                    None => return Ok(()),
                };

                match self.load_source(seq, addr) {
                    LoadSource::Blocked => return Ok(()),
                    LoadSource::Forward(value) => (Some(value), Some(1)),
                    LoadSource::Memory => match self.memory_subsystem.borrow().read_word(addr) {
                        Some(value) => (Some(value), None),
                        None => {
                            fault_addr = Some(addr);
                            (Some(UNDEFINED_VALUE), None)
                        }
                    },
                }
            }
            InstrClass::Store => {
                let (addr, value) = match (rs.address, rs.source[0]) {
                    (Some(addr), RSOperand::Ready(value)) => (addr, value),
                    _ => return Ok(()),
                };
                store = Some((addr, value));
                (None, Some(1))
            }
            InstrClass::IntAlu | InstrClass::FpAlu | InstrClass::Branch | InstrClass::Jump => {
                let (v1, v2) = match (rs.source[0], rs.source[1]) {
                    (RSOperand::Ready(v1), RSOperand::Ready(v2)) => (v1, v2),
                    _ => return Ok(()),
                };
                (Some(alu(rs.opcode, v1, v2, rs.immediate, rs.pc)), None)
            }
            InstrClass::Exit => return Ok(()),
        };

        let eu_index = match self.eu_table.acquire(instr.opcode)? {
            Some(eu_index) => eu_index,
            None => return Ok(()),
        };
        let cycles = fixed_cycles.unwrap_or(self.eu_table.get(eu_index).latency);
        self.eu_table.start(eu_index, rob_slot_index, cycles, result);

        if let Some(addr) = fault_addr {
            debug!("Load at 0x{:08x} reads 0x{:08x} outside of the data memory", rs.pc, addr);
        }

        let rob_slot = self.rob.get_mut(rob_slot_index);
        rob_slot.state = ROBSlotState::EXECUTE;
        rob_slot.eu_index = Some(eu_index);
        rob_slot.times.execute = Some(cycle);
        rob_slot.fault_addr = fault_addr;
        if let Some((addr, value)) = store {
            rob_slot.destination = Destination::Memory(Some(addr));
            rob_slot.value = Some(value);
        }

        if self.trace.execute {
            info!("Executing [{}] on unit {} for {} cycles", instr, eu_index, cycles);
        }
        self.perf_counters.borrow_mut().execute_cnt += 1;
        Ok(())
    }

    // Memory disambiguation: a load waits for every older store to resolve its address, and for
    // an older store to the same word to know its value. It takes the value of the youngest one.
    fn load_source(&self, load_seq: u64, addr: WordType) -> LoadSource {
        let mut source = LoadSource::Memory;

        for seq in self.rob.seq_committed..load_seq {
            let rob_slot = self.rob.get(self.rob.to_index(seq));
            if rob_slot.instr.class() != InstrClass::Store {
                continue;
            }

            let (store_addr, value) = self.store_operands(rob_slot);
            match store_addr {
                None => return LoadSource::Blocked,
                Some(store_addr) if store_addr == addr => match value {
                    Some(value) => source = LoadSource::Forward(value),
                    None => return LoadSource::Blocked,
                },
                // a partial overlap can't be forwarded; wait until the store has written memory.
                Some(store_addr) if store_addr.abs_diff(addr) < INSTR_SIZE => return LoadSource::Blocked,
                Some(_) => {}
            }
        }

        source
    }

    // The address and value of a store. Before it executes they live in its reservation station.
    fn store_operands(&self, rob_slot: &ROBSlot) -> (Option<WordType>, Option<WordType>) {
        if let Destination::Memory(Some(addr)) = rob_slot.destination {
            return (Some(addr), rob_slot.value);
        }

        match rob_slot.rs_index {
            Some(rs_index) => {
                let rs = self.rs_table.get(rs_index);
                (rs.address, rs.source[0].value())
            }
            None => (None, None),
        }
    }

    // In program order, moves instructions from the instruction queue into the ROB and a
    // reservation station. Stops at the first instruction that can't be issued.
    fn cycle_issue(&mut self) {
        let cycle = self.now();
        let program = match &self.program_option {
            Some(program) => Rc::clone(program),
            None => return,
        };

        for _ in 0..self.issue_n_wide {
            let pc = {
                let instr_queue = self.instr_queue.borrow();
                if instr_queue.is_empty() || !self.rob.has_space() {
                    break;
                }
                instr_queue.peek()
            };

            let instr = program.get_instr(pc);
            let rs_index = match instr.opcode.rs_type() {
                Some(rs_type) => match self.rs_table.allocate(rs_type) {
                    Some(rs_index) => Some(rs_index),
                    None => break,
                },
                None => None,
            };

            // operands are read before the destination is renamed, so `ADD R1 R1 R1` reads the old R1.
            let source = instr.source.map(|operand| self.read_operand(operand));

            let rob_slot_index = self.rob.allocate();
            let destination = match instr.class() {
                InstrClass::Load | InstrClass::IntAlu | InstrClass::FpAlu => {
                    self.reg_status.set_pending(instr.sink, rob_slot_index);
                    Destination::Register(instr.sink)
                }
                InstrClass::Store => Destination::Memory(None),
                InstrClass::Branch | InstrClass::Jump | InstrClass::Exit => Destination::Unused,
            };

            let rob_slot = self.rob.get_mut(rob_slot_index);
            rob_slot.instr = instr;
            rob_slot.pc = pc;
            rob_slot.destination = destination;
            rob_slot.rs_index = rs_index;
            rob_slot.times.issue = Some(cycle);

            match rs_index {
                Some(rs_index) => {
                    rob_slot.state = ROBSlotState::ISSUE;

                    let rs = self.rs_table.get_mut(rs_index);
                    rs.rob_slot_index = Some(rob_slot_index);
                    rs.opcode = instr.opcode;
                    rs.pc = pc;
                    rs.source = source;
                    rs.immediate = instr.immediate;
                    rs.address = None;
                }
                None => {
                    // EOP has nothing to compute.
                    rob_slot.state = ROBSlotState::WRITE_RESULT;
                    rob_slot.ready = true;
                }
            }

            self.instr_queue.borrow_mut().dequeue();

            if self.trace.issue {
                info!("Issued [{}] at 0x{:08x} into ROB slot {}", instr, pc, rob_slot_index);
            }
            self.perf_counters.borrow_mut().issue_cnt += 1;
        }
    }

    fn read_operand(&self, operand: Operand) -> RSOperand {
        match operand {
            Operand::IntReg(_) | Operand::FpReg(_) => match self.reg_status.get(operand) {
                Some(rob_slot_index) => {
                    let producer = self.rob.get(rob_slot_index);
                    match (producer.ready, producer.value) {
                        (true, Some(value)) => RSOperand::Ready(value),
                        _ => RSOperand::Waiting(rob_slot_index),
                    }
                }
                None => RSOperand::Ready(self.arch_reg_file.borrow().get_value(operand)),
            },
            Operand::Immediate(value) => RSOperand::Ready(value),
            Operand::Unused => RSOperand::Ready(0),
        }
    }

    // Values written in this cycle reach the waiting reservation stations at its very end.
    fn cdb_broadcast(&mut self) {
        for broadcast in self.cdb_broadcast_buffer.drain(..) {
            self.rs_table.wakeup(broadcast.rob_slot_index, broadcast.value);
        }
    }
}
