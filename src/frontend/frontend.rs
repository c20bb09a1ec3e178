use std::cell::RefCell;
use std::rc::Rc;

use log::info;

use crate::cpu::{CPUConfig, PerfCounters, Trace};
use crate::instructions::instructions::{CodeAddressType, INSTR_SIZE, InstrQueue, Opcode, Program};

pub(crate) struct FrontendControl {
    pub(crate) fetch_pc: CodeAddressType,
    // set once EOP has been fetched.
    pub(crate) halted: bool,
    // set by a pipeline flush; fetch resumes at fetch_pc in the next cycle.
    pub(crate) redirected: bool,
}

impl FrontendControl {
    pub(crate) fn new() -> Self {
        FrontendControl { fetch_pc: 0, halted: false, redirected: false }
    }

    pub(crate) fn redirect(&mut self, target: CodeAddressType) {
        self.fetch_pc = target;
        self.halted = false;
        self.redirected = true;
    }
}

/// Fetches sequential PCs into the instruction queue. Branches are predicted not taken.
pub(crate) struct Frontend {
    instr_queue: Rc<RefCell<InstrQueue>>,
    n_wide: u8,
    frontend_control: Rc<RefCell<FrontendControl>>,
    program_option: Option<Rc<Program>>,
    trace: Trace,
    perf_counters: Rc<RefCell<PerfCounters>>,
}

impl Frontend {
    pub(crate) fn new(cpu_config: &CPUConfig,
                      instr_queue: Rc<RefCell<InstrQueue>>,
                      frontend_control: Rc<RefCell<FrontendControl>>,
                      perf_counters: Rc<RefCell<PerfCounters>>,
    ) -> Frontend {
        Frontend {
            instr_queue,
            n_wide: cpu_config.issue_n_wide,
            program_option: None,
            trace: cpu_config.trace.clone(),
            frontend_control,
            perf_counters,
        }
    }

    pub(crate) fn init(&mut self, program: &Rc<Program>) {
        self.program_option = Some(Rc::clone(program));

        let mut frontend_control = self.frontend_control.borrow_mut();
        frontend_control.fetch_pc = program.base_address;
        frontend_control.halted = false;
        frontend_control.redirected = false;
    }

    pub(crate) fn do_cycle(&mut self) {
        let program = match &self.program_option {
            None => return,
            Some(program) => program,
        };

        let mut instr_queue = self.instr_queue.borrow_mut();
        let mut frontend_control = self.frontend_control.borrow_mut();
        let mut perf_counters = self.perf_counters.borrow_mut();

        if frontend_control.redirected {
            frontend_control.redirected = false;
            return;
        }

        for _ in 0..self.n_wide {
            if frontend_control.halted || instr_queue.is_full() {
                break;
            }

            let pc = frontend_control.fetch_pc;
            let instr = program.get_instr(pc);

            if self.trace.fetch {
                info!("Fetched [{}] at 0x{:08x}", instr, pc);
            }

            instr_queue.enqueue(pc);
            frontend_control.fetch_pc = pc.wrapping_add(INSTR_SIZE);
            perf_counters.fetch_cnt += 1;

            if instr.opcode == Opcode::EOP {
                frontend_control.halted = true;
            }
        }
    }
}
