use std::fmt;

use serde::Deserialize;

use Operand::{FpReg, Immediate, IntReg, Unused};

pub type RegisterType = u16;
pub type WordType = u32;
pub type CodeAddressType = u32;

// The number of integer and the number of floating point architectural registers.
pub const NUM_GP_REGISTERS: u16 = 32;

// The maximum number of source (input) operands for an instruction.
pub const MAX_SOURCE_COUNT: usize = 2;

// Every instruction occupies one word in the instruction memory.
pub const INSTR_SIZE: CodeAddressType = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Opcode {
    LW,
    SW,
    ADD,
    ADDI,
    SUB,
    SUBI,
    XOR,
    AND,
    MULT,
    DIV,
    BEQZ,
    BNEZ,
    BLTZ,
    BGTZ,
    BLEZ,
    BGEZ,
    JUMP,
    EOP,
    LWS,
    SWS,
    ADDS,
    SUBS,
    MULTS,
    DIVS,
}

/// The kind of work an opcode does. Every pipeline stage dispatches on this.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InstrClass {
    Load,
    Store,
    IntAlu,
    FpAlu,
    Branch,
    Jump,
    Exit,
}

/// The reservation station bank an instruction waits in.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RSType {
    INTEGER,
    ADD,
    MULT,
    LOAD,
}

/// The type of functional unit an instruction executes on.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Deserialize)]
pub enum EUType {
    INTEGER,
    ADDER,
    MULTIPLIER,
    DIVIDER,
    MEMORY,
}

impl Opcode {
    pub fn class(self) -> InstrClass {
        match self {
            Opcode::LW | Opcode::LWS => InstrClass::Load,
            Opcode::SW | Opcode::SWS => InstrClass::Store,
            Opcode::ADD |
            Opcode::ADDI |
            Opcode::SUB |
            Opcode::SUBI |
            Opcode::XOR |
            Opcode::AND |
            Opcode::MULT |
            Opcode::DIV => InstrClass::IntAlu,
            Opcode::ADDS |
            Opcode::SUBS |
            Opcode::MULTS |
            Opcode::DIVS => InstrClass::FpAlu,
            Opcode::BEQZ |
            Opcode::BNEZ |
            Opcode::BLTZ |
            Opcode::BGTZ |
            Opcode::BLEZ |
            Opcode::BGEZ => InstrClass::Branch,
            Opcode::JUMP => InstrClass::Jump,
            Opcode::EOP => InstrClass::Exit,
        }
    }

    /// The reservation station bank; `None` for EOP which only takes a ROB slot.
    pub fn rs_type(self) -> Option<RSType> {
        match self {
            Opcode::LW | Opcode::SW | Opcode::LWS | Opcode::SWS => Some(RSType::LOAD),
            Opcode::ADD |
            Opcode::ADDI |
            Opcode::SUB |
            Opcode::SUBI |
            Opcode::XOR |
            Opcode::AND |
            Opcode::BEQZ |
            Opcode::BNEZ |
            Opcode::BLTZ |
            Opcode::BGTZ |
            Opcode::BLEZ |
            Opcode::BGEZ |
            Opcode::JUMP => Some(RSType::INTEGER),
            Opcode::ADDS | Opcode::SUBS => Some(RSType::ADD),
            Opcode::MULT | Opcode::DIV | Opcode::MULTS | Opcode::DIVS => Some(RSType::MULT),
            Opcode::EOP => None,
        }
    }

    /// The functional unit type; `None` for EOP which never executes.
    pub fn eu_type(self) -> Option<EUType> {
        match self {
            Opcode::ADD |
            Opcode::ADDI |
            Opcode::SUB |
            Opcode::SUBI |
            Opcode::XOR |
            Opcode::AND |
            Opcode::BEQZ |
            Opcode::BNEZ |
            Opcode::BLTZ |
            Opcode::BGTZ |
            Opcode::BLEZ |
            Opcode::BGEZ |
            Opcode::JUMP => Some(EUType::INTEGER),
            Opcode::LW | Opcode::SW | Opcode::LWS | Opcode::SWS => Some(EUType::MEMORY),
            Opcode::ADDS | Opcode::SUBS => Some(EUType::ADDER),
            Opcode::MULT | Opcode::MULTS => Some(EUType::MULTIPLIER),
            Opcode::DIV | Opcode::DIVS => Some(EUType::DIVIDER),
            Opcode::EOP => None,
        }
    }
}

pub fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::LW => "LW",
        Opcode::SW => "SW",
        Opcode::ADD => "ADD",
        Opcode::ADDI => "ADDI",
        Opcode::SUB => "SUB",
        Opcode::SUBI => "SUBI",
        Opcode::XOR => "XOR",
        Opcode::AND => "AND",
        Opcode::MULT => "MULT",
        Opcode::DIV => "DIV",
        Opcode::BEQZ => "BEQZ",
        Opcode::BNEZ => "BNEZ",
        Opcode::BLTZ => "BLTZ",
        Opcode::BGTZ => "BGTZ",
        Opcode::BLEZ => "BLEZ",
        Opcode::BGEZ => "BGEZ",
        Opcode::JUMP => "JUMP",
        Opcode::EOP => "EOP",
        Opcode::LWS => "LWS",
        Opcode::SWS => "SWS",
        Opcode::ADDS => "ADDS",
        Opcode::SUBS => "SUBS",
        Opcode::MULTS => "MULTS",
        Opcode::DIVS => "DIVS",
    }
}

pub fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();

    match string.as_str() {
        "LW" => Some(Opcode::LW),
        "SW" => Some(Opcode::SW),
        "ADD" => Some(Opcode::ADD),
        "ADDI" => Some(Opcode::ADDI),
        "SUB" => Some(Opcode::SUB),
        "SUBI" => Some(Opcode::SUBI),
        "XOR" => Some(Opcode::XOR),
        "AND" => Some(Opcode::AND),
        "MULT" => Some(Opcode::MULT),
        "DIV" => Some(Opcode::DIV),
        "BEQZ" => Some(Opcode::BEQZ),
        "BNEZ" => Some(Opcode::BNEZ),
        "BLTZ" => Some(Opcode::BLTZ),
        "BGTZ" => Some(Opcode::BGTZ),
        "BLEZ" => Some(Opcode::BLEZ),
        "BGEZ" => Some(Opcode::BGEZ),
        "JUMP" => Some(Opcode::JUMP),
        "EOP" => Some(Opcode::EOP),
        "LWS" => Some(Opcode::LWS),
        "SWS" => Some(Opcode::SWS),
        "ADDS" => Some(Opcode::ADDS),
        "SUBS" => Some(Opcode::SUBS),
        "MULTS" => Some(Opcode::MULTS),
        "DIVS" => Some(Opcode::DIVS),
        _ => None,
    }
}

/// Parses `R<n>` or `F<n>`. Returns `None` for anything else, including indexes out of range.
pub fn get_register(name: &str) -> Option<Operand> {
    let name_uppercased = name.to_uppercase();
    if name_uppercased.len() < 2 {
        return None;
    }

    let (kind, index) = name_uppercased.split_at(1);
    let reg: RegisterType = index.parse().ok()?;
    if reg >= NUM_GP_REGISTERS {
        return None;
    }

    match kind {
        "R" => Some(IntReg(reg)),
        "F" => Some(FpReg(reg)),
        _ => None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operand {
    IntReg(RegisterType),
    FpReg(RegisterType),
    // The operand is directly specified in the instruction itself.
    Immediate(WordType),
    Unused,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntReg(reg) => write!(f, "R{}", reg),
            FpReg(reg) => write!(f, "F{}", reg),
            Immediate(val) => write!(f, "{}", *val as i32),
            Unused => write!(f, "-"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instr {
    pub opcode: Opcode,
    pub source: [Operand; MAX_SOURCE_COUNT],
    pub sink: Operand,
    // memory offset for loads/stores, PC-relative byte offset for branches and jumps.
    pub immediate: i32,
    pub loc: Option<SourceLocation>,
}

pub const EOP: Instr = Instr {
    opcode: Opcode::EOP,
    source: [Unused, Unused],
    sink: Unused,
    immediate: 0,
    loc: None,
};

impl Instr {
    pub fn new(opcode: Opcode, source: [Operand; MAX_SOURCE_COUNT], sink: Operand, immediate: i32) -> Instr {
        Instr { opcode, source, sink, immediate, loc: None }
    }

    pub fn class(&self) -> InstrClass {
        self.opcode.class()
    }

    /// The index of the source operand holding the base register of a load or store.
    pub fn base_source_index(&self) -> Option<usize> {
        match self.class() {
            InstrClass::Load => Some(0),
            InstrClass::Store => Some(1),
            InstrClass::IntAlu |
            InstrClass::FpAlu |
            InstrClass::Branch |
            InstrClass::Jump |
            InstrClass::Exit => None,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", mnemonic(self.opcode))?;

        match self.class() {
            InstrClass::IntAlu | InstrClass::FpAlu => {
                write!(f, " {} {} {}", self.sink, self.source[0], self.source[1])?
            }
            InstrClass::Load => write!(f, " {} {}({})", self.sink, self.immediate, self.source[0])?,
            InstrClass::Store => write!(f, " {} {}({})", self.source[0], self.immediate, self.source[1])?,
            InstrClass::Branch => write!(f, " {} {}", self.source[0], self.immediate)?,
            InstrClass::Jump => write!(f, " {}", self.immediate)?,
            InstrClass::Exit => {}
        }

        if let Some(loc) = self.loc {
            write!(f, " ; {}", loc)?;
        }

        Ok(())
    }
}

/// The decoded program image. Instructions are addressed by PC relative to the base address.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub code: Vec<Instr>,
    pub base_address: CodeAddressType,
}

impl Program {
    pub fn new(code: Vec<Instr>, base_address: CodeAddressType) -> Program {
        Program { code, base_address }
    }

    /// Returns the instruction at `pc`. Anything outside the image reads as EOP.
    pub fn get_instr(&self, pc: CodeAddressType) -> Instr {
        match self.to_index(pc) {
            Some(index) => self.code[index],
            None => EOP,
        }
    }

    fn to_index(&self, pc: CodeAddressType) -> Option<usize> {
        let offset = pc.checked_sub(self.base_address)?;
        if offset % INSTR_SIZE != 0 {
            return None;
        }

        let index = (offset / INSTR_SIZE) as usize;
        if index < self.code.len() { Some(index) } else { None }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

// The InstrQueue sits between frontend and backend and holds the PCs of
// fetched but not yet issued instructions.
pub(crate) struct InstrQueue {
    capacity: u16,
    head: u64,
    tail: u64,
    pcs: Vec<CodeAddressType>,
}

impl InstrQueue {
    pub(crate) fn new(capacity: u16) -> Self {
        InstrQueue {
            capacity,
            head: 0,
            tail: 0,
            pcs: vec![0; capacity as usize],
        }
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub(crate) fn is_full(&self) -> bool {
        self.size() == self.capacity
    }

    pub(crate) fn enqueue(&mut self, pc: CodeAddressType) {
        assert!(!self.is_full(), "Can't enqueue when InstrQueue is full.");

        let index = (self.tail % self.capacity as u64) as usize;
        self.pcs[index] = pc;
        self.tail += 1;
    }

    pub(crate) fn dequeue(&mut self) {
        assert!(!self.is_empty(), "Can't dequeue when InstrQueue is empty.");
        self.head += 1;
    }

    pub(crate) fn peek(&self) -> CodeAddressType {
        assert!(!self.is_empty(), "Can't peek when InstrQueue is empty.");

        let index = (self.head % self.capacity as u64) as usize;
        self.pcs[index]
    }

    pub(crate) fn flush(&mut self) {
        self.head = self.tail;
    }
}
