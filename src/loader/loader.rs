use std::collections::HashMap;
use std::fs;
use std::path::Path;

use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;
use regex::Regex;
use thiserror::Error;

use crate::instructions::instructions::{CodeAddressType, EOP, get_opcode, get_register, Instr, INSTR_SIZE, InstrClass, Opcode, Operand, Program, SourceLocation, WordType};
use crate::instructions::instructions::Operand::{FpReg, Immediate, IntReg, Unused};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{0}")]
    IOError(String),
    #[error("{0}")]
    ParseError(String),
    #[error("{}", .0.join("\n"))]
    AnalysisError(Vec<String>),
}

#[derive(Parser)]
#[grammar = "loader/assembly.pest"]
struct AssemblyParser;

struct Loader {
    base_address: CodeAddressType,
    code: Vec<Instr>,
    labels: HashMap<String, usize>,
    instr_cnt: usize,
    errors: Vec<String>,
    register_name_regex: Regex,
}

#[derive(Clone, Copy, PartialEq)]
enum RegKind {
    Int,
    Fp,
}

impl Loader {
    fn new(base_address: CodeAddressType) -> Loader {
        Loader {
            base_address,
            code: Vec::new(),
            labels: HashMap::new(),
            instr_cnt: 0,
            errors: Vec::new(),
            register_name_regex: Regex::new(r"^(?i)[RF]\d+$").expect("register name regex"),
        }
    }

    fn load(mut self, input: &str) -> Result<Program, LoadError> {
        let parsed = AssemblyParser::parse(Rule::file, input)
            .map_err(|err| LoadError::ParseError(format!("Parsing error: {}", err)))?;

        // first pass collects the labels, the second one builds the instructions.
        self.first_pass(parsed.clone());
        self.second_pass(parsed)?;

        if !self.errors.is_empty() {
            return Err(LoadError::AnalysisError(self.errors));
        }

        Ok(Program::new(self.code, self.base_address))
    }

    fn first_pass(&mut self, root: Pairs<Rule>) {
        for pair in root.flat_map(|file| file.into_inner()) {
            match pair.as_rule() {
                Rule::label => self.parse_label(pair),
                Rule::instr => self.instr_cnt += 1,
                _ => {}
            }
        }
    }

    fn second_pass(&mut self, root: Pairs<Rule>) -> Result<(), LoadError> {
        for pair in root.flat_map(|file| file.into_inner()) {
            if pair.as_rule() == Rule::instr {
                self.parse_instr(pair)?;
            }
        }
        Ok(())
    }

    fn parse_label(&mut self, pair: Pair<Rule>) {
        let loc = location(&pair);
        let label = pair.as_str().trim_end_matches(':').to_string();

        if self.register_name_regex.is_match(&label) || get_opcode(&label).is_some() {
            self.errors.push(format!("Illegal label name '{}' at {}", label, loc));
        } else if self.labels.insert(label.clone(), self.instr_cnt).is_some() {
            self.errors.push(format!("Duplicate label '{}' at {}", label, loc));
        }
    }

    fn parse_instr(&mut self, pair: Pair<Rule>) -> Result<(), LoadError> {
        let loc = location(&pair);
        let mut inner_pairs = pair.into_inner();

        let mnemonic = inner_pairs.next().map(|pair| pair.as_str()).unwrap_or_default();
        let opcode = match get_opcode(mnemonic) {
            Some(opcode) => opcode,
            None => return Err(LoadError::ParseError(format!("Unknown mnemonic '{}' at {}", mnemonic, loc))),
        };

        let operands: Vec<Pair<Rule>> = inner_pairs.collect();
        let mut instr = self.create_instr(opcode, &operands, loc)?;
        instr.loc = Some(loc);
        self.code.push(instr);
        Ok(())
    }

    fn create_instr(&mut self, opcode: Opcode, operands: &[Pair<Rule>], loc: SourceLocation) -> Result<Instr, LoadError> {
        let expected = match opcode.class() {
            InstrClass::IntAlu | InstrClass::FpAlu => 3,
            InstrClass::Load | InstrClass::Store | InstrClass::Branch => 2,
            InstrClass::Jump => 1,
            InstrClass::Exit => 0,
        };
        if operands.len() != expected {
            return Err(LoadError::ParseError(format!(
                "{:?} expects {} operands but got {} at {}", opcode, expected, operands.len(), loc)));
        }

        let data_kind = match opcode {
            Opcode::LWS | Opcode::SWS | Opcode::ADDS | Opcode::SUBS | Opcode::MULTS | Opcode::DIVS => RegKind::Fp,
            _ => RegKind::Int,
        };

        let instr = match opcode.class() {
            InstrClass::IntAlu | InstrClass::FpAlu => {
                let sink = parse_register(&operands[0], data_kind)?;
                let src1 = parse_register(&operands[1], data_kind)?;
                match opcode {
                    Opcode::ADDI | Opcode::SUBI => {
                        let immediate = parse_immediate_operand(&operands[2])?;
                        Instr::new(opcode, [src1, Immediate(immediate as WordType)], sink, immediate)
                    }
                    _ => {
                        let src2 = parse_register(&operands[2], data_kind)?;
                        Instr::new(opcode, [src1, src2], sink, 0)
                    }
                }
            }
            InstrClass::Load => {
                let sink = parse_register(&operands[0], data_kind)?;
                let (offset, base) = parse_memory_access(&operands[1])?;
                Instr::new(opcode, [base, Unused], sink, offset)
            }
            InstrClass::Store => {
                let value = parse_register(&operands[0], data_kind)?;
                let (offset, base) = parse_memory_access(&operands[1])?;
                Instr::new(opcode, [value, base], Unused, offset)
            }
            InstrClass::Branch => {
                let cond = parse_register(&operands[0], RegKind::Int)?;
                let offset = self.parse_target(&operands[1])?;
                Instr::new(opcode, [cond, Unused], Unused, offset)
            }
            InstrClass::Jump => {
                let offset = self.parse_target(&operands[0])?;
                Instr::new(opcode, [Unused, Unused], Unused, offset)
            }
            InstrClass::Exit => EOP,
        };
        Ok(instr)
    }

    // Either a label, as a byte offset relative to the next instruction, or a literal byte offset.
    fn parse_target(&mut self, pair: &Pair<Rule>) -> Result<i32, LoadError> {
        let loc = location(pair);
        match pair.as_rule() {
            Rule::immediate => parse_immediate(pair.as_str(), loc),
            Rule::label_name => match self.labels.get(pair.as_str()) {
                Some(&target_index) => {
                    let delta = target_index as i64 - self.code.len() as i64 - 1;
                    Ok((delta * INSTR_SIZE as i64) as i32)
                }
                None => {
                    self.errors.push(format!("Unknown label '{}' at {}", pair.as_str(), loc));
                    Ok(0)
                }
            },
            _ => Err(LoadError::ParseError(format!("Illegal branch target '{}' at {}", pair.as_str(), loc))),
        }
    }
}

fn location(pair: &Pair<Rule>) -> SourceLocation {
    let (line, column) = pair.as_span().start_pos().line_col();
    SourceLocation { line, column }
}

fn parse_register(pair: &Pair<Rule>, kind: RegKind) -> Result<Operand, LoadError> {
    let register = if pair.as_rule() == Rule::register { get_register(pair.as_str()) } else { None };
    match (register, kind) {
        (Some(reg @ IntReg(_)), RegKind::Int) | (Some(reg @ FpReg(_)), RegKind::Fp) => Ok(reg),
        _ => {
            let expected = if kind == RegKind::Int { "an integer register" } else { "a floating point register" };
            Err(LoadError::ParseError(format!("Expected {} but found '{}' at {}", expected, pair.as_str(), location(pair))))
        }
    }
}

fn parse_immediate_operand(pair: &Pair<Rule>) -> Result<i32, LoadError> {
    if pair.as_rule() != Rule::immediate {
        return Err(LoadError::ParseError(format!("Expected an immediate but found '{}' at {}", pair.as_str(), location(pair))));
    }
    parse_immediate(pair.as_str(), location(pair))
}

// `imm(Rn)`; a missing offset means 0.
fn parse_memory_access(pair: &Pair<Rule>) -> Result<(i32, Operand), LoadError> {
    if pair.as_rule() != Rule::memory_access {
        return Err(LoadError::ParseError(format!("Illegal memory operand '{}' at {}", pair.as_str(), location(pair))));
    }

    let mut offset = 0;
    let mut base = Unused;
    for inner_pair in pair.clone().into_inner() {
        match inner_pair.as_rule() {
            Rule::immediate => offset = parse_immediate(inner_pair.as_str(), location(&inner_pair))?,
            _ => base = parse_register(&inner_pair, RegKind::Int)?,
        }
    }
    Ok((offset, base))
}

/// Parses an integer the way C's `strtoul(s, NULL, 0)` does: `0x` prefix for hex, a leading
/// zero for octal, decimal otherwise. A sign is allowed.
fn parse_immediate(operand: &str, loc: SourceLocation) -> Result<i32, LoadError> {
    let (negative, digits) = match operand.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, operand.strip_prefix('+').unwrap_or(operand)),
    };

    let parsed = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if digits.len() > 1 && digits.starts_with('0') {
        u32::from_str_radix(&digits[1..], 8)
    } else {
        digits.parse::<u32>()
    };

    match parsed {
        Ok(value) => {
            let value = value as i32;
            Ok(if negative { value.wrapping_neg() } else { value })
        }
        Err(_) => Err(LoadError::ParseError(format!("Illegal immediate '{}' at {}", operand, loc))),
    }
}

pub fn load<P: AsRef<Path>>(path: P, base_address: CodeAddressType) -> Result<Program, LoadError> {
    let path = path.as_ref();
    let input = fs::read_to_string(path)
        .map_err(|err| LoadError::IOError(format!("Failed to read '{}': {}", path.display(), err)))?;
    load_from_string(&input, base_address)
}

pub fn load_from_string(input: &str, base_address: CodeAddressType) -> Result<Program, LoadError> {
    Loader::new(base_address).load(input)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;

    fn opcodes(program: &Program) -> Vec<Opcode> {
        program.code.iter().map(|instr| instr.opcode).collect()
    }

    #[test]
    fn test_arithmetic() {
        let program = load_from_string("ADD R1 R2 R3\nADDI R4, R5, -7\nMULTS F1 F2 F3\n", 0).unwrap();

        assert_eq!(program.code[0].source, [IntReg(2), IntReg(3)]);
        assert_eq!(program.code[0].sink, IntReg(1));
        assert_eq!(program.code[1].source, [IntReg(5), Immediate(-7i32 as WordType)]);
        assert_eq!(program.code[1].immediate, -7);
        assert_eq!(program.code[2].sink, FpReg(1));
        assert_eq!(program.code[2].loc, Some(SourceLocation { line: 3, column: 1 }));
    }

    #[test]
    fn test_memory_operands() {
        let program = load_from_string("LW R1 8(R2)\nSWS F3 0x10(R4)\nLW R5 (R6)\nSW R1 -4(R2)", 0).unwrap();

        assert_eq!(opcodes(&program), vec![Opcode::LW, Opcode::SWS, Opcode::LW, Opcode::SW]);
        assert_eq!(program.code[0].source[0], IntReg(2));
        assert_eq!(program.code[0].immediate, 8);
        assert_eq!(program.code[1].source, [FpReg(3), IntReg(4)]);
        assert_eq!(program.code[1].immediate, 16);
        assert_eq!(program.code[2].immediate, 0);
        assert_eq!(program.code[3].immediate, -4);
    }

    #[test]
    fn test_labels_resolve_to_byte_offsets() {
        let src = "\
loop:   SUBI R1 R1 1      ; count down
        BNEZ R1 loop
        JUMP end
        ADD R2 R2 R2
end:    EOP
";
        let program = load_from_string(src, 0x100).unwrap();

        assert_eq!(program.base_address, 0x100);
        assert_eq!(program.code[1].immediate, -8);
        assert_eq!(program.code[2].immediate, 4);
        assert_eq!(program.code[4].opcode, Opcode::EOP);
    }

    #[test]
    fn test_label_on_its_own_line() {
        let program = load_from_string("JUMP target\ntarget:\nEOP\n", 0).unwrap();
        assert_eq!(program.code[0].immediate, 0);
        assert_eq!(program.len(), 2);
    }

    #[test]
    fn test_immediate_bases() {
        let loc = SourceLocation { line: 1, column: 1 };
        assert_eq!(parse_immediate("0x1F", loc).unwrap(), 31);
        assert_eq!(parse_immediate("010", loc).unwrap(), 8);
        assert_eq!(parse_immediate("0", loc).unwrap(), 0);
        assert_eq!(parse_immediate("-12", loc).unwrap(), -12);
        assert!(parse_immediate("12a", loc).is_err());
    }

    #[test]
    fn test_unknown_mnemonic() {
        match load_from_string("ADD R1 R2 R3\nFOO R1\n", 0) {
            Err(LoadError::ParseError(msg)) => assert!(msg.contains("FOO") && msg.contains("2:1"), "{}", msg),
            _ => panic!("expected a parse error"),
        }
    }

    #[test]
    fn test_wrong_register_kind() {
        assert!(matches!(load_from_string("ADDS F1 R2 F3", 0), Err(LoadError::ParseError(_))));
        assert!(matches!(load_from_string("ADD R1 R2 R32", 0), Err(LoadError::ParseError(_))));
        assert!(matches!(load_from_string("LW R1 R2", 0), Err(LoadError::ParseError(_))));
        assert!(matches!(load_from_string("ADD R1 R2", 0), Err(LoadError::ParseError(_))));
    }

    #[test]
    fn test_label_errors_are_collected() {
        let src = "a: EOP\na: EOP\nJUMP nowhere\n";
        match load_from_string(src, 0) {
            Err(LoadError::AnalysisError(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("Duplicate label 'a'"));
                assert!(errors[1].contains("Unknown label 'nowhere'"));
            }
            _ => panic!("expected an analysis error"),
        }
    }

    #[test]
    fn test_label_named_like_register_or_mnemonic() {
        match load_from_string("R1: EOP\nadd: EOP\n", 0) {
            Err(LoadError::AnalysisError(errors)) => {
                assert_eq!(errors, vec![
                    "Illegal label name 'R1' at 1:1".to_string(),
                    "Illegal label name 'add' at 2:1".to_string(),
                ]);
            }
            _ => panic!("expected an analysis error"),
        }
    }

    #[test]
    fn test_syntax_error() {
        match load_from_string("ADD R1 R2 R3\nADD R1 R2 $R3\n", 0) {
            Err(LoadError::ParseError(msg)) => assert!(msg.contains("2:"), "{}", msg),
            _ => panic!("expected a parse error"),
        }
    }

    #[test]
    fn test_branch_to_register_is_rejected() {
        assert!(matches!(load_from_string("BNEZ R1 R2\n", 0), Err(LoadError::ParseError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ADDI R1 R0 5").unwrap();
        writeln!(file, "EOP").unwrap();

        let program = load(file.path(), 0).unwrap();
        assert_eq!(opcodes(&program), vec![Opcode::ADDI, Opcode::EOP]);
        assert!(matches!(load("no/such/file.asm", 0), Err(LoadError::IOError(_))));
    }
}
