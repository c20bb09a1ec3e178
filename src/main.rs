use std::num::ParseIntError;
use std::path::PathBuf;
use std::process::exit;

use env_logger::Env;
use log::error;
use structopt::StructOpt;

use tomasulo_cpu_simulator::cpu::{CPU, load_cpu_config};
use tomasulo_cpu_simulator::loader::loader::{load, LoadError};

fn parse_address(src: &str) -> Result<u32, ParseIntError> {
    match src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => src.parse(),
    }
}

#[derive(StructOpt, Debug)]
#[structopt(name = "Tomasulo CPU Simulator")]
struct Opt {
    /// Path of the assembly file to load
    #[structopt(short, long, parse(from_os_str))]
    file: PathBuf,

    /// Sets a custom config file
    #[structopt(short, long, parse(from_os_str), default_value = "cpu.yaml")]
    config: PathBuf,

    /// The address of the first instruction
    #[structopt(short, long, parse(try_from_str = parse_address), default_value = "0")]
    base_address: u32,

    /// The number of cycles to run; 0 runs until the program completes
    #[structopt(short = "n", long, default_value = "0")]
    cycles: u64,

    /// Dumps the data memory from this address on
    #[structopt(long, parse(try_from_str = parse_address))]
    dump_start: Option<u32>,

    /// Dumps the data memory up to (excluding) this address
    #[structopt(long, parse(try_from_str = parse_address))]
    dump_end: Option<u32>,

    /// Prints the reorder buffer and the reservation stations at the end of the run
    #[structopt(long)]
    status: bool,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();

    let cpu_config = match load_cpu_config(&opt.config) {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load {}. Cause: {}", opt.config.display(), err);
            exit(1);
        }
    };

    println!("Loading {}", opt.file.display());
    let program = match load(&opt.file, opt.base_address) {
        Ok(program) => program,
        Err(err) => {
            error!("Loading program '{}' failed.", opt.file.display());
            match err {
                LoadError::AnalysisError(msg_vec) => {
                    for msg in msg_vec {
                        error!("{}", msg);
                    }
                }
                LoadError::ParseError(msg) | LoadError::IOError(msg) => error!("{}", msg),
            }
            exit(1);
        }
    };

    let mut cpu = match CPU::new(&cpu_config) {
        Ok(cpu) => cpu,
        Err(err) => {
            error!("Invalid CPU config: {}", err);
            exit(1);
        }
    };

    if let Err(err) = cpu.load_program(program) {
        error!("{}", err);
        exit(1);
    }

    let run_result = cpu.run(opt.cycles);

    println!("{}", cpu.print_execution_log());
    println!("{}", cpu.print_registers());
    if opt.status {
        println!("{}", cpu.print_rob());
        println!("{}", cpu.print_reservation_stations());
    }
    if let Some(start) = opt.dump_start {
        let end = opt.dump_end.unwrap_or(start.saturating_add(64));
        println!("{}", cpu.dump_memory(start, end));
    }

    println!("Instructions executed: {}", cpu.get_instructions_executed());
    println!("Clock cycles: {}", cpu.get_clock_cycles());
    println!("CPI: {:.2}", cpu.get_cpi());
    println!("IPC: {:.2}", cpu.get_ipc());

    if let Err(err) = run_result {
        error!("Simulation aborted: {}", err);
        exit(1);
    }

    if cpu.is_complete() {
        println!("Program complete!");
    }
}
