pub mod cpu;
pub mod instructions;
pub mod loader;
mod backend;
mod frontend;
mod memory_subsystem;


pub use backend::reorder_buffer::{LogEntry, StageTimes};
