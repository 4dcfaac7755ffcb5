//! Torque DSO decompiler in Rust

/// Little-endian byte reader
pub mod bytes;
/// Code buffer with jump-safe marker insertion
pub mod code;
/// Bytecode-to-source reconstruction engine
pub mod decompile;
/// DSO container definitions
pub mod dso;
mod emit;
/// Opcode tables and the per-version adapter
pub mod opcode;

pub use self::decompile::{decompile, decompile_to_string};
pub use self::dso::Dso;
pub use self::opcode::{CallType, Opcode};
