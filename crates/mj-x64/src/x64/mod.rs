//! The x86-64 machine model: registers, operands and instructions.

mod display;
mod instruction;
mod reg;

pub use instruction::{AddrMode, Instr, InstrKind, Operand, Role};
pub use reg::{Reg, RegRef, VirtReg, VirtRegSupply, Width};
