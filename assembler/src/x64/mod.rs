mod asm;

pub use asm::{Assembler, AssemblerError, Cond, Label, Reg, WORD};
