mod buffer;
mod mem;
mod x64;

pub use buffer::Buffer;
pub use mem::{
    map_memory, protect_memory_read_write_exec, unmap_memory,
    ExecutableMemory, OS_PAGE_SIZE,
};
pub use x64::{Assembler, AssemblerError, Cond, Label, Reg, WORD};

/// Round `v` up to the next multiple of the machine word size.
#[inline]
pub const fn pad(v: usize) -> usize {
    (v + WORD - 1) & !(WORD - 1)
}
