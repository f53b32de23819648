use assembler::{pad, ExecutableMemory};

/// A machine-code offset paired with its source line.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct NativeLineNumber {
    pub machine_ip: u32,
    pub line: u32,
}

/// An exception-handler range in machine coordinates. `catch_type` is
/// zero for a catch-all, otherwise one plus the index of the catch class
/// in the method's realized constant pool.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct NativeHandler {
    pub start: u32,
    pub end: u32,
    pub ip: u32,
    pub catch_type: u32,
}

/// The immutable product of compiling one method: machine code, the
/// line-number table and the handler table, laid out contiguously in one
/// mapping with each region padded to word alignment.
///
/// The mapping stays writable because direct call sites inside published
/// code are patched in place; aside from those single-word patches a
/// record is never mutated after construction.
pub struct Compiled {
    mem: ExecutableMemory,
    code_len: u32,
    line_count: u32,
    handler_count: u32,
}

impl Compiled {
    pub fn new(
        code: &[u8],
        lines: &[NativeLineNumber],
        handlers: &[NativeHandler],
    ) -> Option<Box<Compiled>> {
        let line_bytes = core::mem::size_of_val(lines);
        let handler_bytes = core::mem::size_of_val(handlers);
        let total = pad(code.len()) + pad(line_bytes) + pad(handler_bytes);
        let mem = ExecutableMemory::allocate(total)?;

        // SAFETY: the mapping covers all three padded regions
        unsafe {
            let base = mem.as_ptr();
            core::ptr::copy_nonoverlapping(
                code.as_ptr(),
                base,
                code.len(),
            );
            core::ptr::copy_nonoverlapping(
                lines.as_ptr() as *const u8,
                base.add(pad(code.len())),
                line_bytes,
            );
            core::ptr::copy_nonoverlapping(
                handlers.as_ptr() as *const u8,
                base.add(pad(code.len()) + pad(line_bytes)),
                handler_bytes,
            );
        }
        if !mem.make_executable() {
            return None;
        }

        Some(Box::new(Compiled {
            mem,
            code_len: code.len() as u32,
            line_count: lines.len() as u32,
            handler_count: handlers.len() as u32,
        }))
    }

    /// A record holding bare code with empty tables.
    pub fn from_code(code: &[u8]) -> Option<Box<Compiled>> {
        Self::new(code, &[], &[])
    }

    pub fn entry(&self) -> *const u8 {
        self.mem.as_ptr()
    }

    pub fn code_len(&self) -> u32 {
        self.code_len
    }

    pub fn code(&self) -> &[u8] {
        // SAFETY: the first code_len bytes of the mapping are the code
        unsafe {
            core::slice::from_raw_parts(
                self.mem.as_ptr(),
                self.code_len as usize,
            )
        }
    }

    /// Byte offset of `address` inside the code region, if it lies there.
    pub fn ip_of(&self, address: *const u8) -> Option<u32> {
        let base = self.mem.as_ptr() as usize;
        let addr = address as usize;
        if addr >= base && addr <= base + self.code_len as usize {
            Some((addr - base) as u32)
        } else {
            None
        }
    }

    pub fn line_numbers(&self) -> &[NativeLineNumber] {
        // SAFETY: the region was written in new() at this offset
        unsafe {
            core::slice::from_raw_parts(
                self.mem.as_ptr().add(pad(self.code_len as usize))
                    as *const NativeLineNumber,
                self.line_count as usize,
            )
        }
    }

    pub fn handlers(&self) -> &[NativeHandler] {
        let line_bytes = self.line_count as usize
            * core::mem::size_of::<NativeLineNumber>();
        // SAFETY: the region was written in new() at this offset
        unsafe {
            core::slice::from_raw_parts(
                self.mem
                    .as_ptr()
                    .add(pad(self.code_len as usize) + pad(line_bytes))
                    as *const NativeHandler,
                self.handler_count as usize,
            )
        }
    }
}
