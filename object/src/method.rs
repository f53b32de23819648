use bitflags::bitflags;

use crate::code::CodeRecord;
use crate::compiled::Compiled;
use crate::{parameter_footprint, Class, FieldCode, RawArray, WORD};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u32 {
        const STATIC = 1 << 0;
        const NATIVE = 1 << 1;
        const PRIVATE = 1 << 2;
        const FINAL = 1 << 3;
    }
}

/// The three states of a method's code: bytecode awaiting compilation, an
/// unresolved host symbol name, or a resolved host function pointer.
pub enum MethodCode {
    None,
    Bytecode(CodeRecord),
    NativeName(Vec<u8>),
    NativePointer(*const core::ffi::c_void),
}

/// Runtime method metadata.
///
/// `code_entry` and `pool` lead the struct: emitted code reads the entry
/// through the frame's method slot, and the pool register reload
/// dereferences the pool pointer the same way. Both are only ever
/// republished under the class lock, with a plain store being sufficient
/// because stale readers go through the stub, which re-reads.
#[repr(C)]
pub struct Method {
    /// Entry address of the current code: the shared method stub until
    /// first compilation, the native invoker for native methods, then the
    /// compiled body.
    pub code_entry: *const u8,
    /// The realized constant-pool array, null until first compilation.
    pub pool: *mut RawArray,
    pub class: *mut Class,
    pub flags: MethodFlags,
    /// Slot in the declaring class's virtual table.
    pub vtable_index: usize,
    pub return_code: FieldCode,
    pub name: String,
    pub spec: String,
    pub code: MethodCode,
    /// Owning pointer to the compiled record, kept for the VM's lifetime.
    pub compiled: Option<Box<Compiled>>,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    /// Whether calls dispatch through the virtual table rather than a
    /// patchable direct call site.
    pub fn is_virtual(&self) -> bool {
        !self.flags.contains(MethodFlags::STATIC)
            && !self.flags.contains(MethodFlags::PRIVATE)
            && self.name != "<init>"
    }

    /// Argument slots on entry, receiver included.
    pub fn parameter_footprint(&self) -> usize {
        parameter_footprint(&self.spec, self.is_static())
    }

    pub fn parameter_footprint_bytes(&self) -> usize {
        self.parameter_footprint() * WORD
    }
}
