mod array;
mod boxed;
mod class;
mod code;
mod compiled;
mod field;
mod method;
mod pool;
mod spec;

pub use array::{
    array_allocation_size, ElementKind, RawArray, ARRAY_BODY, ARRAY_LENGTH,
};
pub use boxed::{
    DoubleObject, FloatObject, IntObject, LongObject, BOX_VALUE,
};
pub use class::{Class, ClassFlags};
pub use code::{CodeRecord, HandlerEntry, LineEntry};
pub use compiled::{Compiled, NativeHandler, NativeLineNumber};
pub use field::{Field, FieldCode};
pub use method::{Method, MethodCode, MethodFlags};
pub use pool::{ClassPool, PoolEntry};
pub use spec::{parameter_footprint, return_code_of_spec, SpecIterator};

/// Bytes per machine word.
pub const WORD: usize = core::mem::size_of::<usize>();

/// The one-word header of every managed object: a pointer to its class.
#[repr(C)]
pub struct Object {
    pub class: *mut Class,
}

/// A heap string: class word, byte length, then the UTF-8 bytes inline.
#[repr(C)]
pub struct StringObject {
    pub class: *mut Class,
    pub length: usize,
}

impl StringObject {
    pub fn allocation_size(length: usize) -> usize {
        (core::mem::size_of::<StringObject>() + length + WORD - 1)
            & !(WORD - 1)
    }

    /// # Safety
    ///
    /// `this` must point to a live, initialized string object.
    pub unsafe fn bytes<'a>(this: *const StringObject) -> &'a [u8] {
        let base = this.add(1) as *const u8;
        core::slice::from_raw_parts(base, (*this).length)
    }
}

/// A node in a thread's chain of embedder-held object references.
#[repr(C)]
pub struct Reference {
    pub target: *mut Object,
    pub next: *mut Reference,
}
