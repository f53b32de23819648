use bitflags::bitflags;

use crate::{ClassPool, ElementKind, Field, Method, RawArray};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u32 {
        /// The class has a pending static initializer.
        const NEED_INIT = 1 << 0;
        /// The initializer is running on some thread.
        const IN_INIT = 1 << 1;
        /// Instances are weak references.
        const WEAK_REFERENCE = 1 << 2;
    }
}

/// Runtime class metadata.
///
/// The virtual table pointer leads the struct because compiled virtual
/// dispatch reads it through a fixed displacement from the class pointer
/// found in an instance header.
#[repr(C)]
pub struct Class {
    /// Array of `*mut Method`, indexed by vtable slot.
    pub vtable: *mut RawArray,
    pub super_class: *mut Class,
    pub flags: ClassFlags,
    /// Instance size in bytes, including the class-pointer header.
    pub instance_size: usize,
    /// Boxed or reference slots for static fields, one per slot index.
    pub static_table: *mut RawArray,
    /// The `<clinit>` method, null if none.
    pub initializer: *mut Method,
    /// Element storage class when this is an array class.
    pub element_kind: Option<ElementKind>,
    pub name: String,
    /// Symbolic constant pool shared by this class's method bytecode.
    pub pool: ClassPool,
    pub methods: Vec<*mut Method>,
    pub fields: Vec<*mut Field>,
}

impl Class {
    /// Walk the superclass chain; `sub` is assignable to `self` when
    /// `self` appears on it.
    ///
    /// # Safety
    ///
    /// Every class on the chain must be live.
    pub unsafe fn is_assignable_from(this: *mut Class, sub: *mut Class) -> bool {
        let mut c = sub;
        while !c.is_null() {
            if c == this {
                return true;
            }
            c = (*c).super_class;
        }
        false
    }

    /// # Safety
    ///
    /// `this` and all fields must be live.
    pub unsafe fn find_field(
        this: *mut Class,
        name: &str,
    ) -> Option<*mut Field> {
        let mut c = this;
        while !c.is_null() {
            for &f in &(*c).fields {
                if (*f).name == name {
                    return Some(f);
                }
            }
            c = (*c).super_class;
        }
        None
    }

    /// # Safety
    ///
    /// `this` and all methods must be live.
    pub unsafe fn find_method(
        this: *mut Class,
        name: &str,
        spec: &str,
    ) -> Option<*mut Method> {
        let mut c = this;
        while !c.is_null() {
            for &m in &(*c).methods {
                if (*m).name == name && (*m).spec == spec {
                    return Some(m);
                }
            }
            c = (*c).super_class;
        }
        None
    }
}
