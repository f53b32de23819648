//! Machine bootstrap: the core class set the compiler templates and
//! runtime helpers depend on, plus the programmatic class and method
//! builders used by embedders and tests in place of a class loader.

use object::{
    return_code_of_spec, Class, ClassFlags, ClassPool, ElementKind, Field,
    FieldCode, Method, MethodCode, MethodFlags, Object, PoolEntry,
    RawArray, StringObject, WORD,
};

use crate::Machine;

/// Build a machine with its special classes installed.
pub fn machine() -> Box<Machine> {
    let mut m = Box::new(Machine::new());

    let object = ClassBuilder::new(&m, "java/lang/Object").build();
    m.specials.object = object;

    // array classes next; vtables and static tables are arrays
    m.specials.object_array = ClassBuilder::new(&m, "[Ljava/lang/Object;")
        .extends(object)
        .array_of(ElementKind::Object)
        .build();
    m.specials.boolean_array = ClassBuilder::new(&m, "[Z")
        .extends(object)
        .array_of(ElementKind::Boolean)
        .build();
    m.specials.char_array = ClassBuilder::new(&m, "[C")
        .extends(object)
        .array_of(ElementKind::Char)
        .build();
    m.specials.float_array = ClassBuilder::new(&m, "[F")
        .extends(object)
        .array_of(ElementKind::Float)
        .build();
    m.specials.double_array = ClassBuilder::new(&m, "[D")
        .extends(object)
        .array_of(ElementKind::Double)
        .build();
    m.specials.byte_array = ClassBuilder::new(&m, "[B")
        .extends(object)
        .array_of(ElementKind::Byte)
        .build();
    m.specials.short_array = ClassBuilder::new(&m, "[S")
        .extends(object)
        .array_of(ElementKind::Short)
        .build();
    m.specials.int_array = ClassBuilder::new(&m, "[I")
        .extends(object)
        .array_of(ElementKind::Int)
        .build();
    m.specials.long_array = ClassBuilder::new(&m, "[J")
        .extends(object)
        .array_of(ElementKind::Long)
        .build();

    m.specials.string = ClassBuilder::new(&m, "java/lang/String")
        .extends(object)
        .build();

    m.specials.int_box = ClassBuilder::new(&m, "java/lang/Integer")
        .extends(object)
        .instance_field("value", FieldCode::Int)
        .build();
    m.specials.long_box = ClassBuilder::new(&m, "java/lang/Long")
        .extends(object)
        .instance_field("value", FieldCode::Long)
        .build();
    m.specials.float_box = ClassBuilder::new(&m, "java/lang/Float")
        .extends(object)
        .instance_field("value", FieldCode::Float)
        .build();
    m.specials.double_box = ClassBuilder::new(&m, "java/lang/Double")
        .extends(object)
        .instance_field("value", FieldCode::Double)
        .build();

    let throwable = ClassBuilder::new(&m, "java/lang/Throwable")
        .extends(object)
        .instance_field("message", FieldCode::Object)
        .instance_field("cause", FieldCode::Object)
        .build();
    m.specials.throwable = throwable;

    let exception = ClassBuilder::new(&m, "java/lang/Exception")
        .extends(throwable)
        .build();
    m.specials.exception = exception;

    let runtime_exception =
        ClassBuilder::new(&m, "java/lang/RuntimeException")
            .extends(exception)
            .build();
    m.specials.runtime_exception = runtime_exception;

    m.specials.null_pointer =
        ClassBuilder::new(&m, "java/lang/NullPointerException")
            .extends(runtime_exception)
            .build();
    m.specials.array_index_out_of_bounds =
        ClassBuilder::new(&m, "java/lang/ArrayIndexOutOfBoundsException")
            .extends(runtime_exception)
            .build();
    m.specials.negative_array_size =
        ClassBuilder::new(&m, "java/lang/NegativeArraySizeException")
            .extends(runtime_exception)
            .build();
    m.specials.class_cast =
        ClassBuilder::new(&m, "java/lang/ClassCastException")
            .extends(runtime_exception)
            .build();

    let error = ClassBuilder::new(&m, "java/lang/Error")
        .extends(throwable)
        .build();
    m.specials.error = error;

    m.specials.out_of_memory =
        ClassBuilder::new(&m, "java/lang/OutOfMemoryError")
            .extends(error)
            .build();
    m.specials.unsatisfied_link =
        ClassBuilder::new(&m, "java/lang/UnsatisfiedLinkError")
            .extends(error)
            .build();
    m.specials.in_initializer =
        ClassBuilder::new(&m, "java/lang/ExceptionInInitializerError")
            .extends(error)
            .build();
    m.specials.no_class_def =
        ClassBuilder::new(&m, "java/lang/NoClassDefFoundError")
            .extends(error)
            .build();
    m.specials.no_such_field =
        ClassBuilder::new(&m, "java/lang/NoSuchFieldError")
            .extends(error)
            .build();
    m.specials.no_such_method =
        ClassBuilder::new(&m, "java/lang/NoSuchMethodError")
            .extends(error)
            .build();

    // preallocated so allocation failure can still raise
    let oom = m.allocate(3 * WORD) as *mut Object;
    assert!(!oom.is_null(), "bootstrap allocation failed");
    // SAFETY: freshly allocated instance storage
    unsafe { (*oom).class = m.specials.out_of_memory };
    m.specials.oom_instance = oom;

    m
}

/// Programmatic class construction, standing in for the class loader.
pub struct ClassBuilder<'m> {
    m: &'m Machine,
    name: String,
    super_class: *mut Class,
    element_kind: Option<ElementKind>,
    weak: bool,
    instance_fields: Vec<(String, FieldCode)>,
    static_fields: Vec<(String, FieldCode)>,
    methods: Vec<(String, String, MethodFlags, MethodCode)>,
}

impl<'m> ClassBuilder<'m> {
    pub fn new(m: &'m Machine, name: &str) -> ClassBuilder<'m> {
        ClassBuilder {
            m,
            name: name.to_string(),
            super_class: core::ptr::null_mut(),
            element_kind: None,
            weak: false,
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn extends(mut self, super_class: *mut Class) -> Self {
        self.super_class = super_class;
        self
    }

    pub fn array_of(mut self, kind: ElementKind) -> Self {
        self.element_kind = Some(kind);
        self
    }

    pub fn weak_reference(mut self) -> Self {
        self.weak = true;
        self
    }

    pub fn instance_field(mut self, name: &str, code: FieldCode) -> Self {
        self.instance_fields.push((name.to_string(), code));
        self
    }

    pub fn static_field(mut self, name: &str, code: FieldCode) -> Self {
        self.static_fields.push((name.to_string(), code));
        self
    }

    pub fn method(
        mut self,
        name: &str,
        spec: &str,
        flags: MethodFlags,
        code: MethodCode,
    ) -> Self {
        self.methods
            .push((name.to_string(), spec.to_string(), flags, code));
        self
    }

    pub fn build(self) -> *mut Class {
        let m = self.m;
        let super_size = if self.super_class.is_null() {
            WORD
        } else {
            // SAFETY: superclasses are built first and stay live
            unsafe { (*self.super_class).instance_size }
        };
        let instance_size =
            super_size + self.instance_fields.len() * WORD;

        let mut flags = ClassFlags::empty();
        if self.weak {
            flags |= ClassFlags::WEAK_REFERENCE;
        }

        let class = m.register_class(Box::new(Class {
            vtable: core::ptr::null_mut(),
            super_class: self.super_class,
            flags,
            instance_size,
            static_table: core::ptr::null_mut(),
            initializer: core::ptr::null_mut(),
            element_kind: self.element_kind,
            name: self.name,
            pool: ClassPool::default(),
            methods: Vec::new(),
            fields: Vec::new(),
        }));

        // SAFETY: the class was just registered and stays live; builder
        // runs before any concurrent use
        unsafe {
            let mut offset = super_size;
            for (name, code) in self.instance_fields {
                let field = m.register_field(Box::new(Field {
                    class,
                    code,
                    offset,
                    is_static: false,
                    name,
                }));
                (*class).fields.push(field);
                offset += WORD;
            }
            for (slot, (name, code)) in
                self.static_fields.into_iter().enumerate()
            {
                let field = m.register_field(Box::new(Field {
                    class,
                    code,
                    offset: slot,
                    is_static: true,
                    name,
                }));
                (*class).fields.push(field);
            }
            if !(*class).fields.is_empty()
                && (*class).fields.iter().any(|&f| (*f).is_static)
            {
                let count = (*class)
                    .fields
                    .iter()
                    .filter(|&&f| (*f).is_static)
                    .count();
                (*class).static_table =
                    m.allocate_array(m.specials.object_array, count);
            }

            // vtable: inherit the super's slots, override by name and
            // spec, append the rest
            let mut vtable: Vec<*mut Method> =
                if self.super_class.is_null() {
                    Vec::new()
                } else {
                    let super_vtable = (*self.super_class).vtable;
                    if super_vtable.is_null() {
                        Vec::new()
                    } else {
                        RawArray::words(super_vtable)
                            .iter()
                            .map(|&w| w as *mut Method)
                            .collect()
                    }
                };

            for (name, spec, mut method_flags, code) in self.methods {
                let is_native = matches!(
                    code,
                    MethodCode::NativeName(_)
                        | MethodCode::NativePointer(_)
                );
                if is_native {
                    method_flags |= MethodFlags::NATIVE;
                }
                let entry = if is_native {
                    m.native_invoker_entry()
                } else {
                    m.method_stub_entry()
                };
                let return_code = return_code_of_spec(&spec);
                let method = m.register_method(Box::new(Method {
                    code_entry: entry,
                    pool: core::ptr::null_mut(),
                    class,
                    flags: method_flags,
                    vtable_index: 0,
                    return_code,
                    name,
                    spec,
                    code,
                    compiled: None,
                }));

                if (*method).is_virtual() {
                    let slot = vtable.iter().position(|&v| {
                        (*v).name == (*method).name
                            && (*v).spec == (*method).spec
                    });
                    match slot {
                        Some(index) => {
                            (*method).vtable_index = index;
                            vtable[index] = method;
                        }
                        None => {
                            (*method).vtable_index = vtable.len();
                            vtable.push(method);
                        }
                    }
                }

                if (*method).name == "<clinit>" {
                    (*class).initializer = method;
                    (*class).flags |= ClassFlags::NEED_INIT;
                }
                (*class).methods.push(method);
            }

            if !vtable.is_empty() {
                let array = m
                    .allocate_array(m.specials.object_array, vtable.len());
                assert!(!array.is_null(), "vtable allocation failed");
                for (index, &method) in vtable.iter().enumerate() {
                    RawArray::words_mut(array)[index] = method as usize;
                }
                (*class).vtable = array;
            }
        }

        class
    }
}

// ── constant pool population ───────────────────────────────────────

/// # Safety
///
/// `class` must be live.
pub unsafe fn pool_int(class: *mut Class, v: i32) -> u16 {
    (*class).pool.push(PoolEntry::Int(v))
}

/// # Safety
///
/// `class` must be live.
pub unsafe fn pool_float(class: *mut Class, v: f32) -> u16 {
    (*class).pool.push(PoolEntry::Float(v))
}

/// # Safety
///
/// `class` and `m` must be live.
pub unsafe fn pool_string(
    m: &Machine,
    class: *mut Class,
    s: &str,
) -> u16 {
    let string: *mut StringObject = m.allocate_string(s);
    assert!(!string.is_null(), "string allocation failed");
    (*class).pool.push(PoolEntry::Str(string))
}

/// # Safety
///
/// Both classes must be live.
pub unsafe fn pool_class(class: *mut Class, entry: *mut Class) -> u16 {
    (*class).pool.push(PoolEntry::Class(entry))
}

/// # Safety
///
/// `class` and `field` must be live.
pub unsafe fn pool_field(class: *mut Class, field: *mut Field) -> u16 {
    (*class).pool.push(PoolEntry::Field(field))
}

/// # Safety
///
/// `class` and `method` must be live.
pub unsafe fn pool_method(class: *mut Class, method: *mut Method) -> u16 {
    (*class).pool.push(PoolEntry::Method(method))
}

/// # Safety
///
/// `class` must be live.
pub unsafe fn pool_unresolved(class: *mut Class, name: &str) -> u16 {
    (*class)
        .pool
        .push(PoolEntry::Unresolved(name.to_string()))
}
