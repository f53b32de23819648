use std::sync::atomic::Ordering;

use object::{
    Class, ClassFlags, ClassPool, Field, Method, Object, PoolEntry,
    RawArray, StringObject,
};

use crate::unwind::unwind;
use crate::{bridge, compile, thunks, Machine, Thread};

/// Marker for a failure that has already been recorded as the thread's
/// pending exception.
pub struct Pending;

pub(crate) unsafe fn machine<'a>(t: *mut Thread) -> &'a Machine {
    &*(*t).machine
}

// ── exceptions ─────────────────────────────────────────────────────

/// Allocate an instance of `class` with `message`, without raising it.
///
/// # Safety
///
/// `t` and `class` must be live.
pub unsafe fn make_throwable(
    t: *mut Thread,
    class: *mut Class,
    message: Option<&str>,
) -> *mut Object {
    let m = machine(t);
    let obj = m.allocate((*class).instance_size) as *mut Object;
    if obj.is_null() {
        return m.specials.oom_instance;
    }
    (*obj).class = class;
    if let Some(text) = message {
        let s = m.allocate_string(text);
        if !s.is_null() {
            // message slot is the first field of the throwable layout
            *(obj as *mut usize).add(1) = s as usize;
        }
    }
    obj
}

/// Record `class` as the thread's pending exception.
///
/// # Safety
///
/// `t` and `class` must be live.
pub unsafe fn set_pending(
    t: *mut Thread,
    class: *mut Class,
    message: Option<&str>,
) {
    (*t).exception = make_throwable(t, class, message);
}

/// The message string of a throwable, if any.
///
/// # Safety
///
/// `obj` must be a live throwable instance.
pub unsafe fn throwable_message(obj: *mut Object) -> Option<String> {
    if obj.is_null() {
        return None;
    }
    let slot = *(obj as *const usize).add(1) as *mut StringObject;
    if slot.is_null() {
        return None;
    }
    Some(String::from_utf8_lossy(StringObject::bytes(slot)).into_owned())
}

/// Raise a fresh instance of `class` on the current thread.
///
/// # Safety
///
/// Called from emitted code with a live thread and class.
pub unsafe extern "C" fn throw_new(t: *mut Thread, class: *mut Class) -> ! {
    (*t).exception = make_throwable(t, class, None);
    unwind(t)
}

/// Raise `obj`, substituting a NullPointerException when it is null.
///
/// # Safety
///
/// Called from emitted code with a live thread.
pub unsafe extern "C" fn throw_(t: *mut Thread, obj: *mut Object) -> ! {
    if !obj.is_null() {
        (*t).exception = obj;
    } else {
        (*t).exception =
            make_throwable(t, machine(t).specials.null_pointer, None);
    }
    unwind(t)
}

// ── allocation helpers ─────────────────────────────────────────────

/// Allocate a zeroed instance of `class`.
///
/// # Safety
///
/// Called from emitted code with a live thread and class.
pub unsafe extern "C" fn make_new(
    t: *mut Thread,
    class: *mut Class,
) -> *mut Object {
    let m = machine(t);
    let obj = m.allocate((*class).instance_size) as *mut Object;
    if obj.is_null() {
        (*t).exception = m.specials.oom_instance;
        unwind(t);
    }
    (*obj).class = class;
    obj
}

/// Allocate an instance of a weak-reference class. The referent slot is
/// the collector's concern; allocation is the same as `make_new`.
///
/// # Safety
///
/// Called from emitted code with a live thread and class.
pub unsafe extern "C" fn make_new_weak_reference(
    t: *mut Thread,
    class: *mut Class,
) -> *mut Object {
    make_new(t, class)
}

pub type ArrayConstructor =
    unsafe extern "C" fn(*mut Thread, usize, bool) -> *mut RawArray;

macro_rules! array_constructor {
    ($name:ident, $special:ident) => {
        /// Allocate a zeroed primitive array.
        ///
        /// # Safety
        ///
        /// `t` must be live.
        pub unsafe extern "C" fn $name(
            t: *mut Thread,
            length: usize,
            _clear: bool,
        ) -> *mut RawArray {
            let m = machine(t);
            m.allocate_array(m.specials.$special, length)
        }
    };
}

array_constructor!(make_boolean_array, boolean_array);
array_constructor!(make_char_array, char_array);
array_constructor!(make_float_array, float_array);
array_constructor!(make_double_array, double_array);
array_constructor!(make_byte_array, byte_array);
array_constructor!(make_short_array, short_array);
array_constructor!(make_int_array, int_array);
array_constructor!(make_long_array, long_array);

/// Allocate an array through the constructor the template selected for
/// the element type.
///
/// # Safety
///
/// Called from emitted code; `constructor` is one of the typed array
/// constructors above.
pub unsafe extern "C" fn make_blank_array(
    t: *mut Thread,
    constructor: ArrayConstructor,
    length: isize,
) -> *mut Object {
    debug_assert!(length >= 0);
    let arr = constructor(t, length as usize, true);
    if arr.is_null() {
        (*t).exception = machine(t).specials.oom_instance;
        unwind(t);
    }
    arr as *mut Object
}

/// Allocate a zeroed array of references.
///
/// # Safety
///
/// Called from emitted code with a live thread and element class.
pub unsafe extern "C" fn make_blank_object_array(
    t: *mut Thread,
    _element_class: *mut Class,
    length: isize,
) -> *mut Object {
    debug_assert!(length >= 0);
    let m = machine(t);
    let arr = m.allocate_array(m.specials.object_array, length as usize);
    if arr.is_null() {
        (*t).exception = m.specials.oom_instance;
        unwind(t);
    }
    arr as *mut Object
}

/// Superclass-chain subtyping test; returns 1 when `b` is assignable to
/// `a`.
///
/// # Safety
///
/// Called from emitted code with live classes.
pub unsafe extern "C" fn is_assignable_from(
    _t: *mut Thread,
    a: *mut Class,
    b: *mut Class,
) -> usize {
    Class::is_assignable_from(a, b) as usize
}

// ── resolution ─────────────────────────────────────────────────────

/// # Safety
///
/// `t` must be live; `pool` must outlive the call.
pub unsafe fn resolve_class(
    t: *mut Thread,
    pool: &ClassPool,
    index: u16,
) -> Result<*mut Class, Pending> {
    match pool.get(index) {
        Some(PoolEntry::Class(c)) => Ok(*c),
        Some(PoolEntry::Unresolved(name)) => {
            set_pending(t, machine(t).specials.no_class_def, Some(name));
            Err(Pending)
        }
        _ => panic!("pool entry {index} is not a class"),
    }
}

/// # Safety
///
/// `t` must be live; `pool` must outlive the call.
pub unsafe fn resolve_field(
    t: *mut Thread,
    pool: &ClassPool,
    index: u16,
) -> Result<*mut Field, Pending> {
    match pool.get(index) {
        Some(PoolEntry::Field(f)) => Ok(*f),
        Some(PoolEntry::Unresolved(name)) => {
            set_pending(t, machine(t).specials.no_such_field, Some(name));
            Err(Pending)
        }
        _ => panic!("pool entry {index} is not a field"),
    }
}

/// # Safety
///
/// `t` must be live; `pool` must outlive the call.
pub unsafe fn resolve_method(
    t: *mut Thread,
    pool: &ClassPool,
    index: u16,
) -> Result<*mut Method, Pending> {
    match pool.get(index) {
        Some(PoolEntry::Method(m)) => Ok(*m),
        Some(PoolEntry::Unresolved(name)) => {
            set_pending(t, machine(t).specials.no_such_method, Some(name));
            Err(Pending)
        }
        _ => panic!("pool entry {index} is not a method"),
    }
}

/// Look a method up by name and spec across a class's hierarchy.
///
/// # Safety
///
/// `t` and `class` must be live.
pub unsafe fn resolve_method_by_name(
    t: *mut Thread,
    class: *mut Class,
    name: &str,
    spec: &str,
) -> Result<*mut Method, Pending> {
    match Class::find_method(class, name, spec) {
        Some(m) => Ok(m),
        None => {
            set_pending(
                t,
                machine(t).specials.no_such_method,
                Some(&format!("{}.{}{}", (*class).name, name, spec)),
            );
            Err(Pending)
        }
    }
}

// ── class initialization ───────────────────────────────────────────

/// Run `class`'s static initializer exactly once, under the class lock.
/// A throwing initializer is wrapped as ExceptionInInitializerError and
/// left pending.
///
/// # Safety
///
/// `t` and `class` must be live.
pub unsafe fn init_class(t: *mut Thread, class: *mut Class) {
    let m = machine(t);
    let _guard = m.class_lock.lock();
    if (*class).flags.contains(ClassFlags::NEED_INIT)
        && !(*class).flags.contains(ClassFlags::IN_INIT)
    {
        (*class).flags |= ClassFlags::IN_INIT;
        let initializer = (*class).initializer;
        if !initializer.is_null() {
            tracing::debug!(class = %(*class).name, "running initializer");
            let mut list = bridge::ArgumentList::new_empty(t);
            bridge::invoke(t, initializer, &mut list);
            if !(*t).exception.is_null() {
                let cause = (*t).exception;
                let wrapped =
                    make_throwable(t, m.specials.in_initializer, None);
                // cause slot is the second field of the throwable layout
                *(wrapped as *mut usize).add(2) = cause as usize;
                (*t).exception = wrapped;
            }
        }
        (*class).flags &= !(ClassFlags::NEED_INIT | ClassFlags::IN_INIT);
    }
}

// ── lazy compilation ───────────────────────────────────────────────

/// Compile `method` if it is still the stub, under the class lock.
/// Racing threads observe either the stub (and recompile idempotently
/// behind the lock) or the published entry.
///
/// # Safety
///
/// `t` and `method` must be live.
pub unsafe fn compile_method2(t: *mut Thread, method: *mut Method) {
    let m = machine(t);
    let stub = m.method_stub_entry();
    if (*method).code_entry != stub {
        return;
    }
    let _guard = m.class_lock.lock();
    if (*method).code_entry != stub {
        return;
    }

    let _span = tracing::span!(
        tracing::Level::DEBUG,
        "compile",
        method = %format!("{}.{}", (*(*method).class).name, (*method).name)
    )
    .entered();

    let mut c = compile::Compiler::new(t);
    if c.compile(method).is_err() {
        debug_assert!(!(*t).exception.is_null());
        return;
    }
    match c.finish() {
        Ok((compiled, pool_words)) => {
            // realize the constant pool before publishing the entry
            let pool = m.allocate_array(
                m.specials.object_array,
                pool_words.len(),
            );
            if pool.is_null() {
                (*t).exception = m.specials.oom_instance;
                return;
            }
            RawArray::words_mut(pool).copy_from_slice(&pool_words);
            (*method).pool = pool;
            let entry = compiled.entry();
            (*method).compiled = Some(compiled);
            (*method).code_entry = entry;
            tracing::debug!(
                entry = ?entry,
                len = (*method).compiled.as_ref().map(|c| c.code_len()),
                "compiled"
            );
        }
        Err(compile::CompileError::Pending) => {}
        Err(_) => {
            (*t).exception = m.specials.oom_instance;
        }
    }
}

/// The stub's target: compile, then rewrite the caller's direct call
/// site to the fresh entry.
///
/// # Safety
///
/// Called from the method stub with a live thread and method.
pub unsafe extern "C" fn compile_method(t: *mut Thread, method: *mut Method) {
    let m = machine(t);
    m.stub_calls.fetch_add(1, Ordering::Relaxed);

    compile_method2(t, method);

    if !(*t).exception.is_null() {
        unwind(t);
    }
    if !(*method).is_virtual() {
        thunks::update_caller(t, method);
    }
}

// ── native symbol resolution ───────────────────────────────────────

#[cfg(target_family = "unix")]
mod dl {
    use core::ffi::c_void;

    pub const RTLD_DEFAULT: *mut c_void = core::ptr::null_mut();
    pub const RTLD_LAZY: i32 = 1;

    extern "C" {
        pub fn dlopen(filename: *const i8, flag: i32) -> *mut c_void;
        pub fn dlsym(handle: *mut c_void, symbol: *const i8) -> *mut c_void;
    }

}

/// Resolve a native method's symbol against the loaded libraries, then
/// the process image.
///
/// # Safety
///
/// `t` must be live; `name` must be a symbol name without interior NUL.
pub unsafe fn resolve_native_method(
    t: *mut Thread,
    name: &[u8],
) -> Option<*const core::ffi::c_void> {
    let mut symbol = Vec::with_capacity(name.len() + 1);
    symbol.extend_from_slice(name);
    symbol.push(0);

    let mut found: *mut core::ffi::c_void = core::ptr::null_mut();
    machine(t).each_native_library(&mut |lib| {
        let p = dl::dlsym(lib, symbol.as_ptr() as *const i8);
        if p.is_null() {
            false
        } else {
            found = p;
            true
        }
    });
    if found.is_null() {
        found = dl::dlsym(dl::RTLD_DEFAULT, symbol.as_ptr() as *const i8);
    }
    if found.is_null() {
        None
    } else {
        Some(found as *const core::ffi::c_void)
    }
}

/// Open a shared library and add it to the machine's search list.
///
/// Symbols resolve against loaded libraries first, then the process
/// image.
///
/// # Safety
///
/// `t` must be live; `path` must not contain interior NUL.
pub unsafe fn load_native_library(t: *mut Thread, path: &str) -> bool {
    let mut bytes = Vec::with_capacity(path.len() + 1);
    bytes.extend_from_slice(path.as_bytes());
    bytes.push(0);
    let handle = dl::dlopen(bytes.as_ptr() as *const i8, dl::RTLD_LAZY);
    if handle.is_null() {
        return false;
    }
    machine(t).add_native_library(handle);
    true
}
