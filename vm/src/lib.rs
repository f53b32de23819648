pub mod bootstrap;
pub mod bridge;
pub mod compile;
pub mod native;
pub mod op;
pub mod processor;
pub mod runtime;
pub mod thunks;
pub mod unwind;

use std::alloc::Layout;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use libffi::middle::Cif;
use object::{
    array_allocation_size, Class, Compiled, ElementKind, Object, RawArray,
    Reference, StringObject, WORD,
};
use parking_lot::{Mutex, ReentrantMutex};

use crate::bridge::ArgumentList;

// Native frame layout, relative to the frame base register. The caller
// supplies the thread, method and previous-frame words; the callee's
// prologue pushes the return address and saved base below them.
pub const FRAME_THREAD: i32 = (2 * WORD) as i32;
pub const FRAME_METHOD: i32 = (3 * WORD) as i32;
pub const FRAME_NEXT: i32 = FRAME_METHOD + WORD as i32;
pub const FRAME_FOOTPRINT: usize = 3 * WORD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Active = 0,
    /// Blocked in host code; safe for the collector to run.
    Idle = 1,
    Exclusive = 2,
}

/// Per-thread VM state. The fields written by emitted code (`frame`,
/// `fault_ip`, `exception`) are addressed through `mem::offset_of!`, so
/// the struct is laid out C-style.
#[repr(C)]
pub struct Thread {
    pub machine: *mut Machine,
    /// Frame base of the innermost native frame; stored by every emitted
    /// helper-call site and by the stubs.
    pub frame: *mut usize,
    /// Resume address of the innermost helper call site; the unwinder's
    /// starting fault address.
    pub fault_ip: *const u8,
    /// The pending exception, null when none.
    pub exception: *mut Object,
    pub java_thread: *mut Object,
    pub parent: *mut Thread,
    /// Chain of embedder-held local references.
    pub reference: *mut Reference,
    /// Chain of in-flight invoke argument blocks, for root scanning.
    pub arguments: *mut ArgumentList,
    pub state: AtomicU8,
    pub(crate) cif_cache: RefCell<HashMap<String, Cif>>,
}

impl Thread {
    pub fn new(
        machine: *mut Machine,
        java_thread: *mut Object,
        parent: *mut Thread,
    ) -> Thread {
        Thread {
            machine,
            frame: ptr::null_mut(),
            fault_ip: ptr::null(),
            exception: ptr::null_mut(),
            java_thread,
            parent,
            reference: ptr::null_mut(),
            arguments: ptr::null_mut(),
            state: AtomicU8::new(ThreadState::Active as u8),
            cif_cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn frame_offset() -> i32 {
        core::mem::offset_of!(Thread, frame) as i32
    }

    pub fn fault_ip_offset() -> i32 {
        core::mem::offset_of!(Thread, fault_ip) as i32
    }

    pub fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            0 => ThreadState::Active,
            1 => ThreadState::Idle,
            _ => ThreadState::Exclusive,
        }
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// The classes and preallocated instances the compiler templates and the
/// runtime helpers reach for directly.
#[derive(Clone, Copy)]
pub struct SpecialClasses {
    pub object: *mut Class,
    pub string: *mut Class,

    pub int_box: *mut Class,
    pub long_box: *mut Class,
    pub float_box: *mut Class,
    pub double_box: *mut Class,

    pub throwable: *mut Class,
    pub exception: *mut Class,
    pub runtime_exception: *mut Class,
    pub error: *mut Class,
    pub null_pointer: *mut Class,
    pub array_index_out_of_bounds: *mut Class,
    pub negative_array_size: *mut Class,
    pub class_cast: *mut Class,
    pub out_of_memory: *mut Class,
    pub unsatisfied_link: *mut Class,
    pub in_initializer: *mut Class,
    pub no_class_def: *mut Class,
    pub no_such_field: *mut Class,
    pub no_such_method: *mut Class,

    pub boolean_array: *mut Class,
    pub char_array: *mut Class,
    pub float_array: *mut Class,
    pub double_array: *mut Class,
    pub byte_array: *mut Class,
    pub short_array: *mut Class,
    pub int_array: *mut Class,
    pub long_array: *mut Class,
    pub object_array: *mut Class,

    /// Preallocated so an allocation failure can still raise.
    pub oom_instance: *mut Object,
}

impl SpecialClasses {
    fn empty() -> Self {
        // SAFETY: all-null pattern is valid for a struct of pointers
        unsafe { core::mem::zeroed() }
    }
}

struct Arena {
    chunks: Vec<(NonNull<u8>, Layout)>,
}

#[derive(Default)]
struct Stubs {
    method_stub: Option<Box<Compiled>>,
    native_invoker: Option<Box<Compiled>>,
    invoke_thunk: Option<Box<Compiled>>,
    jump_thunk: Option<Box<Compiled>>,
}

/// The process-wide VM: class metadata, the object arena standing in for
/// the collector's heap, the shared stubs and the class/compilation lock.
pub struct Machine {
    /// Guards class initialization, lazy compilation and stub creation.
    /// Reentrant because `<clinit>` invocation compiles under it.
    pub class_lock: ReentrantMutex<()>,
    arena: Mutex<Arena>,
    classes: Mutex<Vec<*mut Class>>,
    methods: Mutex<Vec<*mut object::Method>>,
    fields: Mutex<Vec<*mut object::Field>>,
    threads: Mutex<Vec<*mut Thread>>,
    native_libraries: Mutex<Vec<*mut core::ffi::c_void>>,
    stubs: Mutex<Stubs>,
    pub specials: SpecialClasses,
    /// Times the lazy-compilation path has been entered.
    pub stub_calls: AtomicUsize,
}

// SAFETY: shared mutable state is guarded by class_lock / the interior
// mutexes; raw pointers reference arena- or box-allocations that live as
// long as the machine.
unsafe impl Send for Machine {}
unsafe impl Sync for Machine {}

impl Machine {
    pub(crate) fn new() -> Machine {
        Machine {
            class_lock: ReentrantMutex::new(()),
            arena: Mutex::new(Arena { chunks: Vec::new() }),
            classes: Mutex::new(Vec::new()),
            methods: Mutex::new(Vec::new()),
            fields: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            native_libraries: Mutex::new(Vec::new()),
            stubs: Mutex::new(Stubs::default()),
            specials: SpecialClasses::empty(),
            stub_calls: AtomicUsize::new(0),
        }
    }

    // ── allocation ─────────────────────────────────────────────────

    /// Allocate zeroed object storage that lives until the machine is
    /// dropped. Returns null when the host allocator fails.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let layout = match Layout::from_size_align(size.max(WORD), WORD) {
            Ok(l) => l,
            Err(_) => return ptr::null_mut(),
        };
        // SAFETY: layout has non-zero size
        let p = unsafe { std::alloc::alloc_zeroed(layout) };
        if let Some(nn) = NonNull::new(p) {
            self.arena.lock().chunks.push((nn, layout));
        }
        p
    }

    /// Allocate an array object of `length` elements of `class`'s
    /// element kind.
    pub fn allocate_array(
        &self,
        class: *mut Class,
        length: usize,
    ) -> *mut RawArray {
        // SAFETY: array classes always carry an element kind
        let kind = unsafe { (*class).element_kind }
            .expect("allocate_array on non-array class");
        let p = self.allocate(array_allocation_size(kind, length))
            as *mut RawArray;
        if !p.is_null() {
            // SAFETY: freshly allocated, correctly sized
            unsafe {
                (*p).class = class;
                (*p).length = length;
            }
        }
        p
    }

    pub fn allocate_string(&self, s: &str) -> *mut StringObject {
        let p = self.allocate(StringObject::allocation_size(s.len()))
            as *mut StringObject;
        if !p.is_null() {
            // SAFETY: freshly allocated, correctly sized
            unsafe {
                (*p).class = self.specials.string;
                (*p).length = s.len();
                ptr::copy_nonoverlapping(
                    s.as_ptr(),
                    p.add(1) as *mut u8,
                    s.len(),
                );
            }
        }
        p
    }

    pub(crate) fn register_class(&self, class: Box<Class>) -> *mut Class {
        let p = Box::into_raw(class);
        self.classes.lock().push(p);
        p
    }

    pub(crate) fn register_method(
        &self,
        method: Box<object::Method>,
    ) -> *mut object::Method {
        let p = Box::into_raw(method);
        self.methods.lock().push(p);
        p
    }

    pub(crate) fn register_field(
        &self,
        field: Box<object::Field>,
    ) -> *mut object::Field {
        let p = Box::into_raw(field);
        self.fields.lock().push(p);
        p
    }

    pub fn make_thread(
        &self,
        java_thread: *mut Object,
        parent: *mut Thread,
    ) -> *mut Thread {
        let p = Box::into_raw(Box::new(Thread::new(
            self as *const Machine as *mut Machine,
            java_thread,
            parent,
        )));
        self.threads.lock().push(p);
        p
    }

    /// Every method registered with the machine, for root enumeration.
    pub(crate) fn each_method(&self, f: &mut dyn FnMut(*mut object::Method)) {
        for &m in self.methods.lock().iter() {
            f(m);
        }
    }

    // ── shared stubs and thunks ────────────────────────────────────

    /// Entry of the shared lazy-compilation stub; emitted once under the
    /// class lock.
    pub fn method_stub_entry(&self) -> *const u8 {
        let _guard = self.class_lock.lock();
        let mut stubs = self.stubs.lock();
        if stubs.method_stub.is_none() {
            stubs.method_stub = Some(thunks::emit_method_stub());
        }
        stubs.method_stub.as_ref().map(|c| c.entry()).unwrap_or(ptr::null())
    }

    /// Entry of the shared native-method invoker; emitted once under the
    /// class lock.
    pub fn native_invoker_entry(&self) -> *const u8 {
        let _guard = self.class_lock.lock();
        let mut stubs = self.stubs.lock();
        if stubs.native_invoker.is_none() {
            stubs.native_invoker = Some(thunks::emit_native_invoker());
        }
        stubs
            .native_invoker
            .as_ref()
            .map(|c| c.entry())
            .unwrap_or(ptr::null())
    }

    pub(crate) fn invoke_thunk_entry(&self) -> *const u8 {
        let _guard = self.class_lock.lock();
        let mut stubs = self.stubs.lock();
        if stubs.invoke_thunk.is_none() {
            stubs.invoke_thunk = Some(thunks::emit_invoke_thunk());
        }
        stubs
            .invoke_thunk
            .as_ref()
            .map(|c| c.entry())
            .unwrap_or(ptr::null())
    }

    pub(crate) fn jump_thunk_entry(&self) -> *const u8 {
        let _guard = self.class_lock.lock();
        let mut stubs = self.stubs.lock();
        if stubs.jump_thunk.is_none() {
            stubs.jump_thunk = Some(thunks::emit_jump_thunk());
        }
        stubs
            .jump_thunk
            .as_ref()
            .map(|c| c.entry())
            .unwrap_or(ptr::null())
    }

    // ── native libraries ───────────────────────────────────────────

    pub(crate) fn each_native_library(
        &self,
        f: &mut dyn FnMut(*mut core::ffi::c_void) -> bool,
    ) {
        for &lib in self.native_libraries.lock().iter() {
            if f(lib) {
                return;
            }
        }
    }

    pub(crate) fn add_native_library(&self, handle: *mut core::ffi::c_void) {
        self.native_libraries.lock().push(handle);
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        for &t in self.threads.lock().iter() {
            // SAFETY: created by make_thread, dropped exactly once here
            drop(unsafe { Box::from_raw(t) });
        }
        for &c in self.classes.lock().iter() {
            // SAFETY: created by register_class
            drop(unsafe { Box::from_raw(c) });
        }
        for &m in self.methods.lock().iter() {
            // SAFETY: created by register_method
            drop(unsafe { Box::from_raw(m) });
        }
        for &f in self.fields.lock().iter() {
            // SAFETY: created by register_field
            drop(unsafe { Box::from_raw(f) });
        }
        let mut arena = self.arena.lock();
        for (ptr, layout) in arena.chunks.drain(..) {
            // SAFETY: allocated with this layout in allocate()
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// Map a `newarray` element type code to its storage class.
pub fn element_kind_for_type_code(code: u8) -> ElementKind {
    match code {
        op::T_BOOLEAN => ElementKind::Boolean,
        op::T_CHAR => ElementKind::Char,
        op::T_FLOAT => ElementKind::Float,
        op::T_DOUBLE => ElementKind::Double,
        op::T_BYTE => ElementKind::Byte,
        op::T_SHORT => ElementKind::Short,
        op::T_INT => ElementKind::Int,
        op::T_LONG => ElementKind::Long,
        _ => panic!("bad array type code {code}"),
    }
}
