//! The embedder-facing surface: thread creation, the shared stubs,
//! invocation entry points, the stack walker and local references.

use object::{
    parameter_footprint, Class, Method, Object, RawArray, Reference,
};

use crate::bridge::{self, ArgumentList, InvokeArg};
use crate::runtime::{self, machine};
use crate::unwind;
use crate::{Machine, Thread, ThreadState};

/// Create a managed thread record bound to its host OS thread.
pub fn make_thread(
    m: &Machine,
    java_thread: *mut Object,
    parent: *mut Thread,
) -> *mut Thread {
    m.make_thread(java_thread, parent)
}

/// Entry of the shared lazy-compilation stub; lazily emitted, cached.
pub fn method_stub(t: *mut Thread) -> *const u8 {
    // SAFETY: threads carry a live machine pointer
    unsafe { machine(t).method_stub_entry() }
}

/// Entry of the shared native-method invoker; lazily emitted, cached.
pub fn native_invoker(t: *mut Thread) -> *const u8 {
    // SAFETY: threads carry a live machine pointer
    unsafe { machine(t).native_invoker_entry() }
}

/// Argument slots for `spec`; pure function of the spec string.
pub fn parameter_footprint_of(spec: &str, is_static: bool) -> usize {
    parameter_footprint(spec, is_static)
}

/// Run a class's static initializer at most once.
///
/// # Safety
///
/// `t` and `class` must be live.
pub unsafe fn init_class(t: *mut Thread, class: *mut Class) {
    runtime::init_class(t, class)
}

fn assert_invocable(t: *mut Thread, method: *mut Method, this: *mut Object) {
    // SAFETY: caller contract
    unsafe {
        let state = (*t).state();
        assert!(
            state == ThreadState::Active || state == ThreadState::Exclusive,
            "invocation from a non-active thread"
        );
        assert!(
            (*method).is_static() == this.is_null(),
            "receiver does not match the method's staticness"
        );
    }
}

/// Invoke with a boxed argument array. `None` means an exception is
/// pending on the thread.
///
/// # Safety
///
/// `t`, `method` and the arguments must be live; `arguments` must match
/// the method's spec.
pub unsafe fn invoke_array(
    t: *mut Thread,
    method: *mut Method,
    this: *mut Object,
    arguments: *mut RawArray,
) -> Option<*mut Object> {
    assert_invocable(t, method, this);
    let mut list =
        ArgumentList::from_array(t, this, &(*method).spec, arguments);
    bridge::invoke(t, method, &mut list)
}

/// Invoke with typed arguments. `None` means an exception is pending.
///
/// # Safety
///
/// `t`, `method` and any object arguments must be live.
pub unsafe fn invoke_list(
    t: *mut Thread,
    method: *mut Method,
    this: *mut Object,
    arguments: &[InvokeArg],
) -> Option<*mut Object> {
    assert_invocable(t, method, this);
    let mut list =
        ArgumentList::from_args(t, this, &(*method).spec, arguments);
    bridge::invoke(t, method, &mut list)
}

/// Resolve `class_name.method_name` with `spec`, then invoke it.
///
/// # Safety
///
/// As [`invoke_list`].
pub unsafe fn invoke_list_by_name(
    t: *mut Thread,
    class: *mut Class,
    method_name: &str,
    spec: &str,
    this: *mut Object,
    arguments: &[InvokeArg],
) -> Option<*mut Object> {
    let method =
        runtime::resolve_method_by_name(t, class, method_name, spec)
            .ok()?;
    invoke_list(t, method, this, arguments)
}

// ── stack walker ───────────────────────────────────────────────────

/// The innermost frame of `t`, or null.
///
/// # Safety
///
/// `t` must be live.
pub unsafe fn frame_start(t: *mut Thread) -> *mut usize {
    (*t).frame
}

pub fn frame_valid(frame: *mut usize) -> bool {
    unwind::frame_valid(frame)
}

/// # Safety
///
/// `frame` must be a live frame base.
pub unsafe fn frame_next(frame: *mut usize) -> *mut usize {
    unwind::frame_next(frame)
}

/// # Safety
///
/// `frame` must be a live frame base.
pub unsafe fn frame_method(frame: *mut usize) -> *mut Method {
    unwind::frame_method(frame)
}

/// Byte offset of the frame's suspended address inside its method's
/// compiled code.
///
/// # Safety
///
/// `t` must be live and `frame` must be on its chain.
pub unsafe fn frame_ip(t: *mut Thread, frame: *mut usize) -> u32 {
    unwind::frame_ip(t, frame)
}

// ── local references ───────────────────────────────────────────────

/// Pin `obj` on the thread's reference chain; returns a slot the
/// embedder may hold across GC. Null objects yield a null reference.
///
/// # Safety
///
/// `t` must be live.
pub unsafe fn make_local_reference(
    t: *mut Thread,
    obj: *mut Object,
) -> *mut *mut Object {
    if obj.is_null() {
        return core::ptr::null_mut();
    }
    let reference = Box::into_raw(Box::new(Reference {
        target: obj,
        next: (*t).reference,
    }));
    (*t).reference = reference;
    &mut (*reference).target
}

/// Release a reference created by [`make_local_reference`].
///
/// # Safety
///
/// `r` must come from `make_local_reference` on `t` and not have been
/// disposed already.
pub unsafe fn dispose_local_reference(t: *mut Thread, r: *mut *mut Object) {
    if r.is_null() {
        return;
    }
    let target = r as *mut Reference;
    let mut cursor = &mut (*t).reference as *mut *mut Reference;
    while !(*cursor).is_null() {
        if *cursor == target {
            *cursor = (*target).next;
            drop(Box::from_raw(target));
            return;
        }
        cursor = &mut (**cursor).next as *mut *mut Reference;
    }
}

// ── root enumeration ───────────────────────────────────────────────

/// Enumerate the object words the collector must keep alive for `t`:
/// every realized constant pool, the object-masked words of in-flight
/// argument blocks, the local reference chain and the pending
/// exception. Conservative: pool words may include metadata pointers.
///
/// # Safety
///
/// `t` must be live and the machine quiescent enough that chains do not
/// change underfoot.
pub unsafe fn visit_objects(
    t: *mut Thread,
    visitor: &mut dyn FnMut(*mut Object),
) {
    let m = machine(t);

    m.each_method(&mut |method| {
        let pool = (*method).pool;
        if !pool.is_null() {
            for &word in RawArray::words(pool) {
                if word != 0 {
                    visitor(word as *mut Object);
                }
            }
        }
    });

    let mut list = (*t).arguments;
    while !list.is_null() {
        for (index, &word) in (*list).words.iter().enumerate() {
            if (&(*list).object_mask)[index] && word != 0 {
                visitor(word as *mut Object);
            }
        }
        list = (*list).next;
    }

    let mut reference = (*t).reference;
    while !reference.is_null() {
        if !(*reference).target.is_null() {
            visitor((*reference).target);
        }
        reference = (*reference).next;
    }

    if !(*t).exception.is_null() {
        visitor((*t).exception);
    }
}
