//! Host-function bridge: resolve the symbol, marshal the frame's
//! argument words into the host calling convention, and box the raw
//! result back into a return register value.

use libffi::middle::{Arg, Cif, CodePtr, Type};
use object::{Class, FieldCode, Method, MethodCode, SpecIterator, WORD};

use crate::runtime::{self, machine, resolve_native_method, set_pending};
use crate::unwind::unwind;
use crate::{Thread, ThreadState};

/// Marshalled argument storage; the libffi argument vector borrows
/// these slots, so they are built completely first.
enum FfiValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(usize),
}

impl FfiValue {
    fn ffi_type(&self) -> Type {
        match self {
            Self::I32(_) => Type::i32(),
            Self::I64(_) => Type::i64(),
            Self::F32(_) => Type::f32(),
            Self::F64(_) => Type::f64(),
            Self::Pointer(_) => Type::pointer(),
        }
    }

    fn arg(&self) -> Arg {
        match self {
            Self::I32(v) => Arg::new(v),
            Self::I64(v) => Arg::new(v),
            Self::F32(v) => Arg::new(v),
            Self::F64(v) => Arg::new(v),
            Self::Pointer(v) => Arg::new(v),
        }
    }
}

fn return_type_of(code: FieldCode) -> Type {
    match code {
        FieldCode::Byte => Type::i8(),
        FieldCode::Boolean => Type::u8(),
        FieldCode::Char => Type::u16(),
        FieldCode::Short => Type::i16(),
        FieldCode::Int => Type::i32(),
        FieldCode::Long => Type::i64(),
        FieldCode::Float => Type::f32(),
        FieldCode::Double => Type::f64(),
        FieldCode::Object => Type::pointer(),
        FieldCode::Void => Type::void(),
    }
}

/// Restores the previous thread state when dropped; host calls run with
/// the thread idle so the collector need not wait for them.
struct StateGuard {
    t: *mut Thread,
    previous: ThreadState,
}

impl StateGuard {
    unsafe fn enter(t: *mut Thread, state: ThreadState) -> StateGuard {
        let previous = (*t).state();
        (*t).set_state(state);
        StateGuard { t, previous }
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        // SAFETY: the thread outlives the guard
        unsafe { (*self.t).set_state(self.previous) };
    }
}

unsafe fn invoke_native2(
    t: *mut Thread,
    method: *mut Method,
) -> Result<u64, ()> {
    // resolve and cache the host function on first call
    let function = match &(*method).code {
        MethodCode::NativePointer(p) => *p,
        MethodCode::NativeName(name) => {
            match resolve_native_method(t, name) {
                Some(p) => {
                    (*method).code = MethodCode::NativePointer(p);
                    p
                }
                None => {
                    let symbol =
                        String::from_utf8_lossy(name).into_owned();
                    set_pending(
                        t,
                        machine(t).specials.unsatisfied_link,
                        Some(&symbol),
                    );
                    return Err(());
                }
            }
        }
        _ => panic!("native invocation of a bytecode method"),
    };

    let _span = tracing::span!(
        tracing::Level::TRACE,
        "invoke_native",
        method = %(*method).name
    )
    .entered();

    let frame = (*t).frame;
    let footprint = (*method).parameter_footprint();
    // the first argument slot is the highest word of the frame's
    // argument region
    let mut sp: *mut usize = frame.add(
        2 + crate::FRAME_FOOTPRINT / WORD + footprint,
    );
    sp = sp.sub(1);

    let mut class_anchor: *mut Class = (*method).class;
    let mut values: Vec<FfiValue> = Vec::with_capacity(footprint + 2);

    values.push(FfiValue::Pointer(t as usize));
    if (*method).is_static() {
        values.push(FfiValue::Pointer(
            &mut class_anchor as *mut *mut Class as usize,
        ));
    } else {
        // the receiver is passed as the address of its slot
        values.push(FfiValue::Pointer(sp as usize));
        sp = sp.sub(1);
    }

    for head in SpecIterator::new(&(*method).spec) {
        match head {
            b'L' | b'[' => {
                values.push(FfiValue::Pointer(sp as usize));
                sp = sp.sub(1);
            }
            b'J' => {
                if WORD == 8 {
                    values.push(FfiValue::I64(*sp as i64));
                    sp = sp.sub(1);
                } else {
                    let hi = *sp as u64;
                    sp = sp.sub(1);
                    let lo = *sp as u64;
                    sp = sp.sub(1);
                    values.push(FfiValue::I64(((hi << 32) | lo) as i64));
                }
            }
            b'D' => {
                if WORD == 8 {
                    values.push(FfiValue::F64(f64::from_bits(*sp as u64)));
                    sp = sp.sub(1);
                } else {
                    let hi = *sp as u64;
                    sp = sp.sub(1);
                    let lo = *sp as u64;
                    sp = sp.sub(1);
                    values
                        .push(FfiValue::F64(f64::from_bits((hi << 32) | lo)));
                }
            }
            b'F' => {
                values.push(FfiValue::F32(f32::from_bits(*sp as u32)));
                sp = sp.sub(1);
            }
            _ => {
                values.push(FfiValue::I32(*sp as i32));
                sp = sp.sub(1);
            }
        }
    }

    let return_code = (*method).return_code;
    let cif = {
        let cache = &(*t).cif_cache;
        let cached = cache.borrow().get(&(*method).spec).cloned();
        match cached {
            Some(c) => c,
            None => {
                let c = Cif::new(
                    values.iter().map(FfiValue::ffi_type),
                    return_type_of(return_code),
                );
                cache
                    .borrow_mut()
                    .insert((*method).spec.clone(), c.clone());
                c
            }
        }
    };

    let args: Vec<Arg> = values.iter().map(FfiValue::arg).collect();
    let code = CodePtr(function as *mut libc::c_void);

    let result = {
        let _idle = StateGuard::enter(t, ThreadState::Idle);
        match return_code {
            FieldCode::Void => {
                cif.call::<()>(code, &args);
                0
            }
            FieldCode::Byte => cif.call::<i8>(code, &args) as i64 as u64,
            FieldCode::Boolean => cif.call::<u8>(code, &args) as u64,
            FieldCode::Char => cif.call::<u16>(code, &args) as u64,
            FieldCode::Short => cif.call::<i16>(code, &args) as i64 as u64,
            FieldCode::Int => cif.call::<i32>(code, &args) as i64 as u64,
            FieldCode::Long => cif.call::<i64>(code, &args) as u64,
            FieldCode::Float => {
                cif.call::<f32>(code, &args).to_bits() as u64
            }
            FieldCode::Double => cif.call::<f64>(code, &args).to_bits(),
            FieldCode::Object => {
                let indirect = cif.call::<usize>(code, &args);
                if indirect == 0 || !(*t).exception.is_null() {
                    0
                } else {
                    // host functions return object references
                    // indirectly, through embedder-held slots
                    *(indirect as *const usize) as u64
                }
            }
        }
    };

    if (*t).exception.is_null() {
        Ok(result)
    } else {
        Err(())
    }
}

/// Entry called by the native invoker's frame; marshals, calls, and
/// unwinds if the host left an exception pending.
///
/// # Safety
///
/// Called from emitted code with a live thread and native method.
pub unsafe extern "C" fn invoke_native(
    t: *mut Thread,
    method: *mut Method,
) -> u64 {
    match invoke_native2(t, method) {
        Ok(result) => result,
        Err(()) => unwind(t),
    }
}

/// Load a shared library into the machine's native search list.
///
/// # Safety
///
/// `t` must be live.
pub unsafe fn load_library(t: *mut Thread, path: &str) -> bool {
    runtime::load_native_library(t, path)
}
