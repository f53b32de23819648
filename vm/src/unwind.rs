//! Frame-chain walking and exception dispatch.
//!
//! A frame value is the frame base register of one activation. From it,
//! fixed offsets recover the saved caller base, the thread, the method,
//! the previous frame and the return address; the suspended machine
//! address of an outer frame is the return address its callee pushed,
//! and the innermost frame's fault address is published by every
//! helper-call site before it calls out.

use object::{Method, MethodCode, RawArray, WORD};

use crate::runtime::machine;
use crate::{Thread, FRAME_METHOD, FRAME_NEXT};

pub fn frame_valid(frame: *mut usize) -> bool {
    !frame.is_null()
}

/// # Safety
///
/// `frame` must be a live frame base.
pub unsafe fn frame_next(frame: *mut usize) -> *mut usize {
    *frame.add(FRAME_NEXT as usize / WORD) as *mut usize
}

/// # Safety
///
/// `frame` must be a live frame base.
pub unsafe fn frame_method(frame: *mut usize) -> *mut Method {
    *frame.add(FRAME_METHOD as usize / WORD) as *mut Method
}

/// # Safety
///
/// `frame` must be a live frame base.
pub unsafe fn frame_return_address(frame: *mut usize) -> *const u8 {
    *frame.add(1) as *const u8
}

/// # Safety
///
/// `frame` must be a live frame base.
pub unsafe fn frame_saved_base(frame: *mut usize) -> *mut usize {
    *frame as *mut usize
}

/// Byte offset of the suspended machine address of `frame` within its
/// method's code, walking inward from the innermost frame to find the
/// return address its callee holds.
///
/// # Safety
///
/// `t` must be live and `frame` must be on its chain.
pub unsafe fn frame_ip(t: *mut Thread, frame: *mut usize) -> u32 {
    let method = frame_method(frame);
    let compiled = (*method)
        .compiled
        .as_ref()
        .expect("walking an uncompiled frame");

    let address = if frame == (*t).frame {
        (*t).fault_ip
    } else {
        let mut inner = (*t).frame;
        loop {
            assert!(frame_valid(inner), "frame is not on the thread chain");
            if frame_next(inner) == frame {
                break frame_return_address(inner);
            }
            inner = frame_next(inner);
        }
    };
    compiled.ip_of(address).expect("address outside method code")
}

/// The matching handler for the pending exception at `fault_address`
/// in `frame`, if any: the first table entry whose machine range covers
/// the biased fault offset and whose catch type is absent or matches.
///
/// # Safety
///
/// `t` must be live with a pending exception; `frame` must be a live
/// compiled frame.
unsafe fn find_exception_handler(
    t: *mut Thread,
    frame: *mut usize,
    fault_address: *const u8,
) -> Option<(*const u8, usize)> {
    let method = frame_method(frame);
    let compiled = match (*method).compiled.as_ref() {
        Some(c) => c,
        // an uncompiled activation (the stub's own frame) has no table
        None => return None,
    };
    let offset = compiled.ip_of(fault_address)?;

    let pool = (*method).pool;
    for handler in compiled.handlers() {
        // the -1 bias keeps a fault on the last byte of the protected
        // range inside it
        if offset.wrapping_sub(1) >= handler.start
            && offset.wrapping_sub(1) < handler.end
        {
            let matches = if handler.catch_type == 0 {
                true
            } else {
                let catch_class = RawArray::words(pool)
                    [handler.catch_type as usize - 1]
                    as *mut object::Class;
                let exception_class = (*(*t).exception).class;
                object::Class::is_assignable_from(
                    catch_class,
                    exception_class,
                )
            };
            if matches {
                let locals = local_area_bytes(method);
                return Some((
                    compiled.entry().add(handler.ip as usize),
                    locals,
                ));
            }
        }
    }
    None
}

fn local_area_bytes(method: *mut Method) -> usize {
    // SAFETY: caller verified the method is compiled bytecode
    unsafe {
        let footprint = (*method).parameter_footprint_bytes();
        match &(*method).code {
            MethodCode::Bytecode(record) => {
                (record.max_locals * WORD).saturating_sub(footprint)
            }
            _ => 0,
        }
    }
}

/// Walk the frame chain dispatching the pending exception: transfer to
/// the innermost matching handler, or bail through the return address
/// of the last compiled frame below a native boundary.
///
/// # Safety
///
/// `t` must be live with a pending exception and a walkable frame
/// chain; the executing stack must be below the target activation.
pub unsafe fn unwind(t: *mut Thread) -> ! {
    debug_assert!(!(*t).exception.is_null());
    let m = machine(t);
    let jump: extern "C" fn(*const u8, usize, usize) -> ! =
        core::mem::transmute(m.jump_thunk_entry());

    let mut frame = (*t).frame;
    let mut fault_address = (*t).fault_ip;
    loop {
        assert!(frame_valid(frame), "unwound past the last frame");
        let method = frame_method(frame);

        if !(*method).is_native() {
            if let Some((handler_address, local_bytes)) =
                find_exception_handler(t, frame, fault_address)
            {
                tracing::debug!(
                    method = %(*method).name,
                    handler = ?handler_address,
                    "dispatching to handler"
                );
                (*t).frame = frame;
                // handler entry sees a cleared operand stack holding
                // only the exception
                let sp =
                    (frame as usize - local_bytes - WORD) as *mut usize;
                *sp = (*t).exception as usize;
                (*t).exception = core::ptr::null_mut();
                jump(handler_address, frame as usize, sp as usize);
            }
        }

        let next = frame_next(frame);
        if !frame_valid(next)
            || (*frame_method(next)).is_native()
        {
            // bail into the native caller; its own return path checks
            // the pending exception
            tracing::debug!("unwinding past a native boundary");
            (*t).frame = next;
            let return_address = frame_return_address(frame);
            let saved_base = frame_saved_base(frame) as usize;
            let sp = frame as usize + 2 * WORD;
            jump(return_address, saved_base, sp);
        }

        fault_address = frame_return_address(frame);
        frame = next;
    }
}
