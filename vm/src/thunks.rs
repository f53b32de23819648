//! Hand-emitted entry points: the lazy-compilation stub, the native
//! invoker, the compiled-code entry thunk and the non-local jump thunk,
//! plus the direct-call-site rewrite.

use std::sync::atomic::{AtomicUsize, Ordering};

use assembler::{Assembler, Reg, WORD};
use object::{Compiled, Method};

use crate::runtime::{self, compile_method};
use crate::unwind::frame_return_address;
use crate::{native, Thread, FRAME_METHOD, FRAME_THREAD};

fn seal(asm: Assembler) -> Box<Compiled> {
    let code = asm.finish().expect("thunk assembly");
    Compiled::from_code(&code).expect("thunk memory")
}

/// Store the current frame base into the thread through the frame's
/// thread slot. Clobbers rax.
fn store_thread_frame(a: &mut Assembler) {
    a.mov_rm(Reg::Rax, Reg::Rbp, FRAME_THREAD);
    a.mov_mr(Reg::Rax, Thread::frame_offset(), Reg::Rbp);
}

/// Call a host function with `(thread, method-slot)` arguments, keeping
/// the stack aligned for the host ABI. Clobbers rax, rbx.
fn call_host_with_frame_args(a: &mut Assembler, f: usize) {
    if WORD == 8 {
        a.mov_rm(Reg::Rsi, Reg::Rbp, FRAME_METHOD);
        a.mov_rm(Reg::Rdi, Reg::Rbp, FRAME_THREAD);
        a.mov_rr(Reg::Rbx, Reg::Rsp);
        a.and_ri(Reg::Rsp, -16);
    } else {
        a.push_m(Reg::Rbp, FRAME_METHOD);
        a.push_m(Reg::Rbp, FRAME_THREAD);
    }
    a.mov_ri(Reg::Rax, f as u64);
    a.call_r(Reg::Rax);
    if WORD == 8 {
        a.mov_rr(Reg::Rsp, Reg::Rbx);
    } else {
        a.add_ri(Reg::Rsp, 2 * WORD as i32);
    }
}

/// The shared initial entry of every not-yet-compiled method: publish
/// the frame, compile the frame's method, then tail-jump to the fresh
/// entry with the caller's stack intact.
pub fn emit_method_stub() -> Box<Compiled> {
    let mut a = Assembler::new();

    a.push_r(Reg::Rbp);
    a.mov_rr(Reg::Rbp, Reg::Rsp);

    store_thread_frame(&mut a);
    call_host_with_frame_args(&mut a, compile_method as usize);

    a.mov_rm(Reg::Rax, Reg::Rbp, FRAME_METHOD);
    a.mov_rm(
        Reg::Rax,
        Reg::Rax,
        core::mem::offset_of!(Method, code_entry) as i32,
    );

    a.mov_rr(Reg::Rsp, Reg::Rbp);
    a.pop_r(Reg::Rbp);

    a.jmp_r(Reg::Rax);

    seal(a)
}

/// The shared entry of every native method: an ordinary-looking frame so
/// walking stays uniform, then the marshalling helper does the rest.
pub fn emit_native_invoker() -> Box<Compiled> {
    let mut a = Assembler::new();

    a.push_r(Reg::Rbp);
    a.mov_rr(Reg::Rbp, Reg::Rsp);

    store_thread_frame(&mut a);
    call_host_with_frame_args(&mut a, native::invoke_native as usize);

    a.mov_rr(Reg::Rsp, Reg::Rbp);
    a.pop_r(Reg::Rbp);
    a.ret();

    seal(a)
}

/// `fn(code, args, size_bytes, return_type) -> u64`: copy the argument
/// block below the stack pointer so the callee's prologue sees exactly
/// the frame image a compiled caller builds, call the entry, and hand
/// the raw return register back to the host caller.
pub fn emit_invoke_thunk() -> Box<Compiled> {
    let mut a = Assembler::new();

    if WORD == 8 {
        a.push_r(Reg::Rbp);
        a.mov_rr(Reg::Rbp, Reg::Rsp);
        a.push_r(Reg::Rbx);
        a.push_r(Reg::R12);
        a.push_r(Reg::R13);
        a.push_r(Reg::R14);
        a.push_r(Reg::R15);

        a.mov_rr(Reg::R12, Reg::Rdi);
        a.mov_rr(Reg::R13, Reg::Rdx);

        a.sub_rr(Reg::Rsp, Reg::Rdx);
        a.mov_rr(Reg::Rdi, Reg::Rsp);
        a.mov_rr(Reg::Rcx, Reg::Rdx);
        a.rep_movsb();

        a.call_r(Reg::R12);

        a.add_rr(Reg::Rsp, Reg::R13);

        a.pop_r(Reg::R15);
        a.pop_r(Reg::R14);
        a.pop_r(Reg::R13);
        a.pop_r(Reg::R12);
        a.pop_r(Reg::Rbx);
        a.pop_r(Reg::Rbp);
        a.ret();
    } else {
        a.push_r(Reg::Rbp);
        a.mov_rr(Reg::Rbp, Reg::Rsp);
        a.push_r(Reg::Rbx);
        a.push_r(Reg::Rsi);
        a.push_r(Reg::Rdi);

        a.mov_rm(Reg::Rdx, Reg::Rbp, 2 * WORD as i32); // code
        a.mov_rm(Reg::Rsi, Reg::Rbp, 3 * WORD as i32); // args
        a.mov_rm(Reg::Rbx, Reg::Rbp, 4 * WORD as i32); // size

        a.sub_rr(Reg::Rsp, Reg::Rbx);
        a.mov_rr(Reg::Rdi, Reg::Rsp);
        a.mov_rr(Reg::Rcx, Reg::Rbx);
        a.rep_movsb();

        a.call_r(Reg::Rdx);

        a.add_rr(Reg::Rsp, Reg::Rbx);

        a.pop_r(Reg::Rdi);
        a.pop_r(Reg::Rsi);
        a.pop_r(Reg::Rbx);
        a.pop_r(Reg::Rbp);
        a.ret();
    }

    seal(a)
}

/// `fn(address, frame_base, stack_pointer) -> !`: install the target
/// activation's registers and continue there, abandoning every host
/// frame in between.
pub fn emit_jump_thunk() -> Box<Compiled> {
    let mut a = Assembler::new();

    if WORD == 8 {
        a.mov_rr(Reg::Rbp, Reg::Rsi);
        a.mov_rr(Reg::Rsp, Reg::Rdx);
        a.jmp_r(Reg::Rdi);
    } else {
        a.mov_rm(Reg::Rax, Reg::Rsp, WORD as i32); // address
        a.mov_rm(Reg::Rbp, Reg::Rsp, 2 * WORD as i32); // frame base
        a.mov_rm(Reg::Rsp, Reg::Rsp, 3 * WORD as i32); // stack pointer
        a.jmp_r(Reg::Rax);
    }

    seal(a)
}

/// The exact byte sequence a direct-call template ends with when its
/// target was still the stub. Returns `(bytes, immediate offset)`.
fn direct_call_reference(stub_entry: usize) -> (Vec<u8>, usize) {
    let mut a = Assembler::new();
    a.mov_ri(Reg::Rax, stub_entry as u64);
    let imm_offset = a.len() - Assembler::mov_ri_imm_offset();
    a.call_r(Reg::Rax);
    (a.finish().expect("reference sequence"), imm_offset)
}

/// Rewrite the caller's direct call site to `method`'s fresh entry.
///
/// The last bytes before the saved return address must equal a direct
/// call of the stub; any mismatch (virtual dispatch, already patched,
/// a host caller) leaves the site untouched. The immediate was emitted
/// word-aligned, so the rewrite is a single tear-free store.
///
/// # Safety
///
/// Called with the stub's frame installed as `t->frame`.
pub unsafe fn update_caller(t: *mut Thread, method: *mut Method) {
    let m = runtime::machine(t);
    let stub_entry = m.method_stub_entry() as usize;
    let (reference, imm_offset) = direct_call_reference(stub_entry);

    let return_address = frame_return_address((*t).frame) as *const u8;
    let caller = return_address.sub(reference.len());
    let site = core::slice::from_raw_parts(caller, reference.len());
    if site != reference.as_slice() {
        return;
    }

    let imm = caller.add(imm_offset) as *const AtomicUsize;
    debug_assert_eq!(imm as usize % WORD, 0, "unaligned call-site patch");
    (*imm).store((*method).code_entry as usize, Ordering::Release);
    tracing::debug!(site = ?caller, method = %(*method).name, "patched caller");
}
