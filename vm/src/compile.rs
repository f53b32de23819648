use std::fmt;

use assembler::{Assembler, AssemblerError, Buffer, Cond, Reg, WORD};
use object::{
    Class, ClassFlags, Compiled, FieldCode, Method, MethodCode,
    NativeHandler, NativeLineNumber, PoolEntry, ARRAY_BODY, ARRAY_LENGTH,
};

use crate::runtime::{
    self, is_assignable_from, make_blank_array, make_blank_object_array,
    make_new, make_new_weak_reference, throw_, throw_new, ArrayConstructor,
};
use crate::{op, Thread, FRAME_FOOTPRINT, FRAME_METHOD, FRAME_THREAD};

/// The register holding the current method's constant-pool array.
pub const POOL_REGISTER: Reg = Reg::Rdi;

#[derive(Debug)]
pub enum CompileError {
    /// A resolution or initialization step recorded a pending exception;
    /// the partial compile is discarded.
    Pending,
    OutOfMemory,
    Assembler(AssemblerError),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "exception pending"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Assembler(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<AssemblerError> for CompileError {
    fn from(e: AssemblerError) -> Self {
        match e {
            AssemblerError::OutOfMemory => Self::OutOfMemory,
            other => Self::Assembler(other),
        }
    }
}

/// Frame displacement of local slot `index`: parameters live above the
/// frame header, remaining locals below the saved base.
pub fn local_offset(index: usize, parameter_footprint: usize) -> i32 {
    let v = index * WORD;
    if v < parameter_footprint {
        ((parameter_footprint - v - WORD) + 2 * WORD + FRAME_FOOTPRINT)
            as i32
    } else {
        -((v + WORD - parameter_footprint) as i32)
    }
}

fn read_u8(code: &[u8], ip: &mut usize) -> u8 {
    let v = code[*ip];
    *ip += 1;
    v
}

fn read_u16(code: &[u8], ip: &mut usize) -> u16 {
    let v = u16::from_be_bytes([code[*ip], code[*ip + 1]]);
    *ip += 2;
    v
}

fn read_i16(code: &[u8], ip: &mut usize) -> i16 {
    read_u16(code, ip) as i16
}

fn read_i32(code: &[u8], ip: &mut usize) -> i32 {
    let v = i32::from_be_bytes([
        code[*ip],
        code[*ip + 1],
        code[*ip + 2],
        code[*ip + 3],
    ]);
    *ip += 4;
    v
}

/// An absolute-address immediate that must be rebased once the final
/// placement of the code is known.
struct CodeReloc {
    imm_offset: usize,
    target: usize,
}

/// Per-method template compiler: walks the bytecode once, appending
/// machine code linearly, and accumulates the side tables needed to run,
/// unwind and patch the result.
pub struct Compiler {
    t: *mut Thread,
    asm: Assembler,
    /// `<bytecode ip, displacement slot>` pairs for branches to other
    /// bytecode instructions, resolved after the body is emitted.
    jumps: Buffer,
    /// Parallel arrays mapping bytecode ips to machine offsets, appended
    /// in bytecode order so lookup can binary-search.
    java_ips: Buffer,
    machine_ips: Buffer,
    line_numbers: Vec<NativeLineNumber>,
    handlers: Vec<NativeHandler>,
    pool: Vec<usize>,
    pool_register_clobbered: bool,
    code_relocs: Vec<CodeReloc>,
}

impl Compiler {
    pub fn new(t: *mut Thread) -> Compiler {
        Compiler {
            t,
            asm: Assembler::new(),
            jumps: Buffer::new(32),
            java_ips: Buffer::new(1024),
            machine_ips: Buffer::new(1024),
            line_numbers: Vec::new(),
            handlers: Vec::new(),
            pool: Vec::new(),
            pool_register_clobbered: true,
            code_relocs: Vec::new(),
        }
    }

    // ── constant pool ──────────────────────────────────────────────

    /// Stash `obj` in the pool without touching the code stream.
    fn pool_index(&mut self, obj: usize) -> usize {
        self.pool.push(obj);
        self.pool.len() - 1
    }

    /// Append `obj` to the pool and return its byte displacement from
    /// the pool array base, reloading the pool register first if a call
    /// clobbered it.
    fn pool_reference(&mut self, obj: usize) -> i32 {
        if self.pool_register_clobbered {
            self.asm.mov_rm(POOL_REGISTER, Reg::Rbp, FRAME_METHOD);
            self.asm.mov_rm(
                POOL_REGISTER,
                POOL_REGISTER,
                core::mem::offset_of!(Method, pool) as i32,
            );
            self.pool_register_clobbered = false;
        }
        let index = self.pool_index(obj);
        (ARRAY_BODY + index * WORD) as i32
    }

    // ── helper calls ───────────────────────────────────────────────

    /// Publish the current frame and resume address to the thread, then
    /// call `f` with the host convention. On 64-bit targets the stack is
    /// re-aligned around the call; on 32-bit ones `pushed` argument
    /// bytes are popped afterwards.
    fn call_address(&mut self, f: usize, pushed: usize) {
        self.asm.mov_rm(Reg::Rax, Reg::Rbp, FRAME_THREAD);
        self.asm.mov_mr(Reg::Rax, Thread::frame_offset(), Reg::Rbp);
        self.asm.mov_ri(Reg::Rcx, 0);
        let imm_offset = self.asm.len() - Assembler::mov_ri_imm_offset();
        self.asm.mov_mr(Reg::Rax, Thread::fault_ip_offset(), Reg::Rcx);

        if WORD == 8 {
            self.asm.mov_rr(Reg::Rbx, Reg::Rsp);
            self.asm.and_ri(Reg::Rsp, -16);
        }
        self.asm.mov_ri(Reg::Rax, f as u64);
        self.asm.call_r(Reg::Rax);
        self.code_relocs.push(CodeReloc {
            imm_offset,
            target: self.asm.len(),
        });
        if WORD == 8 {
            self.asm.mov_rr(Reg::Rsp, Reg::Rbx);
        } else if pushed > 0 {
            self.asm.add_ri(Reg::Rsp, pushed as i32);
        }
        self.pool_register_clobbered = true;
    }

    fn compile_call_obj(&mut self, f: usize, arg1: usize) {
        if WORD == 8 {
            let off = self.pool_reference(arg1);
            self.asm.mov_rm(Reg::Rsi, POOL_REGISTER, off);
            self.asm.mov_rm(Reg::Rdi, Reg::Rbp, FRAME_THREAD);
            self.call_address(f, 0);
        } else {
            let off = self.pool_reference(arg1);
            self.asm.push_m(POOL_REGISTER, off);
            self.asm.push_m(Reg::Rbp, FRAME_THREAD);
            self.call_address(f, 2 * WORD);
        }
    }

    fn compile_call_reg(&mut self, f: usize, arg1: Reg) {
        if WORD == 8 {
            self.asm.mov_rr(Reg::Rsi, arg1);
            self.asm.mov_rm(Reg::Rdi, Reg::Rbp, FRAME_THREAD);
            self.call_address(f, 0);
        } else {
            self.asm.push_r(arg1);
            self.asm.push_m(Reg::Rbp, FRAME_THREAD);
            self.call_address(f, 2 * WORD);
        }
    }

    fn compile_call_obj_reg(&mut self, f: usize, arg1: usize, arg2: Reg) {
        if WORD == 8 {
            self.asm.mov_rr(Reg::Rdx, arg2);
            let off = self.pool_reference(arg1);
            self.asm.mov_rm(Reg::Rsi, POOL_REGISTER, off);
            self.asm.mov_rm(Reg::Rdi, Reg::Rbp, FRAME_THREAD);
            self.call_address(f, 0);
        } else {
            self.asm.push_r(arg2);
            let off = self.pool_reference(arg1);
            self.asm.push_m(POOL_REGISTER, off);
            self.asm.push_m(Reg::Rbp, FRAME_THREAD);
            self.call_address(f, 3 * WORD);
        }
    }

    fn compile_call_imm_reg(&mut self, f: usize, arg1: usize, arg2: Reg) {
        if WORD == 8 {
            self.asm.mov_rr(Reg::Rdx, arg2);
            self.asm.mov_ri(Reg::Rsi, arg1 as u64);
            self.asm.mov_rm(Reg::Rdi, Reg::Rbp, FRAME_THREAD);
            self.call_address(f, 0);
        } else {
            self.asm.push_r(arg2);
            self.asm.push_i32(arg1 as i32);
            self.asm.push_m(Reg::Rbp, FRAME_THREAD);
            self.call_address(f, 3 * WORD);
        }
    }

    fn compile_call_reg_reg(&mut self, f: usize, arg1: Reg, arg2: Reg) {
        if WORD == 8 {
            self.asm.mov_rr(Reg::Rdx, arg2);
            self.asm.mov_rr(Reg::Rsi, arg1);
            self.asm.mov_rm(Reg::Rdi, Reg::Rbp, FRAME_THREAD);
            self.call_address(f, 0);
        } else {
            self.asm.push_r(arg2);
            self.asm.push_r(arg1);
            self.asm.push_m(Reg::Rbp, FRAME_THREAD);
            self.call_address(f, 3 * WORD);
        }
    }

    // ── invocation ─────────────────────────────────────────────────

    fn push_return_value(&mut self, code: FieldCode) {
        match code {
            FieldCode::Byte
            | FieldCode::Boolean
            | FieldCode::Char
            | FieldCode::Short
            | FieldCode::Float
            | FieldCode::Int
            | FieldCode::Object => self.asm.push_r(Reg::Rax),
            FieldCode::Long | FieldCode::Double => {
                if WORD == 8 {
                    self.asm.push_r(Reg::Rax);
                } else {
                    self.asm.push_r(Reg::Rdx);
                    self.asm.push_r(Reg::Rax);
                }
            }
            FieldCode::Void => {}
        }
    }

    /// Direct call: the caller has already pushed the arguments; push
    /// the frame header, then call through a patchable aligned
    /// immediate holding the target's current entry.
    unsafe fn compile_direct_invoke(&mut self, target: *mut Method) {
        let footprint =
            FRAME_FOOTPRINT + (*target).parameter_footprint_bytes();

        self.asm.push_r(Reg::Rbp);
        let off = self.pool_reference(target as usize);
        self.asm.push_m(POOL_REGISTER, off);
        self.asm.push_m(Reg::Rbp, FRAME_THREAD);

        self.asm
            .aligned_mov_ri(Reg::Rax, (*target).code_entry as u64);
        self.asm.call_r(Reg::Rax);
        self.pool_register_clobbered = true;

        self.asm.add_ri(Reg::Rsp, footprint as i32);

        self.push_return_value((*target).return_code);
    }

    // ── branches to bytecode targets ───────────────────────────────

    fn jump_to_java_ip(&mut self, java_ip: u16) {
        let slot = self.asm.jmp_placeholder();
        self.jumps.append4(java_ip as u32);
        self.jumps.append4(slot as u32);
    }

    fn branch_to_java_ip(&mut self, cond: Cond, java_ip: u16) {
        let slot = self.asm.jcc_placeholder(cond);
        self.jumps.append4(java_ip as u32);
        self.jumps.append4(slot as u32);
    }

    fn machine_ip_for_java_ip(&self, java_ip: u16) -> u32 {
        let mut bottom = 0usize;
        let mut top = self.java_ips.length() / 2;
        while bottom < top {
            let middle = bottom + (top - bottom) / 2;
            let k = self.java_ips.get2(middle * 2);
            if java_ip < k {
                top = middle;
            } else if java_ip > k {
                bottom = middle + 1;
            } else {
                return self.machine_ips.get4(middle * 4);
            }
        }
        panic!("bytecode ip {java_ip} is not an instruction boundary");
    }

    fn resolve_jumps(&mut self) {
        let mut i = 0;
        while i < self.jumps.length() {
            let ip = self.jumps.get4(i) as u16;
            let slot = self.jumps.get4(i + 4) as usize;
            let target = self.machine_ip_for_java_ip(ip);
            self.asm
                .code
                .patch4(slot, (target as i64 - (slot as i64 + 4)) as u32);
            i += 8;
        }
    }

    // ── guards ─────────────────────────────────────────────────────

    /// Throw NullPointerException when `reg` is null.
    unsafe fn null_check(&mut self, reg: Reg) {
        let m = runtime::machine(self.t);
        let ok = self.asm.create_label();
        self.asm.cmp_ri(reg, 0);
        self.asm.jcc_label(Cond::Ne, ok);
        self.compile_call_obj(
            throw_new as usize,
            m.specials.null_pointer as usize,
        );
        self.asm.bind_label(ok);
    }

    // ── the per-opcode walk ────────────────────────────────────────

    /// Emit the whole method body. On `Err(Pending)` the thread has a
    /// pending exception and the partial compile must be discarded.
    ///
    /// # Safety
    ///
    /// `method` must be live, non-native, and hold a bytecode record.
    pub unsafe fn compile(
        &mut self,
        method: *mut Method,
    ) -> Result<(), CompileError> {
        let t = self.t;
        let m = runtime::machine(t);
        let class = (*method).class;
        let record = match &(*method).code {
            MethodCode::Bytecode(r) => r,
            _ => panic!("compiling a method without bytecode"),
        };
        let code = record.code.as_slice();
        let parameter_footprint = (*method).parameter_footprint_bytes();
        let local_footprint = record.max_locals * WORD;

        self.asm.push_r(Reg::Rbp);
        self.asm.mov_rr(Reg::Rbp, Reg::Rsp);
        if local_footprint > parameter_footprint {
            self.asm
                .sub_ri(Reg::Rsp, (local_footprint - parameter_footprint) as i32);
        }

        let mut line_index = 0usize;
        let mut ip = 0usize;
        while ip < code.len() {
            let ip0 = ip;
            self.java_ips.append2(ip as u16);
            self.machine_ips.append4(self.asm.len() as u32);
            // a jump or handler entry may land here with the pool
            // register holding anything
            self.pool_register_clobbered = true;

            while line_index < record.line_numbers.len()
                && record.line_numbers[line_index].ip as usize == ip
            {
                self.line_numbers.push(NativeLineNumber {
                    machine_ip: self.asm.len() as u32,
                    line: record.line_numbers[line_index].line as u32,
                });
                line_index += 1;
            }

            let instruction = read_u8(code, &mut ip);
            match instruction {
                op::AALOAD
                | op::BALOAD
                | op::CALOAD
                | op::DALOAD
                | op::FALOAD
                | op::IALOAD
                | op::LALOAD
                | op::SALOAD => {
                    let next = self.asm.create_label();
                    let out_of_bounds = self.asm.create_label();

                    self.asm.pop_r(Reg::Rcx);
                    self.asm.pop_r(Reg::Rax);

                    self.asm.cmp_ri(Reg::Rcx, 0);
                    self.asm.jcc_label(Cond::L, out_of_bounds);

                    self.asm.mov_rm(Reg::Rdx, Reg::Rax, ARRAY_LENGTH as i32);
                    self.asm.cmp_rr(Reg::Rcx, Reg::Rdx);
                    self.asm.jcc_label(Cond::Ge, out_of_bounds);

                    self.asm.add_ri(Reg::Rax, ARRAY_BODY as i32);

                    match instruction {
                        op::AALOAD | op::FALOAD | op::IALOAD => {
                            self.asm
                                .shl_ri(Reg::Rcx, WORD.trailing_zeros() as u8);
                            self.asm.add_rr(Reg::Rax, Reg::Rcx);
                            self.asm.push_m(Reg::Rax, 0);
                        }
                        op::BALOAD => {
                            self.asm.add_rr(Reg::Rax, Reg::Rcx);
                            self.asm.movsx8_rm(Reg::Rax, Reg::Rax, 0);
                            self.asm.push_r(Reg::Rax);
                        }
                        op::CALOAD => {
                            self.asm.shl_ri(Reg::Rcx, 1);
                            self.asm.add_rr(Reg::Rax, Reg::Rcx);
                            self.asm.movzx16_rm(Reg::Rax, Reg::Rax, 0);
                            self.asm.push_r(Reg::Rax);
                        }
                        op::SALOAD => {
                            self.asm.shl_ri(Reg::Rcx, 1);
                            self.asm.add_rr(Reg::Rax, Reg::Rcx);
                            self.asm.movsx16_rm(Reg::Rax, Reg::Rax, 0);
                            self.asm.push_r(Reg::Rax);
                        }
                        op::DALOAD | op::LALOAD => {
                            self.asm.shl_ri(Reg::Rcx, 3);
                            self.asm.add_rr(Reg::Rax, Reg::Rcx);
                            if WORD == 8 {
                                self.asm.push_m(Reg::Rax, 0);
                            } else {
                                self.asm.push4_m(Reg::Rax, 4);
                                self.asm.push4_m(Reg::Rax, 0);
                            }
                        }
                        _ => unreachable!(),
                    }

                    self.asm.jmp_label(next);

                    self.asm.bind_label(out_of_bounds);
                    self.compile_call_obj(
                        throw_new as usize,
                        m.specials.array_index_out_of_bounds as usize,
                    );

                    self.asm.bind_label(next);
                }

                op::AASTORE
                | op::BASTORE
                | op::CASTORE
                | op::DASTORE
                | op::FASTORE
                | op::IASTORE
                | op::LASTORE
                | op::SASTORE => {
                    let next = self.asm.create_label();
                    let out_of_bounds = self.asm.create_label();

                    let wide = matches!(instruction, op::DASTORE | op::LASTORE);
                    self.asm.pop_r(Reg::Rbx);
                    if wide && WORD == 4 {
                        self.asm.pop_r(Reg::Rdx);
                    }
                    self.asm.pop_r(Reg::Rcx);
                    self.asm.pop_r(Reg::Rax);

                    self.asm.cmp_ri(Reg::Rcx, 0);
                    self.asm.jcc_label(Cond::L, out_of_bounds);

                    self.asm.mov_rm(Reg::Rsi, Reg::Rax, ARRAY_LENGTH as i32);
                    self.asm.cmp_rr(Reg::Rcx, Reg::Rsi);
                    self.asm.jcc_label(Cond::Ge, out_of_bounds);

                    self.asm.add_ri(Reg::Rax, ARRAY_BODY as i32);

                    match instruction {
                        op::AASTORE | op::FASTORE | op::IASTORE => {
                            self.asm
                                .shl_ri(Reg::Rcx, WORD.trailing_zeros() as u8);
                            self.asm.add_rr(Reg::Rax, Reg::Rcx);
                            self.asm.mov_mr(Reg::Rax, 0, Reg::Rbx);
                        }
                        op::BASTORE => {
                            self.asm.add_rr(Reg::Rax, Reg::Rcx);
                            self.asm.mov_mr8(Reg::Rax, 0, Reg::Rbx);
                        }
                        op::CASTORE | op::SASTORE => {
                            self.asm.shl_ri(Reg::Rcx, 1);
                            self.asm.add_rr(Reg::Rax, Reg::Rcx);
                            self.asm.mov_mr16(Reg::Rax, 0, Reg::Rbx);
                        }
                        op::DASTORE | op::LASTORE => {
                            self.asm.shl_ri(Reg::Rcx, 3);
                            self.asm.add_rr(Reg::Rax, Reg::Rcx);
                            if WORD == 8 {
                                self.asm.mov_mr(Reg::Rax, 0, Reg::Rbx);
                            } else {
                                self.asm.mov_mr32(Reg::Rax, 0, Reg::Rbx);
                                self.asm.mov_mr32(Reg::Rax, 4, Reg::Rdx);
                            }
                        }
                        _ => unreachable!(),
                    }

                    self.asm.jmp_label(next);

                    self.asm.bind_label(out_of_bounds);
                    self.compile_call_obj(
                        throw_new as usize,
                        m.specials.array_index_out_of_bounds as usize,
                    );

                    self.asm.bind_label(next);
                }

                op::ACONST_NULL => self.asm.push_i32(0),

                op::ALOAD | op::ILOAD | op::FLOAD => {
                    let index = read_u8(code, &mut ip) as usize;
                    self.asm.push_m(
                        Reg::Rbp,
                        local_offset(index, parameter_footprint),
                    );
                }
                op::ALOAD_0 | op::ILOAD_0 | op::FLOAD_0 => self
                    .asm
                    .push_m(Reg::Rbp, local_offset(0, parameter_footprint)),
                op::ALOAD_1 | op::ILOAD_1 | op::FLOAD_1 => self
                    .asm
                    .push_m(Reg::Rbp, local_offset(1, parameter_footprint)),
                op::ALOAD_2 | op::ILOAD_2 | op::FLOAD_2 => self
                    .asm
                    .push_m(Reg::Rbp, local_offset(2, parameter_footprint)),
                op::ALOAD_3 | op::ILOAD_3 | op::FLOAD_3 => self
                    .asm
                    .push_m(Reg::Rbp, local_offset(3, parameter_footprint)),

                op::ANEWARRAY => {
                    let index = read_u16(code, &mut ip);
                    let class_ = runtime::resolve_class(
                        t,
                        &(*class).pool,
                        index,
                    )
                    .map_err(|_| CompileError::Pending)?;

                    let nonnegative = self.asm.create_label();

                    self.asm.pop_r(Reg::Rax);
                    self.asm.cmp_ri(Reg::Rax, 0);
                    self.asm.jcc_label(Cond::Ge, nonnegative);

                    self.compile_call_obj(
                        throw_new as usize,
                        m.specials.negative_array_size as usize,
                    );

                    self.asm.bind_label(nonnegative);
                    self.compile_call_obj_reg(
                        make_blank_object_array as usize,
                        class_ as usize,
                        Reg::Rax,
                    );
                    self.asm.push_r(Reg::Rax);
                }

                op::ARETURN | op::IRETURN | op::FRETURN => {
                    self.asm.pop_r(Reg::Rax);
                    self.asm.mov_rr(Reg::Rsp, Reg::Rbp);
                    self.asm.pop_r(Reg::Rbp);
                    self.asm.ret();
                }

                op::ARRAYLENGTH => {
                    self.asm.pop_r(Reg::Rax);
                    self.asm.push_m(Reg::Rax, ARRAY_LENGTH as i32);
                }

                op::ASTORE | op::ISTORE | op::FSTORE => {
                    let index = read_u8(code, &mut ip) as usize;
                    self.asm.pop_m(
                        Reg::Rbp,
                        local_offset(index, parameter_footprint),
                    );
                }
                op::ASTORE_0 | op::ISTORE_0 | op::FSTORE_0 => self
                    .asm
                    .pop_m(Reg::Rbp, local_offset(0, parameter_footprint)),
                op::ASTORE_1 | op::ISTORE_1 | op::FSTORE_1 => self
                    .asm
                    .pop_m(Reg::Rbp, local_offset(1, parameter_footprint)),
                op::ASTORE_2 | op::ISTORE_2 | op::FSTORE_2 => self
                    .asm
                    .pop_m(Reg::Rbp, local_offset(2, parameter_footprint)),
                op::ASTORE_3 | op::ISTORE_3 | op::FSTORE_3 => self
                    .asm
                    .pop_m(Reg::Rbp, local_offset(3, parameter_footprint)),

                op::ATHROW => {
                    self.asm.pop_r(Reg::Rax);
                    self.compile_call_reg(throw_ as usize, Reg::Rax);
                }

                op::BIPUSH => {
                    let v = read_u8(code, &mut ip) as i8;
                    self.asm.push_i32(v as i32);
                }

                op::CHECKCAST => {
                    let index = read_u16(code, &mut ip);
                    let class_ = runtime::resolve_class(
                        t,
                        &(*class).pool,
                        index,
                    )
                    .map_err(|_| CompileError::Pending)?;

                    let next = self.asm.create_label();

                    self.asm.mov_rm(Reg::Rax, Reg::Rsp, 0);
                    self.asm.cmp_ri(Reg::Rax, 0);
                    self.asm.jcc_label(Cond::E, next);

                    let off = self.pool_reference(class_ as usize);
                    self.asm.mov_rm(Reg::Rcx, POOL_REGISTER, off);
                    self.asm.mov_rm(Reg::Rax, Reg::Rax, 0);
                    self.asm.cmp_rr(Reg::Rax, Reg::Rcx);
                    self.asm.jcc_label(Cond::E, next);

                    self.compile_call_reg_reg(
                        is_assignable_from as usize,
                        Reg::Rcx,
                        Reg::Rax,
                    );
                    self.asm.cmp_ri(Reg::Rax, 0);
                    self.asm.jcc_label(Cond::Ne, next);

                    self.compile_call_obj(
                        throw_new as usize,
                        m.specials.class_cast as usize,
                    );

                    self.asm.bind_label(next);
                }

                op::DUP => self.asm.push_m(Reg::Rsp, 0),

                op::GETFIELD => {
                    let index = read_u16(code, &mut ip);
                    let field = runtime::resolve_field(
                        t,
                        &(*class).pool,
                        index,
                    )
                    .map_err(|_| CompileError::Pending)?;
                    let offset = (*field).offset as i32;

                    self.asm.pop_r(Reg::Rax);
                    self.null_check(Reg::Rax);

                    match (*field).code {
                        FieldCode::Byte | FieldCode::Boolean => {
                            self.asm.movsx8_rm(Reg::Rax, Reg::Rax, offset);
                            self.asm.push_r(Reg::Rax);
                        }
                        FieldCode::Char => {
                            self.asm.movzx16_rm(Reg::Rax, Reg::Rax, offset);
                            self.asm.push_r(Reg::Rax);
                        }
                        FieldCode::Short => {
                            self.asm.movsx16_rm(Reg::Rax, Reg::Rax, offset);
                            self.asm.push_r(Reg::Rax);
                        }
                        FieldCode::Int => {
                            self.asm.movsxd_rm(Reg::Rax, Reg::Rax, offset);
                            self.asm.push_r(Reg::Rax);
                        }
                        FieldCode::Float => {
                            self.asm.mov_rm32(Reg::Rax, Reg::Rax, offset);
                            self.asm.push_r(Reg::Rax);
                        }
                        FieldCode::Double | FieldCode::Long => {
                            if WORD == 8 {
                                self.asm.push_m(Reg::Rax, offset);
                            } else {
                                self.asm.push4_m(Reg::Rax, offset + 4);
                                self.asm.push4_m(Reg::Rax, offset);
                            }
                        }
                        FieldCode::Object => {
                            self.asm.push_m(Reg::Rax, offset);
                        }
                        FieldCode::Void => {
                            panic!("void field")
                        }
                    }
                }

                op::GETSTATIC => {
                    let index = read_u16(code, &mut ip);
                    let field = runtime::resolve_field(
                        t,
                        &(*class).pool,
                        index,
                    )
                    .map_err(|_| CompileError::Pending)?;

                    runtime::init_class(t, (*field).class);
                    if !(*t).exception.is_null() {
                        return Err(CompileError::Pending);
                    }

                    let table = (*(*field).class).static_table;
                    debug_assert!(!table.is_null());
                    let slot_offset =
                        (ARRAY_BODY + (*field).offset * WORD) as i32;

                    let off = self.pool_reference(table as usize);
                    self.asm.mov_rm(Reg::Rax, POOL_REGISTER, off);
                    self.asm.mov_rm(Reg::Rax, Reg::Rax, slot_offset);

                    match (*field).code {
                        FieldCode::Byte
                        | FieldCode::Boolean
                        | FieldCode::Char
                        | FieldCode::Short
                        | FieldCode::Float
                        | FieldCode::Int => {
                            let zero = self.asm.create_label();
                            let next = self.asm.create_label();

                            self.asm.cmp_ri(Reg::Rax, 0);
                            self.asm.jcc_label(Cond::E, zero);
                            match (*field).code {
                                FieldCode::Char | FieldCode::Float => {
                                    self.asm.mov_rm32(
                                        Reg::Rax,
                                        Reg::Rax,
                                        object::BOX_VALUE as i32,
                                    );
                                }
                                _ => {
                                    self.asm.movsxd_rm(
                                        Reg::Rax,
                                        Reg::Rax,
                                        object::BOX_VALUE as i32,
                                    );
                                }
                            }
                            self.asm.push_r(Reg::Rax);
                            self.asm.jmp_label(next);

                            self.asm.bind_label(zero);
                            self.asm.push_i32(0);

                            self.asm.bind_label(next);
                        }
                        FieldCode::Double | FieldCode::Long => {
                            let zero = self.asm.create_label();
                            let next = self.asm.create_label();

                            self.asm.cmp_ri(Reg::Rax, 0);
                            self.asm.jcc_label(Cond::E, zero);
                            if WORD == 8 {
                                self.asm.push_m(
                                    Reg::Rax,
                                    object::BOX_VALUE as i32,
                                );
                            } else {
                                self.asm.push4_m(
                                    Reg::Rax,
                                    object::BOX_VALUE as i32 + 4,
                                );
                                self.asm.push4_m(
                                    Reg::Rax,
                                    object::BOX_VALUE as i32,
                                );
                            }
                            self.asm.jmp_label(next);

                            self.asm.bind_label(zero);
                            self.asm.push_i32(0);
                            if WORD == 4 {
                                self.asm.push_i32(0);
                            }

                            self.asm.bind_label(next);
                        }
                        FieldCode::Object => {
                            self.asm.push_r(Reg::Rax);
                        }
                        FieldCode::Void => panic!("void field"),
                    }
                }

                op::GOTO => {
                    let offset = read_i16(code, &mut ip);
                    self.jump_to_java_ip((ip0 as i32 + offset as i32) as u16);
                }
                op::GOTO_W => {
                    let offset = read_i32(code, &mut ip);
                    self.jump_to_java_ip((ip0 as i32 + offset) as u16);
                }

                op::I2B => {
                    self.asm.mov_rm(Reg::Rax, Reg::Rsp, 0);
                    self.asm.movsx8_rr(Reg::Rax, Reg::Rax);
                    self.asm.mov_mr(Reg::Rsp, 0, Reg::Rax);
                }
                op::I2C => {
                    self.asm.mov_rm(Reg::Rax, Reg::Rsp, 0);
                    self.asm.movzx16_rr(Reg::Rax, Reg::Rax);
                    self.asm.mov_mr(Reg::Rsp, 0, Reg::Rax);
                }
                op::I2S => {
                    self.asm.mov_rm(Reg::Rax, Reg::Rsp, 0);
                    self.asm.movsx16_rr(Reg::Rax, Reg::Rax);
                    self.asm.mov_mr(Reg::Rsp, 0, Reg::Rax);
                }

                op::IADD => {
                    self.asm.pop_r(Reg::Rax);
                    self.asm.pop_r(Reg::Rcx);
                    self.asm.add_rr(Reg::Rcx, Reg::Rax);
                    self.asm.push_r(Reg::Rcx);
                }
                op::ISUB => {
                    self.asm.pop_r(Reg::Rax);
                    self.asm.pop_r(Reg::Rcx);
                    self.asm.sub_rr(Reg::Rcx, Reg::Rax);
                    self.asm.push_r(Reg::Rcx);
                }

                op::ICONST_M1 => self.asm.push_i32(-1),
                op::ICONST_0 => self.asm.push_i32(0),
                op::ICONST_1 => self.asm.push_i32(1),
                op::ICONST_2 => self.asm.push_i32(2),
                op::ICONST_3 => self.asm.push_i32(3),
                op::ICONST_4 => self.asm.push_i32(4),
                op::ICONST_5 => self.asm.push_i32(5),

                op::IF_ACMPEQ | op::IF_ICMPEQ => {
                    let offset = read_i16(code, &mut ip);
                    self.asm.pop_r(Reg::Rax);
                    self.asm.pop_r(Reg::Rcx);
                    self.asm.cmp_rr(Reg::Rcx, Reg::Rax);
                    self.branch_to_java_ip(
                        Cond::E,
                        (ip0 as i32 + offset as i32) as u16,
                    );
                }
                op::IF_ACMPNE | op::IF_ICMPNE => {
                    let offset = read_i16(code, &mut ip);
                    self.asm.pop_r(Reg::Rax);
                    self.asm.pop_r(Reg::Rcx);
                    self.asm.cmp_rr(Reg::Rcx, Reg::Rax);
                    self.branch_to_java_ip(
                        Cond::Ne,
                        (ip0 as i32 + offset as i32) as u16,
                    );
                }
                op::IF_ICMPGT
                | op::IF_ICMPGE
                | op::IF_ICMPLT
                | op::IF_ICMPLE => {
                    let offset = read_i16(code, &mut ip);
                    let cond = match instruction {
                        op::IF_ICMPGT => Cond::G,
                        op::IF_ICMPGE => Cond::Ge,
                        op::IF_ICMPLT => Cond::L,
                        _ => Cond::Le,
                    };
                    self.asm.pop_r(Reg::Rax);
                    self.asm.pop_r(Reg::Rcx);
                    self.asm.cmp_rr(Reg::Rcx, Reg::Rax);
                    self.branch_to_java_ip(
                        cond,
                        (ip0 as i32 + offset as i32) as u16,
                    );
                }

                op::IFEQ | op::IFNULL => {
                    let offset = read_i16(code, &mut ip);
                    self.asm.pop_r(Reg::Rax);
                    self.asm.cmp_ri(Reg::Rax, 0);
                    self.branch_to_java_ip(
                        Cond::E,
                        (ip0 as i32 + offset as i32) as u16,
                    );
                }
                op::IFNE | op::IFNONNULL => {
                    let offset = read_i16(code, &mut ip);
                    self.asm.pop_r(Reg::Rax);
                    self.asm.cmp_ri(Reg::Rax, 0);
                    self.branch_to_java_ip(
                        Cond::Ne,
                        (ip0 as i32 + offset as i32) as u16,
                    );
                }
                op::IFGT | op::IFGE | op::IFLT | op::IFLE => {
                    let offset = read_i16(code, &mut ip);
                    let cond = match instruction {
                        op::IFGT => Cond::G,
                        op::IFGE => Cond::Ge,
                        op::IFLT => Cond::L,
                        _ => Cond::Le,
                    };
                    self.asm.pop_r(Reg::Rax);
                    self.asm.cmp_ri(Reg::Rax, 0);
                    self.branch_to_java_ip(
                        cond,
                        (ip0 as i32 + offset as i32) as u16,
                    );
                }

                op::IINC => {
                    let index = read_u8(code, &mut ip) as usize;
                    let c = read_u8(code, &mut ip) as i8;
                    self.asm.add_mi(
                        Reg::Rbp,
                        local_offset(index, parameter_footprint),
                        c as i32,
                    );
                }

                op::INSTANCEOF => {
                    let index = read_u16(code, &mut ip);
                    let class_ = runtime::resolve_class(
                        t,
                        &(*class).pool,
                        index,
                    )
                    .map_err(|_| CompileError::Pending)?;

                    let call = self.asm.create_label();
                    let zero = self.asm.create_label();
                    let next = self.asm.create_label();

                    self.asm.pop_r(Reg::Rax);
                    self.asm.cmp_ri(Reg::Rax, 0);
                    self.asm.jcc_label(Cond::E, zero);

                    let off = self.pool_reference(class_ as usize);
                    self.asm.mov_rm(Reg::Rcx, POOL_REGISTER, off);
                    self.asm.mov_rm(Reg::Rax, Reg::Rax, 0);
                    self.asm.cmp_rr(Reg::Rax, Reg::Rcx);
                    self.asm.jcc_label(Cond::Ne, call);

                    self.asm.push_i32(1);
                    self.asm.jmp_label(next);

                    self.asm.bind_label(call);
                    self.compile_call_reg_reg(
                        is_assignable_from as usize,
                        Reg::Rcx,
                        Reg::Rax,
                    );
                    self.asm.push_r(Reg::Rax);
                    self.asm.jmp_label(next);

                    self.asm.bind_label(zero);
                    self.asm.push_i32(0);

                    self.asm.bind_label(next);
                }

                op::INVOKESPECIAL => {
                    let index = read_u16(code, &mut ip);
                    let mut target = runtime::resolve_method(
                        t,
                        &(*class).pool,
                        index,
                    )
                    .map_err(|_| CompileError::Pending)?;

                    // a super call re-binds on the direct superclass
                    if (*target).is_virtual()
                        && !(*class).super_class.is_null()
                    {
                        target = runtime::resolve_method_by_name(
                            t,
                            (*class).super_class,
                            &(*target).name,
                            &(*target).spec,
                        )
                        .map_err(|_| CompileError::Pending)?;
                    }

                    self.compile_direct_invoke(target);
                }

                op::INVOKESTATIC => {
                    let index = read_u16(code, &mut ip);
                    let target = runtime::resolve_method(
                        t,
                        &(*class).pool,
                        index,
                    )
                    .map_err(|_| CompileError::Pending)?;

                    runtime::init_class(t, (*target).class);
                    if !(*t).exception.is_null() {
                        return Err(CompileError::Pending);
                    }

                    self.compile_direct_invoke(target);
                }

                op::INVOKEVIRTUAL => {
                    let index = read_u16(code, &mut ip);
                    let target = runtime::resolve_method(
                        t,
                        &(*class).pool,
                        index,
                    )
                    .map_err(|_| CompileError::Pending)?;

                    let parameter_footprint =
                        (*target).parameter_footprint_bytes();
                    let instance = (parameter_footprint - WORD) as i32;
                    let footprint = FRAME_FOOTPRINT + parameter_footprint;
                    let slot_offset = (ARRAY_BODY
                        + (*target).vtable_index * WORD)
                        as i32;

                    self.asm.mov_rm(Reg::Rax, Reg::Rsp, instance);
                    self.null_check(Reg::Rax);
                    self.asm.mov_rm(Reg::Rax, Reg::Rax, 0);
                    self.asm.mov_rm(
                        Reg::Rax,
                        Reg::Rax,
                        core::mem::offset_of!(Class, vtable) as i32,
                    );
                    self.asm.mov_rm(Reg::Rax, Reg::Rax, slot_offset);

                    self.asm.push_r(Reg::Rbp);
                    self.asm.push_r(Reg::Rax);
                    self.asm.push_m(Reg::Rbp, FRAME_THREAD);

                    self.asm.mov_rm(
                        Reg::Rax,
                        Reg::Rax,
                        core::mem::offset_of!(Method, code_entry) as i32,
                    );
                    self.asm.call_r(Reg::Rax);
                    self.pool_register_clobbered = true;

                    self.asm.add_ri(Reg::Rsp, footprint as i32);

                    self.push_return_value((*target).return_code);
                }

                op::LDC | op::LDC_W => {
                    let index = if instruction == op::LDC {
                        read_u8(code, &mut ip) as u16
                    } else {
                        read_u16(code, &mut ip)
                    };

                    match (*class).pool.get(index) {
                        Some(PoolEntry::Int(v)) => self.asm.push_i32(*v),
                        Some(PoolEntry::Float(v)) => {
                            self.asm.push_i32(v.to_bits() as i32)
                        }
                        Some(PoolEntry::Str(s)) => {
                            let off = self.pool_reference(*s as usize);
                            self.asm.push_m(POOL_REGISTER, off);
                        }
                        Some(PoolEntry::Class(_))
                        | Some(PoolEntry::Unresolved(_)) => {
                            let class_ = runtime::resolve_class(
                                t,
                                &(*class).pool,
                                index,
                            )
                            .map_err(|_| CompileError::Pending)?;
                            let off =
                                self.pool_reference(class_ as usize);
                            self.asm.push_m(POOL_REGISTER, off);
                        }
                        _ => panic!("pool entry {index} is not loadable"),
                    }
                }

                op::NEW => {
                    let index = read_u16(code, &mut ip);
                    let class_ = runtime::resolve_class(
                        t,
                        &(*class).pool,
                        index,
                    )
                    .map_err(|_| CompileError::Pending)?;

                    runtime::init_class(t, class_);
                    if !(*t).exception.is_null() {
                        return Err(CompileError::Pending);
                    }

                    if (*class_).flags.contains(ClassFlags::WEAK_REFERENCE) {
                        self.compile_call_obj(
                            make_new_weak_reference as usize,
                            class_ as usize,
                        );
                    } else {
                        self.compile_call_obj(
                            make_new as usize,
                            class_ as usize,
                        );
                    }
                    self.asm.push_r(Reg::Rax);
                }

                op::NEWARRAY => {
                    let type_code = read_u8(code, &mut ip);

                    let nonnegative = self.asm.create_label();

                    self.asm.pop_r(Reg::Rax);
                    self.asm.cmp_ri(Reg::Rax, 0);
                    self.asm.jcc_label(Cond::Ge, nonnegative);

                    self.compile_call_obj(
                        throw_new as usize,
                        m.specials.negative_array_size as usize,
                    );

                    self.asm.bind_label(nonnegative);

                    let constructor: ArrayConstructor = match type_code {
                        op::T_BOOLEAN => runtime::make_boolean_array,
                        op::T_CHAR => runtime::make_char_array,
                        op::T_FLOAT => runtime::make_float_array,
                        op::T_DOUBLE => runtime::make_double_array,
                        op::T_BYTE => runtime::make_byte_array,
                        op::T_SHORT => runtime::make_short_array,
                        op::T_INT => runtime::make_int_array,
                        op::T_LONG => runtime::make_long_array,
                        _ => panic!("bad array type code {type_code}"),
                    };

                    self.compile_call_imm_reg(
                        make_blank_array as usize,
                        constructor as usize,
                        Reg::Rax,
                    );
                    self.asm.push_r(Reg::Rax);
                }

                op::POP => self.asm.add_ri(Reg::Rsp, WORD as i32),

                op::PUTFIELD => {
                    let index = read_u16(code, &mut ip);
                    let field = runtime::resolve_field(
                        t,
                        &(*class).pool,
                        index,
                    )
                    .map_err(|_| CompileError::Pending)?;
                    let offset = (*field).offset as i32;

                    match (*field).code {
                        FieldCode::Byte
                        | FieldCode::Boolean
                        | FieldCode::Char
                        | FieldCode::Short
                        | FieldCode::Float
                        | FieldCode::Int => {
                            self.asm.pop_r(Reg::Rcx);
                            self.asm.pop_r(Reg::Rax);
                            self.null_check(Reg::Rax);
                            match (*field).code {
                                FieldCode::Byte | FieldCode::Boolean => {
                                    self.asm
                                        .mov_mr8(Reg::Rax, offset, Reg::Rcx);
                                }
                                FieldCode::Char | FieldCode::Short => {
                                    self.asm
                                        .mov_mr16(Reg::Rax, offset, Reg::Rcx);
                                }
                                _ => {
                                    self.asm
                                        .mov_mr32(Reg::Rax, offset, Reg::Rcx);
                                }
                            }
                        }
                        FieldCode::Double | FieldCode::Long => {
                            if WORD == 8 {
                                self.asm.pop_r(Reg::Rcx);
                                self.asm.pop_r(Reg::Rax);
                                self.null_check(Reg::Rax);
                                self.asm.mov_mr(Reg::Rax, offset, Reg::Rcx);
                            } else {
                                self.asm.pop_r(Reg::Rcx);
                                self.asm.pop_r(Reg::Rdx);
                                self.asm.pop_r(Reg::Rax);
                                self.null_check(Reg::Rax);
                                self.asm
                                    .mov_mr32(Reg::Rax, offset, Reg::Rcx);
                                self.asm.mov_mr32(
                                    Reg::Rax,
                                    offset + 4,
                                    Reg::Rdx,
                                );
                            }
                        }
                        FieldCode::Object => {
                            self.asm.pop_r(Reg::Rcx);
                            self.asm.pop_r(Reg::Rax);
                            self.null_check(Reg::Rax);
                            self.asm.mov_mr(Reg::Rax, offset, Reg::Rcx);
                        }
                        FieldCode::Void => panic!("void field"),
                    }
                }

                op::PUTSTATIC => {
                    let index = read_u16(code, &mut ip);
                    let field = runtime::resolve_field(
                        t,
                        &(*class).pool,
                        index,
                    )
                    .map_err(|_| CompileError::Pending)?;

                    runtime::init_class(t, (*field).class);
                    if !(*t).exception.is_null() {
                        return Err(CompileError::Pending);
                    }

                    let table = (*(*field).class).static_table;
                    debug_assert!(!table.is_null());
                    let slot_offset =
                        (ARRAY_BODY + (*field).offset * WORD) as i32;

                    match (*field).code {
                        FieldCode::Byte
                        | FieldCode::Boolean
                        | FieldCode::Char
                        | FieldCode::Short
                        | FieldCode::Float
                        | FieldCode::Int => {
                            self.compile_call_obj(
                                make_new as usize,
                                m.specials.int_box as usize,
                            );
                            self.asm.pop4_m(
                                Reg::Rax,
                                object::BOX_VALUE as i32,
                            );
                            let off = self.pool_reference(table as usize);
                            self.asm.mov_rm(Reg::Rcx, POOL_REGISTER, off);
                            self.asm
                                .mov_mr(Reg::Rcx, slot_offset, Reg::Rax);
                        }
                        FieldCode::Double | FieldCode::Long => {
                            self.compile_call_obj(
                                make_new as usize,
                                m.specials.long_box as usize,
                            );
                            if WORD == 8 {
                                self.asm.pop_r(Reg::Rcx);
                                self.asm.mov_mr(
                                    Reg::Rax,
                                    object::BOX_VALUE as i32,
                                    Reg::Rcx,
                                );
                            } else {
                                self.asm.pop4_m(
                                    Reg::Rax,
                                    object::BOX_VALUE as i32,
                                );
                                self.asm.pop4_m(
                                    Reg::Rax,
                                    object::BOX_VALUE as i32 + 4,
                                );
                            }
                            let off = self.pool_reference(table as usize);
                            self.asm.mov_rm(Reg::Rcx, POOL_REGISTER, off);
                            self.asm
                                .mov_mr(Reg::Rcx, slot_offset, Reg::Rax);
                        }
                        FieldCode::Object => {
                            self.asm.pop_r(Reg::Rcx);
                            let off = self.pool_reference(table as usize);
                            self.asm.mov_rm(Reg::Rax, POOL_REGISTER, off);
                            self.asm
                                .mov_mr(Reg::Rax, slot_offset, Reg::Rcx);
                        }
                        FieldCode::Void => panic!("void field"),
                    }
                }

                op::RETURN => {
                    self.asm.mov_rr(Reg::Rsp, Reg::Rbp);
                    self.asm.pop_r(Reg::Rbp);
                    self.asm.ret();
                }

                op::SIPUSH => {
                    let v = read_i16(code, &mut ip);
                    self.asm.push_i32(v as i32);
                }

                other => panic!(
                    "unknown opcode {other:#04x} at bytecode ip {ip0}"
                ),
            }
        }

        self.resolve_jumps();
        self.build_handler_table(method)?;
        Ok(())
    }

    fn build_handler_table(
        &mut self,
        method: *mut Method,
    ) -> Result<(), CompileError> {
        // SAFETY: compile() established the method holds bytecode
        let (record, class) = unsafe {
            match &(*method).code {
                MethodCode::Bytecode(r) => (r, (*method).class),
                _ => unreachable!(),
            }
        };
        for handler in &record.handlers {
            let catch_type = if handler.catch_type != 0 {
                // SAFETY: the thread and class outlive compilation
                let class_ = unsafe {
                    runtime::resolve_class(
                        self.t,
                        &(*class).pool,
                        handler.catch_type,
                    )
                }
                .map_err(|_| CompileError::Pending)?;
                self.pool_index(class_ as usize) as u32 + 1
            } else {
                0
            };
            self.handlers.push(NativeHandler {
                start: self.machine_ip_for_java_ip(handler.start),
                end: self.machine_ip_for_java_ip(handler.end),
                ip: self.machine_ip_for_java_ip(handler.handler),
                catch_type,
            });
        }
        Ok(())
    }

    /// Seal the code, rebase the recorded absolute-address immediates
    /// against the final placement, and hand back the record plus the
    /// pool contents to realize.
    pub fn finish(
        self,
    ) -> Result<(Box<Compiled>, Vec<usize>), CompileError> {
        let Compiler {
            asm,
            line_numbers,
            handlers,
            pool,
            code_relocs,
            jumps,
            java_ips,
            machine_ips,
            ..
        } = self;
        if jumps.is_exhausted()
            || java_ips.is_exhausted()
            || machine_ips.is_exhausted()
        {
            return Err(CompileError::OutOfMemory);
        }
        let code = asm.finish()?;
        let compiled = Compiled::new(&code, &line_numbers, &handlers)
            .ok_or(CompileError::OutOfMemory)?;

        let base = compiled.entry() as usize;
        for reloc in &code_relocs {
            // SAFETY: the immediate lies inside the freshly copied,
            // still-unpublished code region
            unsafe {
                (compiled.entry().add(reloc.imm_offset) as *mut usize)
                    .write_unaligned(base + reloc.target);
            }
        }

        Ok((compiled, pool))
    }

    #[cfg(test)]
    pub(crate) fn ip_map_for_tests(&self) -> Vec<(u16, u32)> {
        (0..self.java_ips.length() / 2)
            .map(|i| {
                (self.java_ips.get2(i * 2), self.machine_ips.get4(i * 4))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{self, ClassBuilder};
    use object::{CodeRecord, MethodFlags};

    #[test]
    fn ip_map_is_monotonic_and_covers_branch_targets() {
        let machine = bootstrap::machine();
        let t = machine
            .make_thread(core::ptr::null_mut(), core::ptr::null_mut());

        // int sum(int n) { int acc = 0; for (int i = 1; i <= n; i++) acc += i; return acc; }
        let class = ClassBuilder::new(&machine, "IpMap")
            .extends(machine.specials.object)
            .method(
                "sum",
                "(I)I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![
                        0x03, 0x3C, 0x04, 0x3D, 0x1C, 0x1A, 0xA3, 0x00,
                        0x0D, 0x1B, 0x1C, 0x60, 0x3C, 0x84, 0x02, 0x01,
                        0xA7, 0xFF, 0xF4, 0x1B, 0xAC,
                    ],
                    3,
                )),
            )
            .build();

        // SAFETY: fresh single-threaded machine
        unsafe {
            let method = object::Class::find_method(class, "sum", "(I)I")
                .expect("sum method");
            let mut c = Compiler::new(t);
            c.compile(method).expect("compile");

            let map = c.ip_map_for_tests();
            assert!(!map.is_empty());
            for pair in map.windows(2) {
                assert!(pair[0].0 < pair[1].0, "bytecode ips out of order");
                assert!(
                    pair[0].1 <= pair[1].1,
                    "machine ips not monotonic"
                );
            }
            // both branch targets are instruction boundaries
            let code_len = c.asm.len() as u32;
            for target in [4u16, 19u16] {
                let machine_ip = c.machine_ip_for_java_ip(target);
                assert!(machine_ip < code_len);
            }
        }
    }

    #[test]
    fn local_offsets_split_args_and_locals() {
        let pf = 2 * WORD;
        // parameters sit above the frame header, first parameter highest
        assert_eq!(local_offset(0, pf), (6 * WORD) as i32);
        assert_eq!(local_offset(1, pf), (5 * WORD) as i32);
        // remaining locals grow downward from the saved base
        assert_eq!(local_offset(2, pf), -(WORD as i32));
        assert_eq!(local_offset(3, pf), -(2 * WORD as i32));
    }

    #[test]
    fn local_offsets_with_no_parameters() {
        assert_eq!(local_offset(0, 0), -(WORD as i32));
        assert_eq!(local_offset(1, 0), -(2 * WORD as i32));
    }
}
