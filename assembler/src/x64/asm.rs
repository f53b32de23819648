use std::fmt;

use crate::buffer::Buffer;

/// Bytes per machine word; selects between the 32-bit and 64-bit
/// instruction encodings.
pub const WORD: usize = core::mem::size_of::<usize>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerError {
    LabelUnbound { label: usize },
    OutOfMemory,
    EmptyFunction,
}

impl fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LabelUnbound { label } => {
                write!(f, "label L{label} is unbound")
            }
            Self::OutOfMemory => write!(f, "code buffer exhausted"),
            Self::EmptyFunction => write!(f, "cannot finish empty function"),
        }
    }
}

impl std::error::Error for AssemblerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

struct LabelState {
    target: Option<usize>,
    /// Offsets of 32-bit displacement slots waiting for the target.
    refs: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    #[inline]
    fn enc(self) -> u8 {
        match self {
            Self::Rax => 0,
            Self::Rcx => 1,
            Self::Rdx => 2,
            Self::Rbx => 3,
            Self::Rsp => 4,
            Self::Rbp => 5,
            Self::Rsi => 6,
            Self::Rdi => 7,
            Self::R8 => 8,
            Self::R9 => 9,
            Self::R10 => 10,
            Self::R11 => 11,
            Self::R12 => 12,
            Self::R13 => 13,
            Self::R14 => 14,
            Self::R15 => 15,
        }
    }

    #[inline]
    fn low3(self) -> u8 {
        self.enc() & 0b111
    }

    #[inline]
    fn high(self) -> bool {
        (self.enc() & 0b1000) != 0
    }
}

/// Condition codes for `jcc` encodings (second opcode byte is
/// `0x80 | cc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    E,
    Ne,
    L,
    Ge,
    G,
    Le,
}

impl Cond {
    #[inline]
    fn cc(self) -> u8 {
        match self {
            Self::E => 0x4,
            Self::Ne => 0x5,
            Self::L => 0xC,
            Self::Ge => 0xD,
            Self::G => 0xF,
            Self::Le => 0xE,
        }
    }
}

#[inline]
fn is_byte(v: i32) -> bool {
    v == (v as i8) as i32
}

/// Linear x86 / x86-64 instruction emitter over a [`Buffer`].
///
/// Covers the subset a template compiler needs: word moves in register,
/// immediate and `[base + displacement]` forms with 1/2/4-byte widths and
/// sign/zero extension, push/pop, add/sub/or/and, shifts, compares, local
/// labels, conditional and unconditional branches, direct and indirect
/// calls. Displacements are encoded in the shortest correct form.
pub struct Assembler {
    pub code: Buffer,
    labels: Vec<LabelState>,
    unresolved: usize,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            code: Buffer::new(1024),
            labels: Vec::new(),
            unresolved: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.code.length()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    // ── labels ─────────────────────────────────────────────────────

    pub fn create_label(&mut self) -> Label {
        let idx = self.labels.len();
        self.labels.push(LabelState {
            target: None,
            refs: Vec::new(),
        });
        self.unresolved += 1;
        Label(idx)
    }

    /// Bind `label` to the current position and back-patch every
    /// reference as a 32-bit pc-relative displacement.
    pub fn bind_label(&mut self, label: Label) {
        let here = self.code.length();
        let state = &mut self.labels[label.0];
        assert!(state.target.is_none(), "label L{} bound twice", label.0);
        state.target = Some(here);
        self.unresolved -= 1;
        let refs = core::mem::take(&mut state.refs);
        for slot in refs {
            self.code.patch4(slot, (here as i64 - (slot as i64 + 4)) as u32);
        }
    }

    fn label_disp32(&mut self, label: Label) {
        let state = &mut self.labels[label.0];
        match state.target {
            Some(target) => {
                let disp =
                    target as i64 - (self.code.length() as i64 + 4);
                self.code.append4(disp as u32);
            }
            None => {
                state.refs.push(self.code.length());
                self.code.append4(0);
            }
        }
    }

    // ── prefixes and operands ──────────────────────────────────────

    #[inline]
    fn emit_rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        let rex = 0x40
            | ((w as u8) << 3)
            | ((r as u8) << 2)
            | ((x as u8) << 1)
            | (b as u8);
        if rex != 0x40 {
            self.code.append1(rex);
        }
    }

    /// Operand-size prefix for word-sized integer instructions.
    #[inline]
    fn rex_word(&mut self, reg: Reg, base: Reg) {
        self.emit_rex(WORD == 8, reg.high(), false, base.high());
    }

    #[inline]
    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        debug_assert!(mode < 4 && reg < 8 && rm < 8);
        self.code.append1((mode << 6) | (reg << 3) | rm);
    }

    /// `[base + disp]` operand in the shortest correct encoding: no
    /// displacement byte when it is zero and the base allows it, an 8-bit
    /// displacement when in range, a 32-bit one otherwise.
    fn mem_operand(&mut self, reg_field: u8, base: Reg, disp: i32) {
        let base_low = base.low3();
        // rbp-class bases have no disp-free form; rsp-class need a SIB
        let force_disp = base_low == 0b101;
        if disp == 0 && !force_disp {
            self.modrm(0b00, reg_field, base_low);
            if base_low == 0b100 {
                self.code.append1(0x24);
            }
        } else if is_byte(disp) {
            self.modrm(0b01, reg_field, base_low);
            if base_low == 0b100 {
                self.code.append1(0x24);
            }
            self.code.append1(disp as u8);
        } else {
            self.modrm(0b10, reg_field, base_low);
            if base_low == 0b100 {
                self.code.append1(0x24);
            }
            self.code.append4(disp as u32);
        }
    }

    // ── register moves ─────────────────────────────────────────────

    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_word(src, dst);
        self.code.append1(0x89);
        self.modrm(0b11, src.low3(), dst.low3());
    }

    /// Load a word-sized immediate.
    pub fn mov_ri(&mut self, dst: Reg, imm: u64) {
        self.emit_rex(WORD == 8, false, false, dst.high());
        self.code.append1(0xB8 + dst.low3());
        if WORD == 8 {
            self.code.append8(imm);
        } else {
            self.code.append4(imm as u32);
        }
    }

    /// Like [`mov_ri`](Self::mov_ri), padded with `nop`s so the immediate
    /// field lands on a word boundary. A word-aligned immediate can later
    /// be overwritten with a single tear-free store.
    pub fn aligned_mov_ri(&mut self, dst: Reg, imm: u64) {
        let prefix = if WORD == 8 { 2 } else { 1 };
        while (self.code.length() + prefix) % WORD != 0 {
            self.nop();
        }
        self.mov_ri(dst, imm);
    }

    /// Byte offset of the immediate field relative to the end of the
    /// `mov_ri` encoding.
    pub const fn mov_ri_imm_offset() -> usize {
        WORD
    }

    // ── memory moves ───────────────────────────────────────────────

    /// `dst ← [base + disp]`, word-sized.
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_word(dst, base);
        self.code.append1(0x8B);
        self.mem_operand(dst.low3(), base, disp);
    }

    /// `[base + disp] ← src`, word-sized.
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_word(src, base);
        self.code.append1(0x89);
        self.mem_operand(src.low3(), base, disp);
    }

    /// `dst ← [base + disp]`, 32-bit load, upper bits zeroed.
    pub fn mov_rm32(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex(false, dst.high(), false, base.high());
        self.code.append1(0x8B);
        self.mem_operand(dst.low3(), base, disp);
    }

    /// `dst ← [base + disp]`, 32-bit load sign-extended to a word.
    pub fn movsxd_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        if WORD == 8 {
            self.emit_rex(true, dst.high(), false, base.high());
            self.code.append1(0x63);
            self.mem_operand(dst.low3(), base, disp);
        } else {
            self.mov_rm32(dst, base, disp);
        }
    }

    /// `[base + disp] ← src`, 32-bit store.
    pub fn mov_mr32(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit_rex(false, src.high(), false, base.high());
        self.code.append1(0x89);
        self.mem_operand(src.low3(), base, disp);
    }

    /// `[base + disp] ← src`, 16-bit store.
    pub fn mov_mr16(&mut self, base: Reg, disp: i32, src: Reg) {
        self.code.append1(0x66);
        self.emit_rex(false, src.high(), false, base.high());
        self.code.append1(0x89);
        self.mem_operand(src.low3(), base, disp);
    }

    /// `[base + disp] ← src`, 8-bit store.
    pub fn mov_mr8(&mut self, base: Reg, disp: i32, src: Reg) {
        // sil/dil/bpl/spl need an explicit REX even without high bits
        let force = WORD == 8
            && matches!(src, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi);
        let rex = 0x40
            | ((src.high() as u8) << 2)
            | (base.high() as u8);
        if rex != 0x40 || force {
            self.code.append1(rex);
        }
        self.code.append1(0x88);
        self.mem_operand(src.low3(), base, disp);
    }

    // ── sign and zero extension ────────────────────────────────────

    pub fn movsx8_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex(WORD == 8, dst.high(), false, src.high());
        self.code.append1(0x0F);
        self.code.append1(0xBE);
        self.modrm(0b11, dst.low3(), src.low3());
    }

    pub fn movsx8_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex(WORD == 8, dst.high(), false, base.high());
        self.code.append1(0x0F);
        self.code.append1(0xBE);
        self.mem_operand(dst.low3(), base, disp);
    }

    pub fn movzx8_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex(WORD == 8, dst.high(), false, base.high());
        self.code.append1(0x0F);
        self.code.append1(0xB6);
        self.mem_operand(dst.low3(), base, disp);
    }

    pub fn movsx16_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex(WORD == 8, dst.high(), false, src.high());
        self.code.append1(0x0F);
        self.code.append1(0xBF);
        self.modrm(0b11, dst.low3(), src.low3());
    }

    pub fn movsx16_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex(WORD == 8, dst.high(), false, base.high());
        self.code.append1(0x0F);
        self.code.append1(0xBF);
        self.mem_operand(dst.low3(), base, disp);
    }

    pub fn movzx16_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex(WORD == 8, dst.high(), false, src.high());
        self.code.append1(0x0F);
        self.code.append1(0xB7);
        self.modrm(0b11, dst.low3(), src.low3());
    }

    pub fn movzx16_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex(WORD == 8, dst.high(), false, base.high());
        self.code.append1(0x0F);
        self.code.append1(0xB7);
        self.mem_operand(dst.low3(), base, disp);
    }

    // ── push and pop ───────────────────────────────────────────────

    pub fn push_r(&mut self, reg: Reg) {
        self.emit_rex(false, false, false, reg.high());
        self.code.append1(0x50 + reg.low3());
    }

    pub fn pop_r(&mut self, reg: Reg) {
        self.emit_rex(false, false, false, reg.high());
        self.code.append1(0x58 + reg.low3());
    }

    /// Push the word at `[base + disp]`.
    pub fn push_m(&mut self, base: Reg, disp: i32) {
        self.emit_rex(false, false, false, base.high());
        self.code.append1(0xFF);
        self.mem_operand(0b110, base, disp);
    }

    /// Pop a word into `[base + disp]`.
    pub fn pop_m(&mut self, base: Reg, disp: i32) {
        self.emit_rex(false, false, false, base.high());
        self.code.append1(0x8F);
        self.mem_operand(0b000, base, disp);
    }

    /// Push a sign-extended immediate, shortest form.
    pub fn push_i32(&mut self, v: i32) {
        if is_byte(v) {
            self.code.append1(0x6A);
            self.code.append1(v as u8);
        } else {
            self.code.append1(0x68);
            self.code.append4(v as u32);
        }
    }

    /// Push the 32-bit value at `[base + disp]` as one stack slot.
    pub fn push4_m(&mut self, base: Reg, disp: i32) {
        if WORD == 8 {
            self.mov_rm32(Reg::Rsi, base, disp);
            self.push_r(Reg::Rsi);
        } else {
            self.push_m(base, disp);
        }
    }

    /// Pop one stack slot into the 32-bit location `[base + disp]`.
    pub fn pop4_m(&mut self, base: Reg, disp: i32) {
        if WORD == 8 {
            self.pop_r(Reg::Rsi);
            self.mov_mr32(base, disp, Reg::Rsi);
        } else {
            self.pop_m(base, disp);
        }
    }

    // ── arithmetic and logic ───────────────────────────────────────

    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.rex_word(src, dst);
        self.code.append1(opcode);
        self.modrm(0b11, src.low3(), dst.low3());
    }

    fn alu_ri(&mut self, ext: u8, dst: Reg, v: i32) {
        self.emit_rex(WORD == 8, false, false, dst.high());
        if is_byte(v) {
            self.code.append1(0x83);
            self.modrm(0b11, ext, dst.low3());
            self.code.append1(v as u8);
        } else {
            self.code.append1(0x81);
            self.modrm(0b11, ext, dst.low3());
            self.code.append4(v as u32);
        }
    }

    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, dst, src);
    }

    pub fn add_ri(&mut self, dst: Reg, v: i32) {
        self.alu_ri(0b000, dst, v);
    }

    /// `[base + disp] += v`, word-sized.
    pub fn add_mi(&mut self, base: Reg, disp: i32, v: i32) {
        self.emit_rex(WORD == 8, false, false, base.high());
        if is_byte(v) {
            self.code.append1(0x83);
            self.mem_operand(0b000, base, disp);
            self.code.append1(v as u8);
        } else {
            self.code.append1(0x81);
            self.mem_operand(0b000, base, disp);
            self.code.append4(v as u32);
        }
    }

    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x29, dst, src);
    }

    pub fn sub_ri(&mut self, dst: Reg, v: i32) {
        self.alu_ri(0b101, dst, v);
    }

    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x09, dst, src);
    }

    pub fn or_ri(&mut self, dst: Reg, v: i32) {
        self.alu_ri(0b001, dst, v);
    }

    pub fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x21, dst, src);
    }

    pub fn and_ri(&mut self, dst: Reg, v: i32) {
        self.alu_ri(0b100, dst, v);
    }

    pub fn shl_ri(&mut self, dst: Reg, v: u8) {
        self.emit_rex(WORD == 8, false, false, dst.high());
        if v == 1 {
            self.code.append1(0xD1);
            self.modrm(0b11, 0b100, dst.low3());
        } else {
            self.code.append1(0xC1);
            self.modrm(0b11, 0b100, dst.low3());
            self.code.append1(v);
        }
    }

    /// Flags from `lhs - rhs`.
    pub fn cmp_rr(&mut self, lhs: Reg, rhs: Reg) {
        self.rex_word(rhs, lhs);
        self.code.append1(0x39);
        self.modrm(0b11, rhs.low3(), lhs.low3());
    }

    /// Flags from `reg - v`.
    pub fn cmp_ri(&mut self, reg: Reg, v: i32) {
        self.alu_ri(0b111, reg, v);
    }

    // ── control flow ───────────────────────────────────────────────

    pub fn jmp_label(&mut self, label: Label) {
        self.code.append1(0xE9);
        self.label_disp32(label);
    }

    pub fn jcc_label(&mut self, cond: Cond, label: Label) {
        self.code.append1(0x0F);
        self.code.append1(0x80 | cond.cc());
        self.label_disp32(label);
    }

    /// Emit `jmp` with a zero 32-bit displacement; returns the offset of
    /// the displacement slot for a later patch.
    pub fn jmp_placeholder(&mut self) -> usize {
        self.code.append1(0xE9);
        let slot = self.code.length();
        self.code.append4(0);
        slot
    }

    /// Emit a conditional branch with a zero 32-bit displacement; returns
    /// the offset of the displacement slot for a later patch.
    pub fn jcc_placeholder(&mut self, cond: Cond) -> usize {
        self.code.append1(0x0F);
        self.code.append1(0x80 | cond.cc());
        let slot = self.code.length();
        self.code.append4(0);
        slot
    }

    pub fn jmp_r(&mut self, reg: Reg) {
        self.emit_rex(false, false, false, reg.high());
        self.code.append1(0xFF);
        self.modrm(0b11, 0b100, reg.low3());
    }

    pub fn call_r(&mut self, reg: Reg) {
        self.emit_rex(false, false, false, reg.high());
        self.code.append1(0xFF);
        self.modrm(0b11, 0b010, reg.low3());
    }

    pub fn ret(&mut self) {
        self.code.append1(0xC3);
    }

    pub fn nop(&mut self) {
        self.code.append1(0x90);
    }

    /// `rep movsb`: copy rcx bytes from [rsi] to [rdi].
    pub fn rep_movsb(&mut self) {
        self.code.append1(0xF3);
        self.code.append1(0xA4);
    }

    // ── completion ─────────────────────────────────────────────────

    /// Validate and return the emitted bytes.
    pub fn finish(self) -> Result<Vec<u8>, AssemblerError> {
        if self.code.is_empty() {
            return Err(AssemblerError::EmptyFunction);
        }
        if self.code.is_exhausted() {
            return Err(AssemblerError::OutOfMemory);
        }
        if self.unresolved > 0 {
            let label = self
                .labels
                .iter()
                .position(|l| l.target.is_none())
                .unwrap_or(0);
            return Err(AssemblerError::LabelUnbound { label });
        }
        Ok(self.code.bytes().to_vec())
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}
