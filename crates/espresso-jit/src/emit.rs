//! x86-64 byte emitter with deferred labels.
//!
//! Only the encodings translation actually needs are implemented: width-aware
//! moves between host registers and `[rbx + disp]` operands, immediate moves,
//! shifts, rel32 branches, register-indirect transfers, and the push/pop/ret
//! set the entry thunks use.
//!
//! Labels are bind-once: a branch to a not-yet-emitted target records a rel32
//! fixup that is patched when the label is bound. An unbound label at the end
//! of a unit is the caller's problem ([`crate::block`] turns it into a
//! finalize error).
//!
//! Failures go through an error sink. The default policy is fatal to the
//! translation unit: the first error latches, further emission becomes a
//! no-op, and the unit surfaces the error instead of producing code.
//! [`ErrorPolicy::Continue`] exists strictly for diagnostics (dumping as much
//! of a broken unit as possible) and must never be used for code that will
//! run, since it can emit partially-broken output.

use thiserror::Error;

use crate::regs::{HostReg, MemOperand};

/// Upper bound on generated code per translation unit.
const MAX_UNIT_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("shift by {amount} bits is not encodable")]
    InvalidShift { amount: u32 },
    #[error("unsupported operand width {size}")]
    InvalidWidth { size: u8 },
    #[error("label already bound at offset {offset:#x}")]
    LabelRebound { offset: usize },
    #[error("translation unit exceeded {limit:#x} bytes of host code")]
    UnitTooLarge { limit: usize },
}

/// What to do when an emission request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Latch the first error and stop emitting. Production default.
    #[default]
    Fatal,
    /// Log and keep going. Diagnostic use only; the resulting buffer may be
    /// partially broken and must not be made executable.
    Continue,
}

/// Condition codes for `jcc` (hardware encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

/// Handle to a deferred code position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug, Default)]
struct LabelEntry {
    bound_at: Option<usize>,
    /// Offsets of rel32 holes waiting for this label.
    fixups: Vec<usize>,
}

pub struct Assembler {
    buf: Vec<u8>,
    labels: Vec<LabelEntry>,
    policy: ErrorPolicy,
    failure: Option<CodegenError>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::with_policy(ErrorPolicy::Fatal)
    }

    pub fn with_policy(policy: ErrorPolicy) -> Self {
        Self {
            buf: Vec::new(),
            labels: Vec::new(),
            policy,
            failure: None,
        }
    }

    /// Current emission offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    /// First error reported to the sink, if any.
    pub fn failure(&self) -> Option<&CodegenError> {
        self.failure.as_ref()
    }

    /// Consume the assembler, yielding the code buffer.
    ///
    /// Under [`ErrorPolicy::Fatal`] a latched error surfaces here; under
    /// [`ErrorPolicy::Continue`] the (possibly broken) buffer is returned
    /// regardless, for diagnostic dumping.
    pub fn finish(self) -> Result<Vec<u8>, CodegenError> {
        match (self.policy, self.failure) {
            (ErrorPolicy::Fatal, Some(err)) => Err(err),
            _ => Ok(self.buf),
        }
    }

    fn report(&mut self, err: CodegenError) {
        tracing::error!(error = %err, offset = self.buf.len(), "code generation failed");
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    #[inline]
    fn dead(&self) -> bool {
        self.failure.is_some() && self.policy == ErrorPolicy::Fatal
    }

    fn check_capacity(&mut self) -> bool {
        if self.dead() {
            return false;
        }
        if self.buf.len() > MAX_UNIT_BYTES {
            self.report(CodegenError::UnitTooLarge {
                limit: MAX_UNIT_BYTES,
            });
            return false;
        }
        true
    }

    #[inline]
    fn push(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    fn push_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    // -- Encoding helpers -------------------------------------------------

    fn rex_mem(&mut self, wide: bool, reg: u8, base: HostReg, force: bool) {
        let r = u8::from(reg >= 8);
        let b = u8::from(base.is_extended());
        if wide || r != 0 || b != 0 || force {
            self.push(0x40 | (u8::from(wide) << 3) | (r << 2) | b);
        }
    }

    fn rex_rr(&mut self, wide: bool, reg: u8, rm: u8, force: bool) {
        let r = u8::from(reg >= 8);
        let b = u8::from(rm >= 8);
        if wide || r != 0 || b != 0 || force {
            self.push(0x40 | (u8::from(wide) << 3) | (r << 2) | b);
        }
    }

    fn modrm_mem(&mut self, reg: u8, base: HostReg, disp: i32) {
        let rm = base.encoding() & 7;
        let reg = reg & 7;
        // RSP/R12 bases need a SIB byte; RBP/R13 cannot use the disp-less form.
        let need_sib = rm == 4;
        let force_disp = rm == 5;
        if disp == 0 && !force_disp {
            self.push(reg << 3 | rm);
            if need_sib {
                self.push(0x24);
            }
        } else if (-128..=127).contains(&disp) {
            self.push(0x40 | reg << 3 | rm);
            if need_sib {
                self.push(0x24);
            }
            self.push(disp as u8);
        } else {
            self.push(0x80 | reg << 3 | rm);
            if need_sib {
                self.push(0x24);
            }
            self.push_u32(disp as u32);
        }
    }

    fn modrm_rr(&mut self, reg: u8, rm: u8) {
        self.push(0xC0 | (reg & 7) << 3 | (rm & 7));
    }

    // -- Moves ------------------------------------------------------------

    /// Load `src` into `dst`, zero-extending widths below 8 bytes.
    pub fn load(&mut self, dst: HostReg, src: MemOperand) {
        if !self.check_capacity() {
            return;
        }
        let reg = dst.encoding();
        match src.size {
            1 => {
                self.rex_mem(false, reg, src.base, false);
                self.push(0x0F);
                self.push(0xB6); // movzx r32, r/m8
                self.modrm_mem(reg, src.base, src.offset);
            }
            2 => {
                self.rex_mem(false, reg, src.base, false);
                self.push(0x0F);
                self.push(0xB7); // movzx r32, r/m16
                self.modrm_mem(reg, src.base, src.offset);
            }
            4 => {
                self.rex_mem(false, reg, src.base, false);
                self.push(0x8B);
                self.modrm_mem(reg, src.base, src.offset);
            }
            8 => {
                self.rex_mem(true, reg, src.base, false);
                self.push(0x8B);
                self.modrm_mem(reg, src.base, src.offset);
            }
            size => self.report(CodegenError::InvalidWidth { size }),
        }
    }

    /// Store `src` into `dst` at the operand's width.
    pub fn store(&mut self, dst: MemOperand, src: HostReg) {
        if !self.check_capacity() {
            return;
        }
        let reg = src.encoding();
        match dst.size {
            1 => {
                // SPL/BPL/SIL/DIL need a REX prefix to address their low byte.
                let force = (4..8).contains(&reg);
                self.rex_mem(false, reg, dst.base, force);
                self.push(0x88);
                self.modrm_mem(reg, dst.base, dst.offset);
            }
            2 => {
                self.push(0x66);
                self.rex_mem(false, reg, dst.base, false);
                self.push(0x89);
                self.modrm_mem(reg, dst.base, dst.offset);
            }
            4 => {
                self.rex_mem(false, reg, dst.base, false);
                self.push(0x89);
                self.modrm_mem(reg, dst.base, dst.offset);
            }
            8 => {
                self.rex_mem(true, reg, dst.base, false);
                self.push(0x89);
                self.modrm_mem(reg, dst.base, dst.offset);
            }
            size => self.report(CodegenError::InvalidWidth { size }),
        }
    }

    /// Store a 32-bit immediate to a 4-byte operand.
    pub fn store_imm32(&mut self, dst: MemOperand, imm: u32) {
        if !self.check_capacity() {
            return;
        }
        if dst.size != 4 {
            self.report(CodegenError::InvalidWidth { size: dst.size });
            return;
        }
        self.rex_mem(false, 0, dst.base, false);
        self.push(0xC7);
        self.modrm_mem(0, dst.base, dst.offset);
        self.push_u32(imm);
    }

    pub fn mov_imm32(&mut self, dst: HostReg, imm: u32) {
        if !self.check_capacity() {
            return;
        }
        self.rex_rr(false, 0, dst.encoding(), false);
        self.push(0xB8 | (dst.encoding() & 7));
        self.push_u32(imm);
    }

    pub fn mov_imm64(&mut self, dst: HostReg, imm: u64) {
        if !self.check_capacity() {
            return;
        }
        self.rex_rr(true, 0, dst.encoding(), false);
        self.push(0xB8 | (dst.encoding() & 7));
        self.push_u64(imm);
    }

    pub fn mov_reg(&mut self, dst: HostReg, src: HostReg) {
        if !self.check_capacity() {
            return;
        }
        self.rex_rr(true, src.encoding(), dst.encoding(), false);
        self.push(0x89);
        self.modrm_rr(src.encoding(), dst.encoding());
    }

    // -- Shifts -----------------------------------------------------------

    pub fn shl(&mut self, reg: HostReg, amount: u32) {
        self.shift(4, reg, amount);
    }

    pub fn shr(&mut self, reg: HostReg, amount: u32) {
        self.shift(5, reg, amount);
    }

    fn shift(&mut self, ext: u8, reg: HostReg, amount: u32) {
        if !self.check_capacity() {
            return;
        }
        if amount >= 64 {
            self.report(CodegenError::InvalidShift { amount });
            return;
        }
        if amount == 0 {
            return;
        }
        self.rex_rr(true, ext, reg.encoding(), false);
        self.push(0xC1);
        self.modrm_rr(ext, reg.encoding());
        self.push(amount as u8);
    }

    /// Align a value held in `reg` from `source_bits` wide storage to
    /// `dest_bits` wide storage: shift right when narrowing, left when
    /// widening, nothing when equal.
    pub fn shift_to(&mut self, reg: HostReg, source_bits: u32, dest_bits: u32) {
        if source_bits > dest_bits {
            self.shr(reg, source_bits - dest_bits);
        } else if dest_bits > source_bits {
            self.shl(reg, dest_bits - source_bits);
        }
    }

    // -- Labels and branches ----------------------------------------------

    pub fn new_label(&mut self) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(LabelEntry::default());
        Label(id)
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.labels[label.0 as usize].bound_at.is_some()
    }

    /// Bind `label` to the current offset, patching every recorded fixup.
    /// Binding twice is a codegen error.
    pub fn bind(&mut self, label: Label) {
        if self.dead() {
            return;
        }
        let here = self.buf.len();
        let entry = &mut self.labels[label.0 as usize];
        if let Some(offset) = entry.bound_at {
            self.report(CodegenError::LabelRebound { offset });
            return;
        }
        entry.bound_at = Some(here);
        let fixups = core::mem::take(&mut entry.fixups);
        for pos in fixups {
            let rel = (here as i64 - (pos as i64 + 4)) as i32;
            self.buf[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
        }
    }

    fn emit_rel32(&mut self, label: Label) {
        let pos = self.buf.len();
        match self.labels[label.0 as usize].bound_at {
            Some(target) => {
                let rel = (target as i64 - (pos as i64 + 4)) as i32;
                self.push_u32(rel as u32);
            }
            None => {
                self.labels[label.0 as usize].fixups.push(pos);
                self.push_u32(0);
            }
        }
    }

    pub fn jmp(&mut self, label: Label) {
        if !self.check_capacity() {
            return;
        }
        self.push(0xE9);
        self.emit_rel32(label);
    }

    pub fn jcc(&mut self, cond: Cond, label: Label) {
        if !self.check_capacity() {
            return;
        }
        self.push(0x0F);
        self.push(0x80 | cond as u8);
        self.emit_rel32(label);
    }

    /// Direct transfer to an already-emitted position in this buffer.
    pub fn jmp_offset(&mut self, target: usize) {
        if !self.check_capacity() {
            return;
        }
        self.push(0xE9);
        let pos = self.buf.len();
        let rel = (target as i64 - (pos as i64 + 4)) as i32;
        self.push_u32(rel as u32);
    }

    pub fn jcc_offset(&mut self, cond: Cond, target: usize) {
        if !self.check_capacity() {
            return;
        }
        self.push(0x0F);
        self.push(0x80 | cond as u8);
        let pos = self.buf.len();
        let rel = (target as i64 - (pos as i64 + 4)) as i32;
        self.push_u32(rel as u32);
    }

    /// Absolute transfer out of this buffer. Clobbers RAX.
    pub fn jmp_abs(&mut self, target: usize) {
        self.mov_imm64(HostReg::Rax, target as u64);
        self.jmp_reg(HostReg::Rax);
    }

    pub fn jmp_reg(&mut self, reg: HostReg) {
        if !self.check_capacity() {
            return;
        }
        self.rex_rr(false, 4, reg.encoding(), false);
        self.push(0xFF);
        self.modrm_rr(4, reg.encoding());
    }

    pub fn call_reg(&mut self, reg: HostReg) {
        if !self.check_capacity() {
            return;
        }
        self.rex_rr(false, 2, reg.encoding(), false);
        self.push(0xFF);
        self.modrm_rr(2, reg.encoding());
    }

    // -- Thunk support ----------------------------------------------------

    pub fn push_reg(&mut self, reg: HostReg) {
        if !self.check_capacity() {
            return;
        }
        self.rex_rr(false, 0, reg.encoding(), false);
        self.push(0x50 | (reg.encoding() & 7));
    }

    pub fn pop_reg(&mut self, reg: HostReg) {
        if !self.check_capacity() {
            return;
        }
        self.rex_rr(false, 0, reg.encoding(), false);
        self.push(0x58 | (reg.encoding() & 7));
    }

    pub fn ret(&mut self) {
        if !self.check_capacity() {
            return;
        }
        self.push(0xC3);
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}
