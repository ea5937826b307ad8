//! Host register roles and the guest-register operand map.
//!
//! Host register assignments are fixed for the whole process:
//!
//! ```text
//! RAX, RCX, RDX, R8, R9   scratch, clobbered by any call into host code
//! RSI                     guest memory base
//! RBX                     &Core of the executing guest thread
//! RDI                     current guest instruction address
//! RSP                     host stack (never touched by translated code)
//! ```
//!
//! There are far more architectural registers than host registers, so every
//! guest register lives in the per-thread [`Core`] block and resolves to a
//! fixed `[rbx + offset]` memory operand. Codegen may rely on a given
//! architectural register always resolving to the same location; the price
//! is that scratch registers must be treated as dead across host calls.

use core::mem::offset_of;

use espresso_cpu::{Core, FprLane, FprPair, GuestReg};

/// x86-64 general-purpose registers by hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HostReg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl HostReg {
    #[inline]
    pub fn encoding(self) -> u8 {
        self as u8
    }

    /// True for R8..R15, which need a REX.B/REX.R bit.
    #[inline]
    pub fn is_extended(self) -> bool {
        self.encoding() >= 8
    }
}

/// A `[base + disp]` memory operand of a known access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: HostReg,
    pub offset: i32,
    /// Access width in bytes: 1, 2, 4 or 8.
    pub size: u8,
}

impl MemOperand {
    /// Host-side read through the same offset/size the generated code uses.
    /// Widths below 8 bytes zero-extend.
    pub fn read(&self, core: &Core) -> u64 {
        let ptr = unsafe { (core as *const Core as *const u8).add(self.offset as usize) };
        unsafe {
            match self.size {
                1 => ptr.read() as u64,
                2 => (ptr as *const u16).read_unaligned() as u64,
                4 => (ptr as *const u32).read_unaligned() as u64,
                8 => (ptr as *const u64).read_unaligned(),
                other => unreachable!("operand size {other}"),
            }
        }
    }

    /// Host-side write; the value is truncated to the operand width.
    pub fn write(&self, core: &mut Core, value: u64) {
        let ptr = unsafe { (core as *mut Core as *mut u8).add(self.offset as usize) };
        unsafe {
            match self.size {
                1 => ptr.write(value as u8),
                2 => (ptr as *mut u16).write_unaligned(value as u16),
                4 => (ptr as *mut u32).write_unaligned(value as u32),
                8 => (ptr as *mut u64).write_unaligned(value),
                other => unreachable!("operand size {other}"),
            }
        }
    }
}

/// Immutable table mapping every architectural register to its storage
/// location.
///
/// Built once at startup and passed by reference into every code-emission
/// call; never recomputed or rebound per block.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    /// Holds `&Core` of the executing guest thread.
    pub context: HostReg,
    /// Holds the host base address of guest flat memory.
    pub membase: HostReg,
    /// Holds the current guest instruction address during translation.
    pub cia: HostReg,
    /// Freely usable between guest-instruction boundaries; clobbered by any
    /// call into host code and must be spilled around one.
    pub scratch: [HostReg; 5],

    gpr: [MemOperand; 32],
    fpr: [MemOperand; 32],
    ps: [[MemOperand; 2]; 32],
    gqr: [MemOperand; 8],
    cr: MemOperand,
    xer: MemOperand,
    lr: MemOperand,
    ctr: MemOperand,
    fpscr: MemOperand,
    reserve: MemOperand,
    reserve_address: MemOperand,
    reserve_data: MemOperand,
    nia: MemOperand,
}

impl RegisterMap {
    pub fn new() -> Self {
        let base = HostReg::Rbx;
        let word = |offset: usize| MemOperand {
            base,
            offset: offset as i32,
            size: 4,
        };
        let dword = |offset: usize| MemOperand {
            base,
            offset: offset as i32,
            size: 8,
        };

        let mut gpr = [word(0); 32];
        let mut fpr = [dword(0); 32];
        let mut ps = [[dword(0); 2]; 32];
        let mut gqr = [word(0); 8];

        for i in 0..32 {
            gpr[i] = word(offset_of!(Core, gpr) + i * 4);
            let pair = offset_of!(Core, fpr) + i * core::mem::size_of::<FprPair>();
            fpr[i] = dword(pair + offset_of!(FprPair, value));
            ps[i][0] = dword(pair + offset_of!(FprPair, value));
            ps[i][1] = dword(pair + offset_of!(FprPair, paired1));
        }
        for i in 0..8 {
            gqr[i] = word(offset_of!(Core, gqr) + i * 4);
        }

        Self {
            context: base,
            membase: HostReg::Rsi,
            cia: HostReg::Rdi,
            scratch: [
                HostReg::Rax,
                HostReg::Rcx,
                HostReg::Rdx,
                HostReg::R8,
                HostReg::R9,
            ],
            gpr,
            fpr,
            ps,
            gqr,
            cr: word(offset_of!(Core, cr)),
            xer: word(offset_of!(Core, xer)),
            lr: word(offset_of!(Core, lr)),
            ctr: word(offset_of!(Core, ctr)),
            fpscr: word(offset_of!(Core, fpscr)),
            reserve: word(offset_of!(Core, reserve)),
            reserve_address: word(offset_of!(Core, reserve_address)),
            reserve_data: word(offset_of!(Core, reserve_data)),
            nia: word(offset_of!(Core, nia)),
        }
    }

    /// Total function from register identity to storage location.
    pub fn operand(&self, reg: GuestReg) -> MemOperand {
        match reg {
            GuestReg::Gpr(i) => self.gpr[i as usize],
            GuestReg::Fpr(i) => self.fpr[i as usize],
            GuestReg::Ps(i, FprLane::Ps0) => self.ps[i as usize][0],
            GuestReg::Ps(i, FprLane::Ps1) => self.ps[i as usize][1],
            GuestReg::Gqr(i) => self.gqr[i as usize],
            GuestReg::Cr => self.cr,
            GuestReg::Xer => self.xer,
            GuestReg::Lr => self.lr,
            GuestReg::Ctr => self.ctr,
            GuestReg::Fpscr => self.fpscr,
            GuestReg::Reserve => self.reserve,
            GuestReg::ReserveAddress => self.reserve_address,
            GuestReg::ReserveData => self.reserve_data,
        }
    }

    pub fn gpr(&self, i: usize) -> MemOperand {
        self.gpr[i]
    }

    pub fn fpr(&self, i: usize) -> MemOperand {
        self.fpr[i]
    }

    /// Location translated code stores the resume address to before
    /// transferring to the finale thunk.
    pub fn nia(&self) -> MemOperand {
        self.nia
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::new()
    }
}
