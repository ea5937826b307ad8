//! Architectural state for the Espresso guest CPU.
//!
//! One [`Core`] exists per emulated hardware thread. The JIT addresses every
//! field through fixed byte offsets off a dedicated host register, so the
//! layout is `repr(C)` and must never be reordered; `espresso-jit` builds its
//! operand table from `offset_of!` over this struct and unit tests below pin
//! the invariants the generated code relies on.

use bitflags::bitflags;

pub mod regs;

pub use regs::{FprLane, GuestReg};

/// Number of general-purpose registers.
pub const NUM_GPR: usize = 32;
/// Number of floating-point registers.
pub const NUM_FPR: usize = 32;
/// Number of graphics quantization registers.
pub const NUM_GQR: usize = 8;

/// One floating-point register: a scalar lane plus the second paired-single
/// lane. Scalar operations read and write `value`; paired-single operations
/// treat (`value`, `paired1`) as a two-lane vector.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct FprPair {
    pub value: f64,
    pub paired1: f64,
}

bitflags! {
    /// Sticky exception and status bits of the FPSCR we model.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Fpscr: u32 {
        /// Exception summary.
        const FX = 1 << 31;
        /// Enabled exception summary.
        const FEX = 1 << 30;
        /// Invalid-operation exception summary.
        const VX = 1 << 29;
        /// Overflow exception.
        const OX = 1 << 28;
        /// Underflow exception.
        const UX = 1 << 27;
        /// Zero-divide exception.
        const ZX = 1 << 26;
        /// Inexact exception.
        const XX = 1 << 25;
    }
}

bitflags! {
    /// XER status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Xer: u32 {
        const SO = 1 << 31;
        const OV = 1 << 30;
        const CA = 1 << 29;
    }
}

/// Per-thread architectural register file.
///
/// Layout contract (consumed by `espresso-jit`):
/// - `repr(C)`, no reordering, identical for every thread.
/// - Every field is addressable as `context_reg + offset_of!(Core, field)`.
/// - Exactly one instance per guest thread; created at thread creation and
///   torn down with the thread. Only the owning guest thread mutates it.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct Core {
    /// General-purpose registers r0..r31. r1 is the guest stack pointer.
    pub gpr: [u32; NUM_GPR],
    /// Floating-point registers f0..f31, each with a paired-single lane.
    pub fpr: [FprPair; NUM_FPR],
    /// Condition register (eight 4-bit fields).
    pub cr: u32,
    /// Fixed-point exception register.
    pub xer: u32,
    /// Link register.
    pub lr: u32,
    /// Count register.
    pub ctr: u32,
    /// Floating-point status and control register.
    pub fpscr: u32,
    /// Graphics quantization registers.
    pub gqr: [u32; NUM_GQR],

    /// Load-reserve flag set by `lwarx`, cleared by `stwcx.`/context switch.
    pub reserve: u32,
    /// Guest address the reservation covers.
    pub reserve_address: u32,
    /// Snapshot of the reserved word for atomic read-modify-write emulation.
    pub reserve_data: u32,

    /// Current instruction address.
    pub cia: u32,
    /// Next instruction address; translated code stores the resume address
    /// here before transferring back to the dispatcher.
    pub nia: u32,

    /// Hardware thread id this state belongs to.
    pub core_id: u32,
}

impl Core {
    pub fn new(core_id: u32) -> Self {
        Self {
            gpr: [0; NUM_GPR],
            fpr: [FprPair::default(); NUM_FPR],
            cr: 0,
            xer: 0,
            lr: 0,
            ctr: 0,
            fpscr: 0,
            gqr: [0; NUM_GQR],
            reserve: 0,
            reserve_address: 0,
            reserve_data: 0,
            cia: 0,
            nia: 0,
            core_id,
        }
    }

    pub fn fpscr_flags(&self) -> Fpscr {
        Fpscr::from_bits_truncate(self.fpscr)
    }

    pub fn xer_flags(&self) -> Xer {
        Xer::from_bits_truncate(self.xer)
    }

    /// Guest stack pointer (r1).
    pub fn stack_pointer(&self) -> u32 {
        self.gpr[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn fpr_pair_is_two_packed_lanes() {
        assert_eq!(size_of::<FprPair>(), 16);
        assert_eq!(offset_of!(FprPair, value), 0);
        assert_eq!(offset_of!(FprPair, paired1), 8);
    }

    #[test]
    fn register_file_offsets_are_stable() {
        // The JIT bakes these offsets into generated code; a change here is
        // an ABI break for every translated block.
        assert_eq!(offset_of!(Core, gpr), 0);
        assert_eq!(offset_of!(Core, fpr), 128);
        assert_eq!(offset_of!(Core, cr), 128 + 32 * 16);
        assert_eq!(
            offset_of!(Core, reserve_address),
            offset_of!(Core, reserve) + 4
        );
        assert_eq!(
            offset_of!(Core, reserve_data),
            offset_of!(Core, reserve) + 8
        );
    }

    #[test]
    fn status_flags_decode_from_the_raw_words() {
        let mut core = Core::new(0);
        core.fpscr = (Fpscr::FX | Fpscr::ZX).bits() | 0x0000_00FF; // unmodeled low bits
        core.xer = (Xer::SO | Xer::CA).bits();

        assert_eq!(core.fpscr_flags(), Fpscr::FX | Fpscr::ZX);
        assert!(core.xer_flags().contains(Xer::SO));
        assert!(core.xer_flags().contains(Xer::CA));
        assert!(!core.xer_flags().contains(Xer::OV));
    }

    #[test]
    fn cores_share_one_layout() {
        let a = Core::new(0);
        let b = Core::new(1);
        assert_eq!(size_of::<Core>(), size_of_val(&a));
        assert_eq!(size_of_val(&a), size_of_val(&b));
        assert_eq!(a.core_id, 0);
        assert_eq!(b.core_id, 1);
    }

    fn size_of_val<T>(_: &T) -> usize {
        size_of::<T>()
    }
}
