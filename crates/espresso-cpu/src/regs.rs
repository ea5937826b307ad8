//! Architectural register identities.
//!
//! [`GuestReg`] names every storage location in [`crate::Core`] that the JIT
//! or the call bridge can address. The mapping from identity to byte offset
//! lives in `espresso-jit`; keeping the identity enum here lets host-side
//! code (marshaling, tests, debuggers) talk about registers without pulling
//! in the code generator.

/// Lane selector for paired-single accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FprLane {
    Ps0,
    Ps1,
}

/// Identity of one architectural register or state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestReg {
    /// General-purpose register r0..r31.
    Gpr(u8),
    /// Scalar view of floating register f0..f31 (the ps0 lane).
    Fpr(u8),
    /// One paired-single lane of f0..f31.
    Ps(u8, FprLane),
    Cr,
    Xer,
    Lr,
    Ctr,
    Fpscr,
    /// Graphics quantization register 0..7.
    Gqr(u8),
    Reserve,
    ReserveAddress,
    ReserveData,
}

impl GuestReg {
    /// Iterate every addressable register identity, used by round-trip tests
    /// and by the operand-table constructor to prove totality.
    pub fn all() -> impl Iterator<Item = GuestReg> {
        let gprs = (0..32).map(GuestReg::Gpr);
        let fprs = (0..32).map(GuestReg::Fpr);
        let ps0 = (0..32).map(|i| GuestReg::Ps(i, FprLane::Ps0));
        let ps1 = (0..32).map(|i| GuestReg::Ps(i, FprLane::Ps1));
        let gqrs = (0..8).map(GuestReg::Gqr);
        let singles = [
            GuestReg::Cr,
            GuestReg::Xer,
            GuestReg::Lr,
            GuestReg::Ctr,
            GuestReg::Fpscr,
            GuestReg::Reserve,
            GuestReg::ReserveAddress,
            GuestReg::ReserveData,
        ];
        gprs.chain(fprs)
            .chain(ps0)
            .chain(ps1)
            .chain(gqrs)
            .chain(singles)
    }
}
