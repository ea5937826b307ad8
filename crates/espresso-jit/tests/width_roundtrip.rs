//! Property tests for the operand map and width-alignment helper.

use espresso_cpu::{Core, GuestReg};
use espresso_jit::{Assembler, HostReg, RegisterMap};
use proptest::prelude::*;

fn any_guest_reg() -> impl Strategy<Value = GuestReg> {
    let all: Vec<GuestReg> = GuestReg::all().collect();
    prop::sample::select(all)
}

proptest! {
    /// Writing through the mapping and reading back yields the original
    /// value (truncated to the operand width), for every register identity.
    #[test]
    fn mapping_round_trips_any_value(reg in any_guest_reg(), value: u64) {
        let map = RegisterMap::new();
        let mut core = Core::new(0);
        let op = map.operand(reg);
        op.write(&mut core, value);
        let mask = match op.size {
            4 => 0xFFFF_FFFFu64,
            8 => u64::MAX,
            _ => unreachable!(),
        };
        prop_assert_eq!(op.read(&core), value & mask);
    }

    /// `shift_to` emits a right shift of (s - d) when narrowing, a left
    /// shift of (d - s) when widening, and nothing when widths match.
    #[test]
    fn shift_to_emits_the_width_difference(
        s in prop::sample::select(vec![8u32, 16, 32, 64]),
        d in prop::sample::select(vec![8u32, 16, 32, 64]),
    ) {
        let mut asm = Assembler::new();
        asm.shift_to(HostReg::Rcx, s, d);
        let code = asm.finish().unwrap();
        if s == d {
            prop_assert!(code.is_empty());
        } else {
            // REX.W C1 /ext imm8
            let expected_ext = if s > d { 5u8 } else { 4u8 }; // shr : shl
            let expected_amount = s.abs_diff(d) as u8;
            prop_assert_eq!(code[0], 0x48);
            prop_assert_eq!(code[1], 0xC1);
            prop_assert_eq!(code[2] >> 3 & 7, expected_ext);
            prop_assert_eq!(code[3], expected_amount);
        }
    }
}
