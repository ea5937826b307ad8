//! End-to-end control transfer through the call thunk and finale.
#![cfg(all(target_arch = "x86_64", not(miri)))]

use espresso_cpu::Core;
use espresso_jit::{
    Assembler, BlockDecoder, BlockLimits, CodePtr, CodegenError, JitRuntime, RegisterMap, Step,
};

/// Decoder for a one-instruction unit that writes `resume` into `nia` and
/// exits through the runtime finale.
struct ExitDecoder {
    resume: u32,
    finale: CodePtr,
}

impl BlockDecoder for ExitDecoder {
    fn translate(
        &mut self,
        asm: &mut Assembler,
        map: &RegisterMap,
        _address: u32,
    ) -> Result<Step, CodegenError> {
        asm.store_imm32(map.nia(), self.resume);
        asm.jmp_abs(self.finale.addr());
        Ok(Step::Terminal)
    }
}

#[test]
fn call_thunk_runs_a_block_and_returns_the_resume_address() {
    let runtime = JitRuntime::with_capacity(1 << 20).unwrap();
    let mut decoder = ExitDecoder {
        resume: 0xCAFE_0040,
        finale: runtime.finale(),
    };

    let block = runtime
        .translate(0x0100_0000, &mut decoder, BlockLimits::default())
        .unwrap();
    let entry = block.entry.expect("entry emitted");

    let mut core = Core::new(0);
    let mut guest_mem = vec![0u8; 4096];
    let next = unsafe { runtime.call(&mut core, guest_mem.as_mut_ptr(), entry) };

    assert_eq!(next, 0xCAFE_0040);
    assert_eq!(core.nia, 0xCAFE_0040);
}

#[test]
fn registers_written_by_translated_code_land_in_the_core() {
    struct StoreDecoder {
        finale: CodePtr,
    }
    impl BlockDecoder for StoreDecoder {
        fn translate(
            &mut self,
            asm: &mut Assembler,
            map: &RegisterMap,
            _address: u32,
        ) -> Result<Step, CodegenError> {
            // r7 = 0x1234_5678; lr = 0x8000_0000, then exit.
            asm.store_imm32(map.gpr(7), 0x1234_5678);
            asm.store_imm32(map.operand(espresso_cpu::GuestReg::Lr), 0x8000_0000);
            asm.store_imm32(map.nia(), 0x4);
            asm.jmp_abs(self.finale.addr());
            Ok(Step::Terminal)
        }
    }

    let runtime = JitRuntime::with_capacity(1 << 20).unwrap();
    let mut decoder = StoreDecoder {
        finale: runtime.finale(),
    };
    let block = runtime
        .translate(0, &mut decoder, BlockLimits::default())
        .unwrap();

    let mut core = Core::new(1);
    let mut guest_mem = vec![0u8; 64];
    let next = unsafe { runtime.call(&mut core, guest_mem.as_mut_ptr(), block.entry.unwrap()) };

    assert_eq!(next, 4);
    assert_eq!(core.gpr[7], 0x1234_5678);
    assert_eq!(core.lr, 0x8000_0000);
}
