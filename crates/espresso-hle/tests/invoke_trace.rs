//! Call-trace rendering against live register state.

use espresso_cpu::Core;
use espresso_hle::{
    render_trace, GuestMemory, Registry, Value, ValueType,
};

struct NoMemory;
impl GuestMemory for NoMemory {
    fn read_u32(&self, _address: u32) -> Option<u32> {
        None
    }
}

struct FlatMemory(Vec<u8>);
impl GuestMemory for FlatMemory {
    fn read_u32(&self, address: u32) -> Option<u32> {
        let a = address as usize;
        let bytes = self.0.get(a..a + 4)?;
        Some(u32::from_be_bytes(bytes.try_into().unwrap()))
    }
}

fn ok_handler() -> espresso_hle::registry::Handler {
    Box::new(|_core, _mem, _call| Ok(None))
}

#[test]
fn renders_name_arguments_and_return_address() {
    let mut registry = Registry::new();
    let id = registry.register("Foo", &[ValueType::S32, ValueType::F32], ok_handler());
    let routine = registry.routine(id).unwrap();

    let mut core = Core::new(0);
    core.gpr[3] = 5;
    core.fpr[1].value = 2.5;
    core.lr = 0x8000_1000;

    assert_eq!(
        render_trace(&core, &NoMemory, routine),
        "Foo(5, 2.5) from 0x80001000"
    );
}

#[test]
fn member_receiver_renders_as_a_this_prefix() {
    let mut registry = Registry::new();
    let id = registry.register_member("Widget::resize", &[ValueType::U32], ok_handler());
    let routine = registry.routine(id).unwrap();

    let mut core = Core::new(0);
    core.gpr[3] = 0x1000_0000; // receiver
    core.gpr[4] = 64;
    core.lr = 0x8002_0000;

    assert_eq!(
        render_trace(&core, &NoMemory, routine),
        "Widget::resize(this = 0x10000000, 64) from 0x80020000"
    );
}

#[test]
fn variadic_tail_renders_literally() {
    let mut registry = Registry::new();
    let id = registry.register(
        "OSReport",
        &[ValueType::Ptr, ValueType::VarArgs],
        ok_handler(),
    );
    let routine = registry.routine(id).unwrap();

    let mut core = Core::new(0);
    core.gpr[3] = 0x1001_2340;
    core.lr = 0x8000_0044;

    assert_eq!(
        render_trace(&core, &NoMemory, routine),
        "OSReport(0x10012340, ...) from 0x80000044"
    );
}

#[test]
fn unreadable_argument_degrades_in_band() {
    let mut registry = Registry::new();
    let types = vec![ValueType::U32; 9]; // ninth overflows to the stack
    let id = registry.register("Wide", &types, ok_handler());
    let routine = registry.routine(id).unwrap();

    let mut core = Core::new(0);
    for (i, reg) in core.gpr[3..11].iter_mut().enumerate() {
        *reg = i as u32;
    }
    core.gpr[1] = 0x100; // stack pointer into unmapped memory
    core.lr = 0x8000_0000;

    // Rendering still succeeds; only the unreadable slot is marked.
    assert_eq!(
        render_trace(&core, &NoMemory, routine),
        "Wide(0, 1, 2, 3, 4, 5, 6, 7, <unreadable>) from 0x80000000"
    );
}

#[test]
fn stack_arguments_render_from_the_save_area() {
    let mut registry = Registry::new();
    let types = vec![ValueType::U32; 9];
    let id = registry.register("Wide", &types, ok_handler());
    let routine = registry.routine(id).unwrap();

    let mut core = Core::new(0);
    for (i, reg) in core.gpr[3..11].iter_mut().enumerate() {
        *reg = i as u32;
    }
    core.gpr[1] = 0x100;
    core.lr = 0x8000_0000;

    let mut bytes = vec![0u8; 0x200];
    bytes[0x108..0x10C].copy_from_slice(&9u32.to_be_bytes());
    let mem = FlatMemory(bytes);

    assert_eq!(
        render_trace(&core, &mem, routine),
        "Wide(0, 1, 2, 3, 4, 5, 6, 7, 9) from 0x80000000"
    );
}
