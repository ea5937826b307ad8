//! Diagnostic rendering of a guest→host call.
//!
//! Read-only by construction: rendering reads the register file and stack
//! through the same descriptors the real marshaling uses, but mutates
//! nothing and never raises. An argument that cannot be read degrades to an
//! in-band marker in the text instead of aborting the trace (or the call it
//! is diagnosing).

use std::fmt::Write as _;

use espresso_cpu::Core;

use crate::interface::{read_param, GuestMemory, RegisterClass, Value};
use crate::registry::HostRoutine;

/// Marker substituted for an argument whose storage cannot be read.
pub const UNREADABLE: &str = "<unreadable>";

/// Render `"name(arg0, arg1, …) from 0xRETURN"` for a call about to enter
/// `routine`, where the return address is the guest link register.
///
/// A member receiver renders as a leading `this = <value>, `; a variadic
/// tail renders literally as `...`.
pub fn render_trace(core: &Core, mem: &dyn GuestMemory, routine: &HostRoutine) -> String {
    let mut line = String::new();
    let _ = write!(line, "{}(", routine.name);

    if let Some(info) = &routine.receiver {
        match read_param(core, mem, info) {
            Ok(value) => {
                let _ = write!(line, "this = {value}, ");
            }
            Err(_) => {
                let _ = write!(line, "this = {UNREADABLE}, ");
            }
        }
    }

    for (i, info) in routine.params.iter().enumerate() {
        if i > 0 {
            line.push_str(", ");
        }
        if info.class == RegisterClass::VarArgs {
            line.push_str("...");
            continue;
        }
        match read_param(core, mem, info) {
            Ok(Value::VarArgs) => line.push_str("..."),
            Ok(value) => {
                let _ = write!(line, "{value}");
            }
            Err(_) => line.push_str(UNREADABLE),
        }
    }

    let _ = write!(line, ") from {:#010X}", core.lr);
    line
}
