//! Guest calling convention and argument marshaling.
//!
//! The convention, fixed by the guest ABI:
//! - integer/pointer arguments consume r3..r10 in declaration order;
//! - floating arguments consume f1..f8 independently of the integer
//!   sequence;
//! - 64-bit integer arguments occupy an even-aligned register pair, high
//!   word in the lower register;
//! - arguments beyond the available registers live in the parameter save
//!   area at `r1 + 8`, in declaration order, each at its natural size with
//!   8-byte values 8-aligned;
//! - a member-function receiver is read from r3 (general-purpose slot 0),
//!   which is reserved and never assigned to a declared parameter;
//! - integer results return in r3 (r3:r4 for 64-bit), floating results in
//!   f1.
//!
//! A routine's parameters are described once at registration as an ordered
//! [`ParamInfo`] list; [`read_param`] interprets one descriptor against a
//! live [`Core`]. There is no per-routine glue.

use espresso_cpu::Core;
use thiserror::Error;

/// Number of general-purpose argument registers (r3..r10).
pub const GPR_ARG_SLOTS: u8 = 8;
/// Number of floating argument registers (f1..f8).
pub const FPR_ARG_SLOTS: u8 = 8;
/// First general-purpose argument register.
pub const FIRST_GPR_ARG: usize = 3;
/// First floating argument register.
pub const FIRST_FPR_ARG: usize = 1;
/// Offset of the parameter save area from the guest stack pointer.
pub const STACK_PARAM_BASE: u32 = 8;

/// Which register file a parameter is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterClass {
    Gpr,
    Fpr,
    /// Variadic tail: the remaining arguments are not individually typed.
    VarArgs,
}

/// Logical type of a declared parameter or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    U32,
    S32,
    U64,
    F32,
    F64,
    /// Guest pointer (32-bit address).
    Ptr,
    /// Guest BOOL (a 32-bit word; nonzero is true).
    Bool,
    /// Variadic-tail marker; terminates the declared list.
    VarArgs,
}

/// A marshaled argument or result value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    U32(u32),
    S32(i32),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(u32),
    Bool(bool),
    /// Stand-in produced for a variadic tail; not a readable value.
    VarArgs,
}

impl Value {
    pub fn as_ptr(&self) -> Option<u32> {
        match *self {
            Value::Ptr(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::U32(v) => Some(v),
            Value::S32(v) => Some(v as u32),
            Value::Ptr(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::U32(v) => write!(f, "{v}"),
            Value::S32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Ptr(v) => write!(f, "{v:#010x}"),
            Value::Bool(v) => write!(f, "{}", u32::from(v)),
            Value::VarArgs => write!(f, "..."),
        }
    }
}

/// One declared parameter: register class, positional index within that
/// class, logical type, and (for overflow parameters) the resolved offset
/// into the parameter save area.
///
/// The ordered list of these must match the host routine's declared arity
/// exactly; [`crate::registry::Registry`] computes it from the declaration
/// at registration time. Descriptors come only from [`layout_params`] and
/// [`receiver_info`], which keep the class/type combinations within what
/// [`read_param`] handles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamInfo {
    pub(crate) class: RegisterClass,
    /// Positional index within the class (register slot when in registers).
    pub(crate) index: u8,
    pub(crate) ty: ValueType,
    /// `Some(offset)` when the parameter overflowed to the stack.
    pub(crate) stack_offset: Option<u32>,
}

/// Read access to the guest flat-memory image, supplied by the memory
/// subsystem. Reads return `None` for unmapped addresses.
pub trait GuestMemory {
    fn read_u32(&self, address: u32) -> Option<u32>;

    fn read_u64(&self, address: u32) -> Option<u64> {
        let hi = self.read_u32(address)?;
        let lo = self.read_u32(address.wrapping_add(4))?;
        Some(u64::from(hi) << 32 | u64::from(lo))
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MarshalError {
    #[error("stack argument at {address:#010x} is unreadable")]
    UnreadableStack { address: u32 },
    #[error("register slot {index} out of range for its class")]
    SlotOutOfRange { index: u8 },
}

fn stack_address(core: &Core, offset: u32) -> u32 {
    core.stack_pointer()
        .wrapping_add(STACK_PARAM_BASE)
        .wrapping_add(offset)
}

fn read_stack_u32(core: &Core, mem: &dyn GuestMemory, offset: u32) -> Result<u32, MarshalError> {
    let address = stack_address(core, offset);
    mem.read_u32(address)
        .ok_or(MarshalError::UnreadableStack { address })
}

fn read_stack_u64(core: &Core, mem: &dyn GuestMemory, offset: u32) -> Result<u64, MarshalError> {
    let address = stack_address(core, offset);
    mem.read_u64(address)
        .ok_or(MarshalError::UnreadableStack { address })
}

/// Read one declared parameter from the guest register file/stack.
pub fn read_param(
    core: &Core,
    mem: &dyn GuestMemory,
    info: &ParamInfo,
) -> Result<Value, MarshalError> {
    match info.class {
        RegisterClass::VarArgs => Ok(Value::VarArgs),
        RegisterClass::Gpr => {
            let raw64: u64;
            let raw32: u32;
            match info.stack_offset {
                None => {
                    if info.ty == ValueType::U64 {
                        if info.index >= GPR_ARG_SLOTS - 1 {
                            return Err(MarshalError::SlotOutOfRange { index: info.index });
                        }
                        let hi = core.gpr[FIRST_GPR_ARG + info.index as usize];
                        let lo = core.gpr[FIRST_GPR_ARG + info.index as usize + 1];
                        raw64 = u64::from(hi) << 32 | u64::from(lo);
                        raw32 = lo;
                    } else {
                        if info.index >= GPR_ARG_SLOTS {
                            return Err(MarshalError::SlotOutOfRange { index: info.index });
                        }
                        raw32 = core.gpr[FIRST_GPR_ARG + info.index as usize];
                        raw64 = u64::from(raw32);
                    }
                }
                Some(offset) => {
                    if info.ty == ValueType::U64 {
                        raw64 = read_stack_u64(core, mem, offset)?;
                        raw32 = raw64 as u32;
                    } else {
                        raw32 = read_stack_u32(core, mem, offset)?;
                        raw64 = u64::from(raw32);
                    }
                }
            }
            Ok(match info.ty {
                ValueType::U32 => Value::U32(raw32),
                ValueType::S32 => Value::S32(raw32 as i32),
                ValueType::U64 => Value::U64(raw64),
                ValueType::Ptr => Value::Ptr(raw32),
                ValueType::Bool => Value::Bool(raw32 != 0),
                ValueType::F32 | ValueType::F64 | ValueType::VarArgs => {
                    unreachable!("registration never assigns {:?} to a GPR", info.ty)
                }
            })
        }
        RegisterClass::Fpr => {
            let raw: f64 = match info.stack_offset {
                None => {
                    if info.index >= FPR_ARG_SLOTS {
                        return Err(MarshalError::SlotOutOfRange { index: info.index });
                    }
                    core.fpr[FIRST_FPR_ARG + info.index as usize].value
                }
                Some(offset) => f64::from_bits(read_stack_u64(core, mem, offset)?),
            };
            Ok(match info.ty {
                ValueType::F32 => Value::F32(raw as f32),
                ValueType::F64 => Value::F64(raw),
                _ => unreachable!("registration never assigns {:?} to an FPR", info.ty),
            })
        }
    }
}

/// Place a routine's result back into the guest register file.
pub fn write_result(core: &mut Core, value: Value) {
    match value {
        Value::U32(v) => core.gpr[3] = v,
        Value::S32(v) => core.gpr[3] = v as u32,
        Value::Ptr(v) => core.gpr[3] = v,
        Value::Bool(v) => core.gpr[3] = u32::from(v),
        Value::U64(v) => {
            core.gpr[3] = (v >> 32) as u32;
            core.gpr[4] = v as u32;
        }
        Value::F32(v) => core.fpr[1].value = f64::from(v),
        Value::F64(v) => core.fpr[1].value = v,
        Value::VarArgs => {}
    }
}

/// Compute the descriptor list for a declaration-ordered parameter list.
///
/// `member` reserves general-purpose slot 0 for the receiver; declared
/// integer parameters then start at slot 1. A [`ValueType::VarArgs`] entry
/// terminates assignment.
pub fn layout_params(types: &[ValueType], member: bool) -> Vec<ParamInfo> {
    let mut gpr_slot: u8 = if member { 1 } else { 0 };
    let mut fpr_slot: u8 = 0;
    let mut stack_off: u32 = 0;
    let mut params = Vec::with_capacity(types.len());

    for &ty in types {
        let info = match ty {
            ValueType::VarArgs => ParamInfo {
                class: RegisterClass::VarArgs,
                index: 0,
                ty,
                stack_offset: None,
            },
            ValueType::F32 | ValueType::F64 => {
                let info = if fpr_slot < FPR_ARG_SLOTS {
                    ParamInfo {
                        class: RegisterClass::Fpr,
                        index: fpr_slot,
                        ty,
                        stack_offset: None,
                    }
                } else {
                    stack_off = (stack_off + 7) & !7;
                    let info = ParamInfo {
                        class: RegisterClass::Fpr,
                        index: fpr_slot,
                        ty,
                        stack_offset: Some(stack_off),
                    };
                    stack_off += 8;
                    info
                };
                fpr_slot = fpr_slot.saturating_add(1);
                info
            }
            ValueType::U64 => {
                // Register pairs start on an even slot.
                gpr_slot += gpr_slot & 1;
                let info = if gpr_slot + 1 < GPR_ARG_SLOTS {
                    ParamInfo {
                        class: RegisterClass::Gpr,
                        index: gpr_slot,
                        ty,
                        stack_offset: None,
                    }
                } else {
                    stack_off = (stack_off + 7) & !7;
                    let info = ParamInfo {
                        class: RegisterClass::Gpr,
                        index: gpr_slot,
                        ty,
                        stack_offset: Some(stack_off),
                    };
                    stack_off += 8;
                    info
                };
                gpr_slot = gpr_slot.saturating_add(2);
                info
            }
            _ => {
                let info = if gpr_slot < GPR_ARG_SLOTS {
                    ParamInfo {
                        class: RegisterClass::Gpr,
                        index: gpr_slot,
                        ty,
                        stack_offset: None,
                    }
                } else {
                    let info = ParamInfo {
                        class: RegisterClass::Gpr,
                        index: gpr_slot,
                        ty,
                        stack_offset: Some(stack_off),
                    };
                    stack_off += 4;
                    info
                };
                gpr_slot = gpr_slot.saturating_add(1);
                info
            }
        };
        params.push(info);
        if ty == ValueType::VarArgs {
            break;
        }
    }
    params
}

/// Descriptor for a member-function receiver: the reserved slot,
/// independent of the declared parameter list.
pub fn receiver_info() -> ParamInfo {
    ParamInfo {
        class: RegisterClass::Gpr,
        index: 0,
        ty: ValueType::Ptr,
        stack_offset: None,
    }
}
