//! High-level emulation bridge between translated guest code and host
//! routines.
//!
//! - [`interface`]: the guest calling convention; declarative parameter
//!   descriptors ([`ParamInfo`]) interpreted by one generic marshaling
//!   routine.
//! - [`registry`]: the host routine catalogue; every registrable routine is
//!   the same shape (callable, declared name, ordered descriptor list) and
//!   the registry neither knows nor cares what a routine does.
//! - [`trace`]: diagnostic rendering of a guest→host call, read-only by
//!   construction.
//! - [`coreinit`]: guest mutex/condition objects backed by host primitives.

pub mod coreinit;
pub mod interface;
pub mod registry;
pub mod trace;

pub use coreinit::{register_sync_routines, CoreinitState, OsCondition, OsMutex, SyncError};
pub use interface::{
    read_param, write_result, GuestMemory, MarshalError, ParamInfo, RegisterClass, Value,
    ValueType,
};
pub use registry::{CallArgs, HleError, HostRoutine, Registry, RoutineId};
pub use trace::render_trace;
