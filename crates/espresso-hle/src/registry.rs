//! The host routine catalogue.
//!
//! Every registrable routine has the same shape: a callable, a declared
//! name, and the ordered parameter descriptor list computed at registration.
//! Ids are assigned in registration order and stay stable for the process,
//! so translated code can embed them.

use espresso_cpu::Core;
use thiserror::Error;

use crate::coreinit::SyncError;
use crate::interface::{
    layout_params, read_param, receiver_info, write_result, GuestMemory, MarshalError, ParamInfo,
    Value, ValueType,
};
use crate::trace::render_trace;

/// Stable identifier of a registered routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutineId(pub u32);

#[derive(Debug, Error)]
pub enum HleError {
    #[error("unknown host routine id {}", (.0).0)]
    UnknownRoutine(RoutineId),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Marshaled arguments handed to a host routine.
#[derive(Debug, Clone)]
pub struct CallArgs {
    /// Receiver, read from the reserved slot, when the routine is shaped as
    /// a member function.
    pub receiver: Option<Value>,
    /// Declared arguments in declaration order. A variadic tail appears as
    /// a single trailing [`Value::VarArgs`].
    pub args: Vec<Value>,
}

pub type Handler =
    Box<dyn Fn(&mut Core, &mut dyn GuestMemory, &CallArgs) -> Result<Option<Value>, HleError> + Send + Sync>;

pub struct HostRoutine {
    pub name: &'static str,
    pub params: Vec<ParamInfo>,
    /// `Some` when shaped as a member function; holds the reserved-slot
    /// descriptor.
    pub receiver: Option<ParamInfo>,
    handler: Handler,
}

#[derive(Default)]
pub struct Registry {
    routines: Vec<HostRoutine>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a free routine. The descriptor list is computed from the
    /// declaration-ordered types and must match the handler's expectations.
    pub fn register(
        &mut self,
        name: &'static str,
        types: &[ValueType],
        handler: Handler,
    ) -> RoutineId {
        self.push(name, layout_params(types, false), None, handler)
    }

    /// Register a member-shaped routine: the receiver is read from the
    /// reserved slot and declared parameters are laid out after it.
    pub fn register_member(
        &mut self,
        name: &'static str,
        types: &[ValueType],
        handler: Handler,
    ) -> RoutineId {
        self.push(name, layout_params(types, true), Some(receiver_info()), handler)
    }

    fn push(
        &mut self,
        name: &'static str,
        params: Vec<ParamInfo>,
        receiver: Option<ParamInfo>,
        handler: Handler,
    ) -> RoutineId {
        let id = RoutineId(self.routines.len() as u32);
        self.routines.push(HostRoutine {
            name,
            params,
            receiver,
            handler,
        });
        id
    }

    pub fn routine(&self, id: RoutineId) -> Option<&HostRoutine> {
        self.routines.get(id.0 as usize)
    }

    pub fn lookup_name(&self, name: &str) -> Option<RoutineId> {
        self.routines
            .iter()
            .position(|r| r.name == name)
            .map(|i| RoutineId(i as u32))
    }

    /// Invoke a registered routine against the calling guest thread.
    ///
    /// Marshals the receiver (if any) and each declared parameter in
    /// declaration order, dispatches, and writes the result back per the
    /// convention. When call tracing is enabled, the rendered line is
    /// emitted *before* dispatch; trace rendering can never fail the call.
    pub fn call(
        &self,
        id: RoutineId,
        core: &mut Core,
        mem: &mut dyn GuestMemory,
    ) -> Result<Option<Value>, HleError> {
        let routine = self.routine(id).ok_or(HleError::UnknownRoutine(id))?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(target: "hle", "{}", render_trace(core, mem, routine));
        }

        let receiver = match &routine.receiver {
            Some(info) => Some(read_param(core, mem, info)?),
            None => None,
        };
        let mut args = Vec::with_capacity(routine.params.len());
        for info in &routine.params {
            args.push(read_param(core, mem, info)?);
        }

        let call = CallArgs { receiver, args };
        let result = (routine.handler)(core, mem, &call)?;
        if let Some(value) = result {
            write_result(core, value);
        }
        Ok(result)
    }
}
