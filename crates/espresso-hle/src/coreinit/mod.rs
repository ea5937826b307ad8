//! Guest OS synchronization services.
//!
//! Guest threads are host threads here, so guest mutexes and conditions are
//! emulated directly on top of host primitives rather than by a guest
//! scheduler. Objects are identified by the guest address of their control
//! block; [`CoreinitState`] owns the host-side objects keyed by that
//! address.

mod mutex;

pub use mutex::{OsCondition, OsMutex, RecursiveMutex, SyncError, COND_TAG, MUTEX_TAG};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::registry::{CallArgs, HleError, Registry};
use crate::interface::{Value, ValueType};

/// Host-side table of live guest sync objects, keyed by the guest address
/// of each control block.
#[derive(Default)]
pub struct CoreinitState {
    mutexes: Mutex<HashMap<u32, Arc<OsMutex>>>,
    conds: Mutex<HashMap<u32, Arc<OsCondition>>>,
}

impl CoreinitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize (or re-initialize) the mutex at `address`.
    pub fn init_mutex(&self, address: u32, name: Option<u32>) {
        let mutex = match name {
            Some(name) => OsMutex::new_named(name),
            None => OsMutex::new(),
        };
        self.mutexes
            .lock()
            .unwrap()
            .insert(address, Arc::new(mutex));
    }

    /// Initialize (or re-initialize) the condition at `address`.
    pub fn init_cond(&self, address: u32, name: Option<u32>) {
        let cond = match name {
            Some(name) => OsCondition::new_named(name),
            None => OsCondition::new(),
        };
        self.conds.lock().unwrap().insert(address, Arc::new(cond));
    }

    pub fn mutex(&self, address: u32) -> Result<Arc<OsMutex>, SyncError> {
        self.mutexes
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .ok_or(SyncError::Uninitialized { address })
    }

    pub fn cond(&self, address: u32) -> Result<Arc<OsCondition>, SyncError> {
        self.conds
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .ok_or(SyncError::Uninitialized { address })
    }
}

// Declared types fix every argument here as Ptr; address 0 (never a valid
// control block) falls through to the uninitialized-object error.
fn ptr_arg(call: &CallArgs, index: usize) -> u32 {
    call.args.get(index).and_then(Value::as_ptr).unwrap_or(0)
}

/// Register the guest-visible sync routines against `registry`.
pub fn register_sync_routines(registry: &mut Registry, state: Arc<CoreinitState>) {
    let s = Arc::clone(&state);
    registry.register(
        "OSInitMutex",
        &[ValueType::Ptr],
        Box::new(move |_core, _mem, call| {
            s.init_mutex(ptr_arg(call, 0), None);
            Ok(None)
        }),
    );

    let s = Arc::clone(&state);
    registry.register(
        "OSInitMutexEx",
        &[ValueType::Ptr, ValueType::Ptr],
        Box::new(move |_core, _mem, call| {
            s.init_mutex(ptr_arg(call, 0), Some(ptr_arg(call, 1)));
            Ok(None)
        }),
    );

    let s = Arc::clone(&state);
    registry.register(
        "OSLockMutex",
        &[ValueType::Ptr],
        Box::new(move |_core, _mem, call| {
            s.mutex(ptr_arg(call, 0))?.lock().map_err(HleError::Sync)?;
            Ok(None)
        }),
    );

    let s = Arc::clone(&state);
    registry.register(
        "OSTryLockMutex",
        &[ValueType::Ptr],
        Box::new(move |_core, _mem, call| {
            let acquired = s.mutex(ptr_arg(call, 0))?.try_lock()?;
            Ok(Some(Value::Bool(acquired)))
        }),
    );

    let s = Arc::clone(&state);
    registry.register(
        "OSUnlockMutex",
        &[ValueType::Ptr],
        Box::new(move |_core, _mem, call| {
            s.mutex(ptr_arg(call, 0))?.unlock()?;
            Ok(None)
        }),
    );

    let s = Arc::clone(&state);
    registry.register(
        "OSInitCond",
        &[ValueType::Ptr],
        Box::new(move |_core, _mem, call| {
            s.init_cond(ptr_arg(call, 0), None);
            Ok(None)
        }),
    );

    let s = Arc::clone(&state);
    registry.register(
        "OSInitCondEx",
        &[ValueType::Ptr, ValueType::Ptr],
        Box::new(move |_core, _mem, call| {
            s.init_cond(ptr_arg(call, 0), Some(ptr_arg(call, 1)));
            Ok(None)
        }),
    );

    let s = Arc::clone(&state);
    registry.register(
        "OSWaitCond",
        &[ValueType::Ptr, ValueType::Ptr],
        Box::new(move |_core, _mem, call| {
            let cond = s.cond(ptr_arg(call, 0))?;
            let mutex = s.mutex(ptr_arg(call, 1))?;
            cond.wait(&mutex)?;
            Ok(None)
        }),
    );

    let s = state;
    registry.register(
        "OSSignalCond",
        &[ValueType::Ptr],
        Box::new(move |_core, _mem, call| {
            s.cond(ptr_arg(call, 0))?.signal()?;
            Ok(None)
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objects_are_looked_up_by_guest_address() {
        let state = CoreinitState::new();
        state.init_mutex(0x1000_0000, None);
        state.init_cond(0x1000_0040, Some(0x1000_0080));

        assert!(state.mutex(0x1000_0000).is_ok());
        assert_eq!(state.cond(0x1000_0040).unwrap().name(), Some(0x1000_0080));
        assert_eq!(
            state.mutex(0x2000_0000).unwrap_err(),
            SyncError::Uninitialized {
                address: 0x2000_0000
            }
        );
    }

    #[test]
    fn reinitialization_replaces_the_object() {
        let state = CoreinitState::new();
        state.init_mutex(0x1000_0000, None);
        let first = state.mutex(0x1000_0000).unwrap();
        first.lock().unwrap();

        state.init_mutex(0x1000_0000, None);
        let second = state.mutex(0x1000_0000).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.try_lock().unwrap()); // fresh object, unowned
    }
}
