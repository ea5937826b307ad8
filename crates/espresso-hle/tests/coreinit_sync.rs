//! Guest sync routines end to end: registered handlers, marshaled pointer
//! arguments, host threads standing in for guest threads.

use std::sync::Arc;
use std::time::Duration;

use espresso_cpu::Core;
use espresso_hle::{
    register_sync_routines, CoreinitState, GuestMemory, HleError, Registry, RoutineId, SyncError,
};

struct NoMemory;
impl GuestMemory for NoMemory {
    fn read_u32(&self, _address: u32) -> Option<u32> {
        None
    }
}

const MUTEX_ADDR: u32 = 0x1050_0000;
const COND_ADDR: u32 = 0x1050_0040;

struct Fixture {
    registry: Arc<Registry>,
}

impl Fixture {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
        let mut registry = Registry::new();
        register_sync_routines(&mut registry, Arc::new(CoreinitState::new()));
        Self {
            registry: Arc::new(registry),
        }
    }

    fn id(&self, name: &str) -> RoutineId {
        self.registry.lookup_name(name).unwrap()
    }

    /// Invoke `name` with up to two pointer arguments in r3/r4; returns r3
    /// after the call.
    fn call(&self, name: &str, args: &[u32]) -> Result<u32, HleError> {
        let mut core = Core::new(0);
        for (i, &arg) in args.iter().enumerate() {
            core.gpr[3 + i] = arg;
        }
        self.registry.call(self.id(name), &mut core, &mut NoMemory)?;
        Ok(core.gpr[3])
    }
}

#[test]
fn recursive_lock_then_handoff_to_another_thread() {
    let fx = Fixture::new();
    fx.call("OSInitMutex", &[MUTEX_ADDR]).unwrap();

    fx.call("OSLockMutex", &[MUTEX_ADDR]).unwrap();
    fx.call("OSLockMutex", &[MUTEX_ADDR]).unwrap();
    fx.call("OSUnlockMutex", &[MUTEX_ADDR]).unwrap();
    fx.call("OSUnlockMutex", &[MUTEX_ADDR]).unwrap();

    // Fully released: another thread acquires without blocking.
    let registry = Arc::clone(&fx.registry);
    let id = fx.id("OSTryLockMutex");
    let acquired = std::thread::spawn(move || {
        let mut core = Core::new(1);
        core.gpr[3] = MUTEX_ADDR;
        registry.call(id, &mut core, &mut NoMemory).unwrap();
        core.gpr[3]
    })
    .join()
    .unwrap();
    assert_eq!(acquired, 1);
}

#[test]
fn contended_lock_blocks_until_the_owner_releases() {
    let fx = Fixture::new();
    fx.call("OSInitMutex", &[MUTEX_ADDR]).unwrap();
    fx.call("OSLockMutex", &[MUTEX_ADDR]).unwrap();

    let registry = Arc::clone(&fx.registry);
    let try_id = fx.id("OSTryLockMutex");
    let lock_id = fx.id("OSLockMutex");
    let unlock_id = fx.id("OSUnlockMutex");
    let contender = std::thread::spawn(move || {
        let mut core = Core::new(1);
        core.gpr[3] = MUTEX_ADDR;
        registry.call(try_id, &mut core, &mut NoMemory).unwrap();
        assert_eq!(core.gpr[3], 0); // held by the main thread

        core.gpr[3] = MUTEX_ADDR;
        registry.call(lock_id, &mut core, &mut NoMemory).unwrap();
        core.gpr[3] = MUTEX_ADDR;
        registry.call(unlock_id, &mut core, &mut NoMemory).unwrap();
    });

    std::thread::sleep(Duration::from_millis(20));
    fx.call("OSUnlockMutex", &[MUTEX_ADDR]).unwrap();
    contender.join().unwrap();
}

#[test]
fn wait_and_signal_hand_off_across_threads() {
    let fx = Fixture::new();
    fx.call("OSInitMutex", &[MUTEX_ADDR]).unwrap();
    fx.call("OSInitCond", &[COND_ADDR]).unwrap();

    let registry = Arc::clone(&fx.registry);
    let lock_id = fx.id("OSLockMutex");
    let wait_id = fx.id("OSWaitCond");
    let unlock_id = fx.id("OSUnlockMutex");
    let waiter = std::thread::spawn(move || {
        let mut core = Core::new(1);
        core.gpr[3] = MUTEX_ADDR;
        registry.call(lock_id, &mut core, &mut NoMemory).unwrap();
        core.gpr[3] = COND_ADDR;
        core.gpr[4] = MUTEX_ADDR;
        registry.call(wait_id, &mut core, &mut NoMemory).unwrap();
        core.gpr[3] = MUTEX_ADDR;
        registry.call(unlock_id, &mut core, &mut NoMemory).unwrap();
    });

    // Wait releases the waiter's ownership, so this lock eventually
    // succeeds even while the waiter is blocked.
    loop {
        if fx.call("OSTryLockMutex", &[MUTEX_ADDR]).unwrap() == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    fx.call("OSSignalCond", &[COND_ADDR]).unwrap();
    fx.call("OSUnlockMutex", &[MUTEX_ADDR]).unwrap();
    waiter.join().unwrap();
}

#[test]
fn signal_broadcasts_to_all_waiters() {
    let fx = Fixture::new();
    fx.call("OSInitMutex", &[MUTEX_ADDR]).unwrap();
    fx.call("OSInitCondEx", &[COND_ADDR, 0x1060_0000]).unwrap();

    let waiters: Vec<_> = (0..2)
        .map(|i: u32| {
            let registry = Arc::clone(&fx.registry);
            let lock_id = fx.id("OSLockMutex");
            let wait_id = fx.id("OSWaitCond");
            let unlock_id = fx.id("OSUnlockMutex");
            std::thread::spawn(move || {
                let mut core = Core::new(1 + i);
                core.gpr[3] = MUTEX_ADDR;
                registry.call(lock_id, &mut core, &mut NoMemory).unwrap();
                core.gpr[3] = COND_ADDR;
                core.gpr[4] = MUTEX_ADDR;
                registry.call(wait_id, &mut core, &mut NoMemory).unwrap();
                core.gpr[3] = MUTEX_ADDR;
                registry.call(unlock_id, &mut core, &mut NoMemory).unwrap();
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(50));
    fx.call("OSLockMutex", &[MUTEX_ADDR]).unwrap();
    fx.call("OSSignalCond", &[COND_ADDR]).unwrap();
    fx.call("OSUnlockMutex", &[MUTEX_ADDR]).unwrap();
    for waiter in waiters {
        waiter.join().unwrap();
    }
}

#[test]
fn operations_on_uninitialized_objects_fail() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.call("OSLockMutex", &[0x2000_0000]),
        Err(HleError::Sync(SyncError::Uninitialized {
            address: 0x2000_0000
        }))
    ));
    assert!(matches!(
        fx.call("OSSignalCond", &[0x2000_0000]),
        Err(HleError::Sync(SyncError::Uninitialized { .. }))
    ));
}
