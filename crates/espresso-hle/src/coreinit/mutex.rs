//! Guest mutex and condition objects.
//!
//! Both kinds share one pattern: a guest-visible identity (type tag plus an
//! optional guest-addressable name, kept for introspection) and an
//! exclusively owned host primitive constructed at init and destroyed with
//! the object. Every operation validates the tag first; an object used
//! before initialization fails detectably instead of corrupting the host
//! primitive.
//!
//! The host mutex is recursive (same logical owner may re-acquire) because
//! guest code relies on it; std's `Mutex` is not, so ownership and depth are
//! tracked explicitly. That bookkeeping is also what lets `wait` strip a
//! caller's entire recursion depth atomically and restore it on wake.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use thiserror::Error;

/// Tag of an initialized mutex ('mUtX').
pub const MUTEX_TAG: u32 = 0x6D55_7458;
/// Tag of an initialized condition ('cNdV').
pub const COND_TAG: u32 = 0x634E_6456;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// Wrong or zero tag: use before init, or the wrong object kind.
    #[error("sync object tag {found:#010x}, expected {expected:#010x} (used before init?)")]
    BadTag { expected: u32, found: u32 },
    /// Release attempted by a thread that does not own the mutex.
    #[error("mutex released by a non-owning thread")]
    NotOwner,
    /// No initialized object lives at the given guest address.
    #[error("no sync object initialized at {address:#010x}")]
    Uninitialized { address: u32 },
}

#[derive(Debug, Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// Recursive host mutex: same-owner acquisition nests, release is
/// per-level, and full ownership can be stripped/restored for condition
/// waits.
#[derive(Debug, Default)]
pub struct RecursiveMutex {
    state: Mutex<OwnerState>,
    released: Condvar,
}

impl RecursiveMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => {
                    state = self.released.wait(state).unwrap();
                }
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one level of ownership.
    pub fn unlock(&self) -> Result<(), SyncError> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        if state.owner != Some(me) {
            return Err(SyncError::NotOwner);
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_all();
        }
        Ok(())
    }

    /// Strip the caller's entire ownership, returning the depth to restore.
    fn release_all(&self) -> Result<u32, SyncError> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        if state.owner != Some(me) {
            return Err(SyncError::NotOwner);
        }
        let depth = state.depth;
        state.owner = None;
        state.depth = 0;
        self.released.notify_all();
        Ok(depth)
    }

    /// Re-acquire to a previously stripped depth.
    fn acquire_to_depth(&self, depth: u32) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = depth;
                    return;
                }
                _ => {
                    state = self.released.wait(state).unwrap();
                }
            }
        }
    }

    #[cfg(test)]
    fn depth_held_by_current(&self) -> u32 {
        let state = self.state.lock().unwrap();
        if state.owner == Some(thread::current().id()) {
            state.depth
        } else {
            0
        }
    }
}

fn check_tag(expected: u32, found: u32) -> Result<(), SyncError> {
    if found == expected {
        Ok(())
    } else {
        Err(SyncError::BadTag { expected, found })
    }
}

/// Guest mutex object.
#[derive(Debug, Default)]
pub struct OsMutex {
    tag: u32,
    /// Guest address of a debug name, when initialized with the `Ex` form.
    name: Option<u32>,
    host: RecursiveMutex,
}

impl OsMutex {
    /// Construct an initialized mutex (the `OSInitMutex` path).
    pub fn new() -> Self {
        Self {
            tag: MUTEX_TAG,
            name: None,
            host: RecursiveMutex::new(),
        }
    }

    /// Construct an initialized, named mutex (the `OSInitMutexEx` path).
    pub fn new_named(name: u32) -> Self {
        Self {
            name: Some(name),
            ..Self::new()
        }
    }

    pub fn name(&self) -> Option<u32> {
        self.name
    }

    /// Block until acquired. Recursive acquisition by the same logical
    /// owner succeeds and must be released the same number of times.
    pub fn lock(&self) -> Result<(), SyncError> {
        check_tag(MUTEX_TAG, self.tag)?;
        self.host.lock();
        Ok(())
    }

    /// Non-blocking acquisition attempt.
    pub fn try_lock(&self) -> Result<bool, SyncError> {
        check_tag(MUTEX_TAG, self.tag)?;
        Ok(self.host.try_lock())
    }

    /// Release one level of ownership.
    pub fn unlock(&self) -> Result<(), SyncError> {
        check_tag(MUTEX_TAG, self.tag)?;
        self.host.unlock()
    }
}

/// Guest condition object.
///
/// Not bound to any single mutex: `wait` accepts whichever mutex the caller
/// supplies at wait time.
#[derive(Debug, Default)]
pub struct OsCondition {
    tag: u32,
    name: Option<u32>,
    queue: Mutex<()>,
    wakeup: Condvar,
}

impl OsCondition {
    pub fn new() -> Self {
        Self {
            tag: COND_TAG,
            name: None,
            queue: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    pub fn new_named(name: u32) -> Self {
        Self {
            name: Some(name),
            ..Self::new()
        }
    }

    pub fn name(&self) -> Option<u32> {
        self.name
    }

    /// Atomically release the caller's ownership of `mutex`, block until
    /// signaled, then re-acquire `mutex` to the same depth before
    /// returning.
    ///
    /// Spurious wakeups are permitted; callers re-check their own predicate
    /// after return. There is deliberately no predicate retry in here, since
    /// guest code depends on the wakeup being observable.
    pub fn wait(&self, mutex: &OsMutex) -> Result<(), SyncError> {
        check_tag(COND_TAG, self.tag)?;
        check_tag(MUTEX_TAG, mutex.tag)?;

        // Holding the queue lock from before the mutex release until the
        // condvar wait closes the window where a signal could slip between
        // "release mutex" and "start waiting".
        let queue: MutexGuard<'_, ()> = self.queue.lock().unwrap();
        let depth = mutex.host.release_all()?;
        let queue = self.wakeup.wait(queue).unwrap();
        drop(queue);
        mutex.host.acquire_to_depth(depth);
        Ok(())
    }

    /// Wake every thread currently blocked in [`OsCondition::wait`] on this
    /// object. Broadcast is the only semantic at this boundary; no
    /// single-wake variant exists. No FIFO ordering among woken threads is
    /// guaranteed.
    pub fn signal(&self) -> Result<(), SyncError> {
        check_tag(COND_TAG, self.tag)?;
        let _queue = self.queue.lock().unwrap();
        self.wakeup.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn uninitialized_objects_fail_the_tag_check() {
        let mutex = OsMutex::default();
        assert!(matches!(mutex.lock(), Err(SyncError::BadTag { .. })));
        assert!(matches!(mutex.try_lock(), Err(SyncError::BadTag { .. })));
        let cond = OsCondition::default();
        assert!(matches!(cond.signal(), Err(SyncError::BadTag { .. })));
        assert!(matches!(
            cond.wait(&OsMutex::new()),
            Err(SyncError::BadTag { .. })
        ));
    }

    #[test]
    fn recursive_lock_unlock_balances() {
        let mutex = OsMutex::new();
        mutex.lock().unwrap();
        mutex.lock().unwrap();
        assert_eq!(mutex.host.depth_held_by_current(), 2);
        mutex.unlock().unwrap();
        assert_eq!(mutex.host.depth_held_by_current(), 1);
        mutex.unlock().unwrap();
        assert_eq!(mutex.host.depth_held_by_current(), 0);

        // Now available to another owner.
        let mutex = Arc::new(mutex);
        let other = Arc::clone(&mutex);
        let grabbed = std::thread::spawn(move || other.try_lock().unwrap())
            .join()
            .unwrap();
        assert!(grabbed);
    }

    #[test]
    fn second_owner_blocks_until_release() {
        let mutex = Arc::new(OsMutex::new());
        mutex.lock().unwrap();

        let contender = Arc::clone(&mutex);
        let handle = std::thread::spawn(move || {
            assert!(!contender.try_lock().unwrap());
            contender.lock().unwrap(); // blocks until the main thread unlocks
            contender.unlock().unwrap();
        });

        std::thread::sleep(Duration::from_millis(20));
        mutex.unlock().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let mutex = Arc::new(OsMutex::new());
        mutex.lock().unwrap();
        let other = Arc::clone(&mutex);
        let result = std::thread::spawn(move || other.unlock()).join().unwrap();
        assert_eq!(result, Err(SyncError::NotOwner));
        mutex.unlock().unwrap();
    }

    #[test]
    fn wait_releases_recursion_depth_for_other_threads() {
        let mutex = Arc::new(OsMutex::new());
        let cond = Arc::new(OsCondition::new());

        let waiter_mutex = Arc::clone(&mutex);
        let waiter_cond = Arc::clone(&cond);
        let waiter = std::thread::spawn(move || {
            waiter_mutex.lock().unwrap();
            waiter_mutex.lock().unwrap(); // depth 2 going into the wait
            waiter_cond.wait(&waiter_mutex).unwrap();
            // Depth restored after wake.
            assert_eq!(waiter_mutex.host.depth_held_by_current(), 2);
            waiter_mutex.unlock().unwrap();
            waiter_mutex.unlock().unwrap();
        });

        // The signaler must be able to take the mutex while the waiter is
        // blocked, despite the waiter's recursive hold.
        loop {
            if mutex.try_lock().unwrap() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond.signal().unwrap();
        mutex.unlock().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn signal_wakes_every_waiter() {
        let mutex = Arc::new(OsMutex::new());
        let cond = Arc::new(OsCondition::new());

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let m = Arc::clone(&mutex);
                let c = Arc::clone(&cond);
                std::thread::spawn(move || {
                    m.lock().unwrap();
                    c.wait(&m).unwrap();
                    m.unlock().unwrap();
                })
            })
            .collect();

        // Let both threads reach the wait; a single broadcast must then
        // release them all.
        std::thread::sleep(Duration::from_millis(50));
        mutex.lock().unwrap();
        cond.signal().unwrap();
        mutex.unlock().unwrap();
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}
