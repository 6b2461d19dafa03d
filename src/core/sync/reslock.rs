//! # Resource Lock
//!
//! A reader/writer lock allowing multiple shared owners or a single
//! exclusive owner. Waiting blocks the thread instead of spinning.
//!
//! Every acquisition enters a [`CriticalRegion`] first and leaves it after
//! the release. The lock is not re-entrant: acquiring it exclusively twice on
//! one thread deadlocks.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use super::critical::CriticalRegion;

#[derive(Debug, Default)]
struct ResourceState {
    shared_owners: u32,
    exclusive_owned: bool,
    exclusive_waiters: u32,
}

/// Reader/writer resource lock
#[derive(Debug, Default)]
pub struct ResourceLock {
    state: Mutex<ResourceState>,
    shared_wait: Condvar,
    exclusive_wait: Condvar,
}

impl ResourceLock {
    /// Creates a new [`ResourceLock`] with no owners.
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(ResourceState {
                shared_owners: 0,
                exclusive_owned: false,
                exclusive_waiters: 0,
            }),
            shared_wait: Condvar::new(),
            exclusive_wait: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ResourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the lock for shared access.
    ///
    /// Blocks while an exclusive owner exists or exclusive acquirers are
    /// queued, so a steady stream of readers cannot starve a writer.
    pub fn acquire_shared(&self) -> SharedGuard<'_> {
        let region = CriticalRegion::enter();
        let state = self.state();
        let mut state = self
            .shared_wait
            .wait_while(state, |s| s.exclusive_owned || s.exclusive_waiters > 0)
            .unwrap_or_else(PoisonError::into_inner);
        state.shared_owners += 1;

        SharedGuard {
            lock: self,
            _region: region,
        }
    }

    /// Acquire the lock for shared access ahead of queued exclusive waiters.
    ///
    /// Only an active exclusive owner blocks this call.
    pub fn acquire_shared_starve_exclusive(&self) -> SharedGuard<'_> {
        let region = CriticalRegion::enter();
        let state = self.state();
        let mut state = self
            .shared_wait
            .wait_while(state, |s| s.exclusive_owned)
            .unwrap_or_else(PoisonError::into_inner);
        state.shared_owners += 1;

        SharedGuard {
            lock: self,
            _region: region,
        }
    }

    /// Acquire the lock for exclusive access.
    ///
    /// Blocks until there are no shared owners and no exclusive owner.
    pub fn acquire_exclusive(&self) -> ExclusiveGuard<'_> {
        let region = CriticalRegion::enter();
        let mut state = self.state();
        state.exclusive_waiters += 1;
        let mut state = self
            .exclusive_wait
            .wait_while(state, |s| s.exclusive_owned || s.shared_owners > 0)
            .unwrap_or_else(PoisonError::into_inner);
        state.exclusive_waiters -= 1;
        state.exclusive_owned = true;

        ExclusiveGuard {
            lock: self,
            _region: region,
        }
    }

    /// Number of current shared owners
    pub fn shared_owners(&self) -> u32 {
        self.state().shared_owners
    }

    /// Whether an exclusive owner holds the lock
    pub fn is_exclusively_owned(&self) -> bool {
        self.state().exclusive_owned
    }

    /// Number of threads queued for exclusive access
    pub fn exclusive_waiters(&self) -> u32 {
        self.state().exclusive_waiters
    }

    fn release_shared(&self) {
        let mut state = self.state();
        state.shared_owners -= 1;
        if state.shared_owners == 0 && state.exclusive_waiters > 0 {
            self.exclusive_wait.notify_one();
        }
    }

    fn release_exclusive(&self) {
        let mut state = self.state();
        state.exclusive_owned = false;
        if state.exclusive_waiters > 0 {
            self.exclusive_wait.notify_one();
        }
        // Starve-exclusive readers may proceed even with writers queued.
        self.shared_wait.notify_all();
    }
}

/// Shared ownership of a [`ResourceLock`], released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SharedGuard<'a> {
    lock: &'a ResourceLock,
    _region: CriticalRegion,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

/// Exclusive ownership of a [`ResourceLock`], released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ExclusiveGuard<'a> {
    lock: &'a ResourceLock,
    _region: CriticalRegion,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}
