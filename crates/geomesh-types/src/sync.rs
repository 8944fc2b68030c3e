//! Lock helpers shared by the in-memory registries.
//!
//! Registries guard their maps with `std::sync::RwLock` and per-entry state
//! with `std::sync::Mutex`. Critical sections never span an `.await`. A lock
//! poisoned by a panicking thread is recovered rather than propagated: the
//! worst outcome is a stale entry, while refusing all further access would
//! take the whole registry down.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquires a read guard, recovering from poisoning.
pub fn read_or_recover<'a, T>(lock: &'a RwLock<T>, name: &str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(registry = name, "registry lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Acquires a write guard, recovering from poisoning.
pub fn write_or_recover<'a, T>(lock: &'a RwLock<T>, name: &str) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(registry = name, "registry lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Acquires a mutex guard, recovering from poisoning.
pub fn lock_or_recover<'a, T>(lock: &'a Mutex<T>, name: &str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(registry = name, "registry lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
