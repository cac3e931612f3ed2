//! Lock acquisition that survives panics in sibling threads.
//!
//! lowmemd shares exactly three locks across threads: the registry table
//! (write-locked by the main thread, read-locked by the watchdog during a
//! victim sweep), the reaper work queue (main thread pushes, workers pop)
//! and the watchdog deadline. If one of those threads panics inside a
//! critical section, std marks the lock poisoned and every later
//! acquisition returns an error. For this daemon that default is wrong: a
//! wedged low-memory killer means the next memory squeeze freezes the
//! device, which is strictly worse than continuing after a lost update.
//! The guard state these locks protect (record links, a deadline, a queue
//! of reap targets) stays structurally sound even when a holder dies
//! mid-update, so the helpers below take the lock anyway and leave a log
//! trace of the panic.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::warn;

/// Acquire a mutex even when a panicking holder poisoned it.
pub trait MutexExt<T> {
    fn lock_poisoned(&self) -> MutexGuard<'_, T>;
}

/// Acquire a read/write lock even when a panicking holder poisoned it.
pub trait RwLockExt<T> {
    fn read_poisoned(&self) -> RwLockReadGuard<'_, T>;
    fn write_poisoned(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_poisoned(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Continuing past a poisoned mutex; a reaper or watchdog thread has panicked");
                poisoned.into_inner()
            }
        }
    }
}

impl<T> RwLockExt<T> for RwLock<T> {
    fn read_poisoned(&self) -> RwLockReadGuard<'_, T> {
        match self.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Reading past a poisoned registry lock; a holder panicked mid-update");
                poisoned.into_inner()
            }
        }
    }

    fn write_poisoned(&self) -> RwLockWriteGuard<'_, T> {
        match self.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Writing past a poisoned registry lock; a holder panicked mid-update");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mutex_recovers_after_holder_panic() {
        let lock = Arc::new(Mutex::new(7i32));
        let poisoner = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("die while holding the lock");
        })
        .join();

        assert!(lock.lock().is_err());
        *lock.lock_poisoned() += 1;
        assert_eq!(*lock.lock_poisoned(), 8);
    }

    #[test]
    fn test_rwlock_recovers_after_holder_panic() {
        let lock = Arc::new(RwLock::new(vec![1, 2, 3]));
        let poisoner = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.write().unwrap();
            panic!("die while holding the lock");
        })
        .join();

        assert!(lock.read().is_err());
        assert_eq!(lock.read_poisoned().len(), 3);
        lock.write_poisoned().push(4);
        assert_eq!(lock.read_poisoned().len(), 4);
    }
}
