pub mod process;
pub mod worker;

use std::sync::{Mutex, MutexGuard};

/// Locks a shared table, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
