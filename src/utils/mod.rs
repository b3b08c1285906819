//! The `utils` module provides shared definitions used across the bridge:
//! the error types every layer returns and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{BridgeError, BrokerError, PublishError};


use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// All state guarded this way is left consistent between statements, so a
/// poisoned lock carries no torn data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
