//! Shared test helpers for this crate's unit tests.

use std::sync::{Mutex, OnceLock};

/// Serialises tests that mutate process-wide environment variables, since
/// `cargo test` runs unit tests in the same process concurrently.
pub fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
