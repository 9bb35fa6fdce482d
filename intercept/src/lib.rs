//! metahook-intercept: code patching and loader-lookup redirection for metahook.

pub mod code;
pub mod linkent;
pub mod module;
pub mod stub;
pub mod types;

pub use linkent::{install_lookup_redirect, locate_lookup, SymbolHookState};
pub use types::HookError;

/// Process-global lock for tests that modify executable code.
///
/// All tests that patch code must hold this lock so that two tests never
/// rewrite the same page at once.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
