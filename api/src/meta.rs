//! Plugin result protocol.
//!
//! Handlers report what they did by writing a [`MetaResult`] into the
//! calling thread's [`MetaGlobals`] before returning. Native plugins reach
//! the block through [`meta_globals`].

use std::cell::UnsafeCell;

use crate::ret::{RetType, ReturnBox};

/// A handler's decision for one call. Ordered by strength; a call's status
/// is the strongest result any handler reported.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MetaResult {
    /// Handler did not report anything.
    #[default]
    Unset = 0,
    /// Observed only.
    Ignored,
    /// Acted, but the real function still runs and its value is returned.
    Handled,
    /// Real function still runs, handler's value is returned.
    Override,
    /// Real function is skipped, handler's value is returned.
    Supercede,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetaGlobals {
    /// Result the current handler reports.
    pub mres: MetaResult,
    /// Result the previous handler reported.
    pub prev_mres: MetaResult,
    /// Strongest result so far in this call.
    pub status: MetaResult,
    /// Value returned by the real function (post handlers only).
    pub orig_ret: ReturnBox,
    /// Value that will be returned if `status >= Override`.
    pub override_ret: ReturnBox,
}

impl MetaGlobals {
    pub const fn new() -> Self {
        Self {
            mres: MetaResult::Unset,
            prev_mres: MetaResult::Unset,
            status: MetaResult::Unset,
            orig_ret: ReturnBox::Void,
            override_ret: ReturnBox::Void,
        }
    }

    /// Fresh state for a call returning `ret`.
    pub const fn for_call(ret: RetType) -> Self {
        Self {
            orig_ret: ReturnBox::zeroed(ret),
            override_ret: ReturnBox::zeroed(ret),
            ..Self::new()
        }
    }
}

impl Default for MetaGlobals {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static GLOBALS: UnsafeCell<MetaGlobals> = const { UnsafeCell::new(MetaGlobals::new()) };
}

/// Address of this thread's globals block.
///
/// Valid for the lifetime of the calling thread. Only the thread that
/// obtained it may touch it.
pub fn meta_globals() -> *mut MetaGlobals {
    GLOBALS.with(|g| g.get())
}

/// Run `f` with exclusive access to this thread's globals.
///
/// `f` must not call back into anything that hands out the globals
/// (including dispatched APIs).
pub fn with_globals<R>(f: impl FnOnce(&mut MetaGlobals) -> R) -> R {
    // SAFETY: thread-local, and `f` is not allowed to reenter.
    GLOBALS.with(|g| f(unsafe { &mut *g.get() }))
}

pub fn set_result(result: MetaResult) {
    with_globals(|g| g.mres = result);
}

pub fn result() -> MetaResult {
    with_globals(|g| g.mres)
}

pub fn snapshot() -> MetaGlobals {
    with_globals(|g| *g)
}

pub fn restore(saved: MetaGlobals) {
    with_globals(|g| *g = saved);
}
