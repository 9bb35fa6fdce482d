//! Loader-lookup redirection ("linkents").
//!
//! The loader's symbol lookup routine is overwritten with a jump to
//! [`intercept`]. While armed, a lookup scoped to the *subject* module that
//! the subject cannot satisfy is retried against the *owner* module, so
//! the subject appears to export everything the owner does.
//!
//! Each call disarms the routine before doing any real lookup and re-arms it
//! afterwards, so the real routine never runs into its own stub. The window
//! between disarm and re-arm is not atomic with respect to other threads
//! that enter the routine without taking the lock.
//!
//! The real routine is reached through a fresh call from [`intercept`], so
//! it sees this crate as its caller. `RTLD_NEXT` is resolved relative to the
//! caller's module, which means an `RTLD_NEXT` lookup made while armed
//! searches from here rather than from the original caller, even when the
//! handle is not the subject.

use core::cell::Cell;
use core::ffi::{c_char, c_void};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::debug;
use parking_lot::{Mutex, ReentrantMutex};

use crate::code::patcher::{make_writable, write_code};
use crate::stub::{encode_redirect, STUB_LEN};
use crate::types::HookError;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::*;

/// Native signature of the hooked lookup routine (`dlsym`).
pub type LookupFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;

/// Storage for one hooked routine.
///
/// Every slot type gets its own monomorphized [`intercept`] and therefore
/// its own state.
pub trait HookSlot: 'static {
    fn cell() -> &'static OnceLock<SymbolHookState>;
}

pub struct SymbolHookState {
    target: usize,
    original: [u8; STUB_LEN],
    stub: [u8; STUB_LEN],
    subject: AtomicPtr<c_void>,
    owner: AtomicPtr<c_void>,
    /// Holds the armed flag.
    lock: ReentrantMutex<Cell<bool>>,
}

// Serializes first-time installation across all slots.
static INSTALL: Mutex<()> = Mutex::new(());

impl SymbolHookState {
    unsafe fn prepare(target: usize, interceptor: usize) -> Result<Self, HookError> {
        let original = ptr::read_unaligned(target as *const [u8; STUB_LEN]);
        let cell: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
        let stub = encode_redirect(interceptor, cell)?;
        make_writable(target as *const u8, STUB_LEN)?;
        Ok(Self {
            target,
            original,
            stub,
            subject: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicPtr::new(ptr::null_mut()),
            lock: ReentrantMutex::new(Cell::new(false)),
        })
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn original_bytes(&self) -> &[u8; STUB_LEN] {
        &self.original
    }

    pub fn stub_bytes(&self) -> &[u8; STUB_LEN] {
        &self.stub
    }

    pub fn is_armed(&self) -> bool {
        self.lock.lock().get()
    }

    /// `(subject, owner)`.
    pub fn handles(&self) -> (*mut c_void, *mut c_void) {
        (self.subject.load(Ordering::Acquire), self.owner.load(Ordering::Acquire))
    }

    pub fn set_handles(&self, subject: *mut c_void, owner: *mut c_void) {
        let _guard = self.lock.lock();
        self.subject.store(subject, Ordering::Release);
        self.owner.store(owner, Ordering::Release);
    }

    fn arm(&self) {
        let armed = self.lock.lock();
        if !armed.get() {
            unsafe { write_code(self.target as *mut u8, &self.stub) };
            armed.set(true);
        }
    }

    /// Call the real routine with the stub out of the way, leaving the arm
    /// state as it was found.
    ///
    /// # Safety
    /// `handle`/`name` must be valid arguments for the real routine.
    pub unsafe fn call_original(&self, handle: *mut c_void, name: *const c_char) -> *mut c_void {
        let armed = self.lock.lock();
        let was_armed = armed.get();
        if was_armed {
            write_code(self.target as *mut u8, &self.original);
            armed.set(false);
        }
        let real: LookupFn = core::mem::transmute(self.target);
        let result = real(handle, name);
        if was_armed {
            write_code(self.target as *mut u8, &self.stub);
            armed.set(true);
        }
        result
    }
}

/// Replacement for the hooked routine. Must not log or allocate through
/// anything that could reach the loader.
unsafe extern "C" fn intercept<S: HookSlot>(handle: *mut c_void, name: *const c_char) -> *mut c_void {
    let Some(state) = S::cell().get() else {
        return ptr::null_mut();
    };
    let armed = state.lock.lock();
    let was_armed = armed.get();
    if was_armed {
        write_code(state.target as *mut u8, &state.original);
        armed.set(false);
    }

    // RTLD_NEXT resolves against our address from here on.
    let real: LookupFn = core::mem::transmute(state.target);
    let (subject, owner) = state.handles();
    let result = if subject.is_null() || owner.is_null() || handle != subject {
        real(handle, name)
    } else {
        let found = real(subject, name);
        if found.is_null() {
            real(owner, name)
        } else {
            found
        }
    };

    if was_armed {
        write_code(state.target as *mut u8, &state.stub);
        armed.set(true);
    }
    result
}

/// Hook the routine at `target` for slot `S` and point it at
/// `subject`/`owner`.
///
/// The first call patches `target`; later calls only replace the handles
/// (their `target` is ignored).
///
/// # Safety
/// `target` must be the entry of a function with the [`LookupFn`]
/// signature, at least [`STUB_LEN`] bytes long.
pub unsafe fn install<S: HookSlot>(
    target: usize,
    subject: *mut c_void,
    owner: *mut c_void,
) -> Result<&'static SymbolHookState, HookError> {
    let _install = INSTALL.lock();
    if let Some(state) = S::cell().get() {
        debug!("linkent: already armed at 0x{:x}, updating handles", state.target);
        state.set_handles(subject, owner);
        return Ok(state);
    }

    let state = SymbolHookState::prepare(target, intercept::<S> as usize)?;
    let state = S::cell().get_or_init(|| state);
    state.set_handles(subject, owner);
    state.arm();
    debug!(
        "linkent: armed 0x{:x} subject={:p} owner={:p}",
        target, subject, owner
    );
    Ok(state)
}

/// State of slot `S`, if it was ever installed.
pub fn installed<S: HookSlot>() -> Option<&'static SymbolHookState> {
    S::cell().get()
}

#[cfg(not(target_os = "linux"))]
pub fn locate_lookup() -> Result<usize, HookError> {
    Err(HookError::Unsupported)
}

/// Redirect the loader's `dlsym` for `subject` to fall back to `owner`.
#[cfg(not(target_os = "linux"))]
pub fn install_lookup_redirect(
    _subject: *mut c_void,
    _owner: *mut c_void,
) -> Result<&'static SymbolHookState, HookError> {
    Err(HookError::Unsupported)
}
