use core::ffi::c_void;
use std::sync::OnceLock;

use log::debug;

use super::{install, HookSlot, SymbolHookState};
use crate::module;
use crate::stub::follow_indirect_jumps;
use crate::types::HookError;

/// Slot for the process's real `dlsym`.
pub struct DlsymSlot;

impl HookSlot for DlsymSlot {
    fn cell() -> &'static OnceLock<SymbolHookState> {
        static CELL: OnceLock<SymbolHookState> = OnceLock::new();
        &CELL
    }
}

/// Entry address of the loader's real `dlsym`.
///
/// Read from the dynamic symbol table of whichever loaded object defines
/// it (libc on current glibc, libdl before 2.34), then followed through
/// any `jmp [slot]` forwarders.
pub fn locate_lookup() -> Result<usize, HookError> {
    let addr = module::find_defining_export("dlsym").map_err(|_| HookError::LookupNotFound)?;
    let entry = unsafe { follow_indirect_jumps(addr) };
    debug!(
        "linkent: dlsym at 0x{:x} in {}",
        entry,
        module::resolve_address_module(entry).unwrap_or_default()
    );
    Ok(entry)
}

/// Redirect the loader's `dlsym` so lookups scoped to `subject` fall back to
/// `owner`.
pub fn install_lookup_redirect(
    subject: *mut c_void,
    owner: *mut c_void,
) -> Result<&'static SymbolHookState, HookError> {
    if let Some(state) = super::installed::<DlsymSlot>() {
        state.set_handles(subject, owner);
        return Ok(state);
    }
    let target = locate_lookup()?;
    unsafe { install::<DlsymSlot>(target, subject, owner) }
}
