#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(not(target_os = "linux"))]
use crate::types::{HookError, ModuleInfo};

#[cfg(not(target_os = "linux"))]
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    Vec::new()
}

#[cfg(not(target_os = "linux"))]
pub fn find_defining_export(_symbol: &str) -> Result<usize, HookError> {
    Err(HookError::Unsupported)
}

#[cfg(not(target_os = "linux"))]
pub fn find_global_export_by_name(_symbol: &str) -> Result<usize, HookError> {
    Err(HookError::Unsupported)
}

#[cfg(not(target_os = "linux"))]
pub fn resolve_address_module(_address: usize) -> Option<String> {
    None
}
