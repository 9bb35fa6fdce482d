//! Writing over live code.
//!
//! The loader-lookup trampoline flips its target between original and stub
//! bytes on every call, so pages are made writable once and left RWX for the
//! rest of the process instead of toggling protection per write.

use log::debug;

use crate::code::cache::invalidate_icache;
use crate::types::HookError;

#[inline]
fn debug_enabled() -> bool {
    std::env::var_os("METAHOOK_HOOK_DEBUG").is_some()
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Page-aligned `(start, len)` covering `[addr, addr + size)`, which may
/// straddle a page border.
pub fn page_span(addr: usize, size: usize) -> (usize, usize) {
    let page_sz = page_size();
    let page_start = addr & !(page_sz - 1);
    let page_end = (addr + size + page_sz - 1) & !(page_sz - 1);
    (page_start, page_end - page_start)
}

/// Permanently mark the pages holding `[addr, addr + size)` RWX.
///
/// # Safety
/// `addr` must point into mapped memory. Other code on the same pages stays
/// executable.
pub unsafe fn make_writable(addr: *const u8, size: usize) -> Result<(), HookError> {
    if size == 0 {
        return Ok(());
    }
    let (page_start, map_size) = page_span(addr as usize, size);

    #[cfg(unix)]
    {
        if libc::mprotect(
            page_start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) != 0
        {
            if debug_enabled() {
                debug!(
                    "patcher: mprotect RWX failed page_start=0x{:x} map_size=0x{:x} errno={}",
                    page_start,
                    map_size,
                    std::io::Error::last_os_error()
                );
            }
            return Err(HookError::ProtectFailed);
        }
        if debug_enabled() {
            debug!("patcher: RWX page_start=0x{:x} map_size=0x{:x}", page_start, map_size);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = (page_start, map_size);
        Err(HookError::Unsupported)
    }
}

/// Copy `bytes` over code at `addr` and flush the instruction cache.
///
/// # Safety
/// The range must already be writable (see [`make_writable`]) and no thread
/// may be executing inside it.
pub unsafe fn write_code(addr: *mut u8, bytes: &[u8]) {
    core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr, bytes.len());
    invalidate_icache(addr, bytes.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::allocator::CodeAllocator;

    #[test]
    fn page_span_covers_a_straddling_range() {
        let page = page_size();
        let (start, len) = page_span(page * 3 - 4, 16);
        assert_eq!(start, page * 2);
        assert_eq!(len, page * 2);

        let (start, len) = page_span(page * 3 + 8, 16);
        assert_eq!(start, page * 3);
        assert_eq!(len, page);
    }

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
    fn rewritten_code_executes() {
        let mut alloc = CodeAllocator::default();
        let slice = alloc.alloc_any().expect("alloc");

        unsafe {
            // mov eax, 1; ret
            write_code(slice.data, &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
            alloc.make_executable(&slice).expect("rx");
            let f: extern "C" fn() -> i32 = core::mem::transmute(slice.pc);
            assert_eq!(f(), 1);

            make_writable(slice.data, 6).expect("rwx");
            // mov eax, 2; ret
            write_code(slice.data, &[0xB8, 0x02, 0x00, 0x00, 0x00, 0xC3]);
            assert_eq!(f(), 2);
        }
    }

    #[test]
    #[cfg(target_arch = "aarch64")]
    fn rewritten_code_executes() {
        let mut alloc = CodeAllocator::default();
        let slice = alloc.alloc_any().expect("alloc");

        unsafe {
            // mov w0, #1; ret
            write_code(slice.data, &[0x20, 0x00, 0x80, 0x52, 0xC0, 0x03, 0x5F, 0xD6]);
            alloc.make_executable(&slice).expect("rx");
            let f: extern "C" fn() -> i32 = core::mem::transmute(slice.pc);
            assert_eq!(f(), 1);

            make_writable(slice.data, 8).expect("rwx");
            // mov w0, #2; ret
            write_code(slice.data, &[0x40, 0x00, 0x80, 0x52, 0xC0, 0x03, 0x5F, 0xD6]);
            assert_eq!(f(), 2);
        }
    }

    #[test]
    fn make_writable_rejects_unmapped_memory() {
        // Below mmap_min_addr, never mapped.
        let addr = page_size() as *const u8;
        assert_eq!(unsafe { make_writable(addr, 4) }, Err(HookError::ProtectFailed));
    }
}
