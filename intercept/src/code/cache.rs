/// Make freshly written instructions visible to instruction fetch.
///
/// AArch64 keeps separate, non-coherent data and instruction caches, so a
/// rewritten stub must be cleaned out of the D-cache and dropped from the
/// I-cache. x86 is coherent and needs nothing.
///
/// # Safety
/// `addr` must point to at least `size` bytes of memory.
#[inline]
pub unsafe fn invalidate_icache(addr: *mut u8, size: usize) {
    #[cfg(target_arch = "aarch64")]
    {
        extern "C" {
            fn __clear_cache(beg: *mut libc::c_void, end: *mut libc::c_void);
        }
        __clear_cache(addr as *mut libc::c_void, addr.add(size) as *mut libc::c_void);
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (addr, size);
    }
}
