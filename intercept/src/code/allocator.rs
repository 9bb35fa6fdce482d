use crate::types::HookError;

/// A writable mapping that becomes code once [`CodeAllocator::make_executable`]
/// is called on it.
#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub pc: *const u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

#[derive(Debug)]
pub struct CodeAllocator {
    slab_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self { slab_size: 4096 }
    }
}

impl CodeAllocator {
    pub fn new(slab_size: usize) -> Self {
        Self { slab_size: slab_size.max(4096) }
    }

    pub fn alloc_any(&mut self) -> Result<CodeSlice, HookError> {
        #[cfg(unix)]
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                self.slab_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(HookError::AllocationFailed);
            }
            Ok(CodeSlice {
                data: ptr as *mut u8,
                pc: ptr as *const u8,
                size: self.slab_size,
            })
        }

        #[cfg(not(unix))]
        {
            Err(HookError::Unsupported)
        }
    }

    /// Flip `slice` to RX.
    ///
    /// # Safety
    /// `slice` must come from this allocator and still be mapped.
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<(), HookError> {
        #[cfg(unix)]
        {
            if libc::mprotect(
                slice.data as *mut libc::c_void,
                slice.size,
                libc::PROT_READ | libc::PROT_EXEC,
            ) != 0
            {
                return Err(HookError::ProtectFailed);
            }
            crate::code::cache::invalidate_icache(slice.data, slice.size);
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = slice;
            Err(HookError::Unsupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_any_returns_executable_page() {
        let mut alloc = CodeAllocator::default();
        let slice = alloc.alloc_any().expect("alloc");
        assert_eq!(slice.size, 4096);
        unsafe {
            #[cfg(target_arch = "aarch64")]
            {
                // ret
                (slice.data as *mut u32).write(0xD65F03C0);
            }
            #[cfg(not(target_arch = "aarch64"))]
            {
                slice.data.write(0xC3); // ret
            }
            alloc.make_executable(&slice).expect("protect");
            let f: extern "C" fn() = core::mem::transmute(slice.pc);
            f();
        }
    }

    #[test]
    fn slab_size_has_a_page_floor() {
        let slice = CodeAllocator::new(16).alloc_any().expect("alloc");
        assert_eq!(slice.size, 4096);
    }
}
