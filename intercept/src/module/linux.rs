use crate::types::{HookError, ModuleInfo};
use core::ffi::{c_char, c_void};
use core::ops::ControlFlow;
use std::ffi::CStr;

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Run `f` for each loaded object in load order until it breaks.
fn for_each_module<F>(mut f: F)
where
    F: FnMut(&libc::dl_phdr_info) -> ControlFlow<()>,
{
    unsafe extern "C" fn callback<F>(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int
    where
        F: FnMut(&libc::dl_phdr_info) -> ControlFlow<()>,
    {
        let f = &mut *(data as *mut F);
        match f(&*info) {
            ControlFlow::Continue(()) => 0,
            ControlFlow::Break(()) => 1,
        }
    }

    unsafe {
        libc::dl_iterate_phdr(Some(callback::<F>), &mut f as *mut F as *mut c_void);
    }
}

unsafe fn module_path(info: &libc::dl_phdr_info) -> String {
    if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
        // Empty name means the main executable.
        match std::fs::read_link("/proc/self/exe") {
            Ok(p) => p.to_string_lossy().into_owned(),
            Err(_) => String::new(),
        }
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    }
}

fn module_name(path: &str) -> String {
    if path.is_empty() {
        String::from("[unknown]")
    } else {
        basename(path).to_string()
    }
}

/// Enumerate all loaded shared objects via `dl_iterate_phdr`.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    let mut modules = Vec::new();
    for_each_module(|info| {
        let path = unsafe { module_path(info) };

        // Module extent from PT_LOAD segments.
        let mut min_addr: Option<usize> = None;
        let mut max_addr: usize = 0;
        let phdrs = unsafe { core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) };
        for phdr in phdrs {
            if phdr.p_type == libc::PT_LOAD && phdr.p_memsz > 0 {
                let start = phdr.p_vaddr as usize;
                let end = start + phdr.p_memsz as usize;
                min_addr = Some(min_addr.map_or(start, |m| m.min(start)));
                max_addr = max_addr.max(end);
            }
        }

        modules.push(ModuleInfo {
            name: module_name(&path),
            path,
            base_address: info.dlpi_addr as usize + min_addr.unwrap_or(0),
            size: min_addr.map_or(0, |min| max_addr - min),
        });
        ControlFlow::Continue(())
    });
    modules
}

// ELF structures for walking dynamic symbol tables in memory.
mod elf {
    pub const DT_NULL: isize = 0;
    pub const DT_HASH: isize = 4;
    pub const DT_STRTAB: isize = 5;
    pub const DT_SYMTAB: isize = 6;
    pub const DT_GNU_HASH: isize = 0x6ffffef5;
    pub const DT_VERSYM: isize = 0x6ffffff0;

    pub const STB_GLOBAL: u8 = 1;
    pub const STB_WEAK: u8 = 2;
    pub const SHN_UNDEF: u16 = 0;

    /// Set in a `.gnu.version` entry for non-default symbol versions.
    pub const VERSYM_HIDDEN: u16 = 0x8000;

    #[cfg(target_pointer_width = "64")]
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }

    #[cfg(target_pointer_width = "32")]
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Sym {
        pub st_name: u32,
        pub st_value: u32,
        pub st_size: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
    }

    impl Sym {
        pub fn st_bind(&self) -> u8 {
            self.st_info >> 4
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Dyn {
        pub d_tag: isize,
        pub d_val: usize, // d_un union, d_val / d_ptr
    }

    #[repr(C)]
    pub struct ElfHash {
        pub nbucket: u32,
        pub nchain: u32,
        // followed by: bucket[nbucket], chain[nchain]
    }
}

/// Resolved dynamic tables of one loaded object.
struct DynamicTables {
    base: usize,
    symtab: *const elf::Sym,
    strtab: *const u8,
    versym: *const u16,
    nsyms: usize,
}

impl DynamicTables {
    unsafe fn from_module(info: &libc::dl_phdr_info) -> Option<Self> {
        let base = info.dlpi_addr as usize;
        let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let dynamic = phdrs
            .iter()
            .find(|phdr| phdr.p_type == libc::PT_DYNAMIC)
            .map(|phdr| (base + phdr.p_vaddr as usize) as *const elf::Dyn)?;

        let (mut symtab, mut strtab, mut hash, mut gnu_hash, mut versym) = (0, 0, 0, 0, 0);
        let mut entry = dynamic;
        while (*entry).d_tag != elf::DT_NULL {
            match (*entry).d_tag {
                elf::DT_SYMTAB => symtab = (*entry).d_val,
                elf::DT_STRTAB => strtab = (*entry).d_val,
                elf::DT_HASH => hash = (*entry).d_val,
                elf::DT_GNU_HASH => gnu_hash = (*entry).d_val,
                elf::DT_VERSYM => versym = (*entry).d_val,
                _ => {}
            }
            entry = entry.add(1);
        }
        if symtab == 0 || strtab == 0 {
            return None;
        }

        // ld.so relocates these in place for objects it loaded; the vDSO keeps
        // file-relative values.
        let adjusted = symtab > base || strtab > base;
        let resolve = |val: usize| if val == 0 || adjusted { val } else { base + val };

        let nsyms = if hash != 0 {
            (*(resolve(hash) as *const elf::ElfHash)).nchain as usize
        } else if gnu_hash != 0 {
            gnu_hash_nsyms(resolve(gnu_hash) as *const u8)
        } else {
            return None;
        };

        Some(Self {
            base,
            symtab: resolve(symtab) as *const elf::Sym,
            strtab: resolve(strtab) as *const u8,
            versym: resolve(versym) as *const u16,
            nsyms,
        })
    }

    /// Visit defined global/weak symbols as `(name, address, default_version)`.
    unsafe fn for_each_export(&self, mut f: impl FnMut(&CStr, usize, bool) -> ControlFlow<()>) {
        for i in 0..self.nsyms {
            let sym = &*self.symtab.add(i);
            if sym.st_shndx == elf::SHN_UNDEF || sym.st_value == 0 || sym.st_name == 0 {
                continue;
            }
            let bind = sym.st_bind();
            if bind != elf::STB_GLOBAL && bind != elf::STB_WEAK {
                continue;
            }
            let default_version = self.versym.is_null() || *self.versym.add(i) & elf::VERSYM_HIDDEN == 0;
            let name = CStr::from_ptr(self.strtab.add(sym.st_name as usize) as *const c_char);
            if f(name, self.base + sym.st_value as usize, default_version).is_break() {
                return;
            }
        }
    }
}

/// Number of symbols covered by a GNU hash table.
///
/// GNU hash tables don't store nchain; walk the chain of the highest bucket
/// to its terminator.
unsafe fn gnu_hash_nsyms(gnu_hash: *const u8) -> usize {
    // Layout: nbuckets, symoffset, bloom_size, bloom_shift (u32 each),
    // bloom[bloom_size] (word sized), buckets[nbuckets], chains[].
    let words = gnu_hash as *const u32;
    let nbuckets = *words;
    let symoffset = *words.add(1);
    let bloom_size = *words.add(2);

    let bloom = words.add(4) as *const usize;
    let buckets = bloom.add(bloom_size as usize) as *const u32;
    let chains = buckets.add(nbuckets as usize);

    let max_sym = (0..nbuckets).map(|i| *buckets.add(i as usize)).max().unwrap_or(0);
    if max_sym < symoffset {
        return symoffset as usize;
    }

    let mut idx = max_sym;
    while *chains.add((idx - symoffset) as usize) & 1 == 0 {
        idx += 1;
    }
    (idx + 1) as usize
}

/// Address of `symbol` in the first loaded object (load order) that defines
/// its default version, read straight from the dynamic symbol tables.
///
/// Unlike `dlsym(RTLD_DEFAULT, ..)` this never returns a PLT slot or an
/// interposed wrapper from the main executable's lookup scope.
pub fn find_defining_export(symbol: &str) -> Result<usize, HookError> {
    let mut found = None;
    for_each_module(|info| {
        if let Some(tables) = unsafe { DynamicTables::from_module(info) } {
            unsafe {
                tables.for_each_export(|name, address, default_version| {
                    if default_version && name.to_bytes() == symbol.as_bytes() {
                        found = Some(address);
                        return ControlFlow::Break(());
                    }
                    ControlFlow::Continue(())
                });
            }
        }
        if found.is_some() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    found.ok_or(HookError::NotFound)
}

/// Resolve a symbol globally using `dlsym(RTLD_DEFAULT, ...)`.
pub fn find_global_export_by_name(symbol: &str) -> Result<usize, HookError> {
    let cstr = std::ffi::CString::new(symbol).map_err(|_| HookError::NotFound)?;
    let p = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cstr.as_ptr()) };
    if p.is_null() {
        Err(HookError::NotFound)
    } else {
        Ok(p as usize)
    }
}

/// Resolve which module an address belongs to via `dladdr`.
pub fn resolve_address_module(address: usize) -> Option<String> {
    unsafe {
        let mut info: libc::Dl_info = core::mem::zeroed();
        if libc::dladdr(address as *const c_void, &mut info) == 0 || info.dli_fname.is_null() {
            return None;
        }
        let path = CStr::from_ptr(info.dli_fname).to_string_lossy();
        Some(basename(&path).to_string())
    }
}
