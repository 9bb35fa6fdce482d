//! Game-module loading and interface negotiation.
//!
//! The engine hands its function table to the game module through
//! `GiveFnptrsToDll`, then asks for the game's tables, newest interface
//! first. We sit in between and keep a copy of every table the game hands
//! out so dispatch can reach the real functions, and hand each side a
//! table of our hooks in place of the other side's functions.

use std::ffi::{c_int, c_void, CStr};
use std::ptr::NonNull;

use log::{debug, warn};
use metahook_api::descriptor::{self, ApiTable};
use metahook_api::ApiId;

use crate::error::{AgentError, Result};

pub const ENTITY_INTERFACE_VERSION: c_int = 140;
pub const NEW_DLL_FUNCTIONS_VERSION: c_int = 1;

pub type GiveFnptrsFn = unsafe extern "C" fn(engine_funcs: *const c_void, globals: *mut c_void);
/// `GetEntityAPI2` / `GetNewDLLFunctions`: fill `table`, negotiate through `version`.
pub type GetTableVersionedFn = unsafe extern "C" fn(table: *mut c_void, version: *mut c_int) -> c_int;
/// `GetEntityAPI`: fill `table` if `version` is what the game was built for.
pub type GetTableFn = unsafe extern "C" fn(table: *mut c_void, version: c_int) -> c_int;
/// An entity class constructor exported under the class name.
pub type EntityFn = unsafe extern "C" fn(pev: *mut c_void);

/// Anything that can resolve exported symbols of a loaded game module.
pub trait SymbolSource {
    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>>;
}

/// A copy of one native function-pointer table.
#[derive(Debug, Clone)]
pub struct FunctionTable {
    table: ApiTable,
    slots: Vec<*const c_void>,
}

impl FunctionTable {
    pub fn new(table: ApiTable) -> Self {
        Self {
            table,
            slots: vec![core::ptr::null(); descriptor::slot_count(table)],
        }
    }

    /// Copy a live native table laid out like `table`.
    ///
    /// # Safety
    /// `base` must be readable for [`descriptor::slot_count`] pointers.
    pub unsafe fn copy_from(table: ApiTable, base: *const c_void) -> Self {
        let count = descriptor::slot_count(table);
        let slots = core::slice::from_raw_parts(base as *const *const c_void, count).to_vec();
        Self { table, slots }
    }

    pub fn table(&self) -> ApiTable {
        self.table
    }

    /// The function in `id`'s slot; null if unset or `id` belongs elsewhere.
    pub fn get(&self, id: ApiId) -> *const c_void {
        if id.table != self.table {
            return core::ptr::null();
        }
        self.slots.get(id.slot as usize).copied().unwrap_or(core::ptr::null())
    }

    pub fn populated(&self) -> usize {
        self.slots.iter().filter(|p| !p.is_null()).count()
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.slots.as_ptr() as *const c_void
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        self.slots.as_mut_ptr() as *mut c_void
    }

    /// The table to hand out in place of `real`: our hook wherever `real`
    /// has a function, null where it has none. Slots without a hook (the
    /// printf-style engine calls) keep the real function.
    pub fn hooked(real: &FunctionTable) -> Self {
        let hooks = descriptor::hook_table(real.table);
        let slots = real
            .slots
            .iter()
            .zip(hooks)
            .map(|(&func, hook)| match hook {
                _ if func.is_null() => core::ptr::null(),
                Some(hook) => hook,
                None => func,
            })
            .collect();
        Self { table: real.table, slots }
    }

    /// Write every slot into a native table of the same layout.
    ///
    /// # Safety
    /// `dest` must be writable for [`descriptor::slot_count`] pointers.
    pub unsafe fn copy_to(&self, dest: *mut c_void) {
        core::ptr::copy_nonoverlapping(self.slots.as_ptr(), dest as *mut *const c_void, self.slots.len());
    }
}

// Slots hold code addresses only.
unsafe impl Send for FunctionTable {}
unsafe impl Sync for FunctionTable {}

/// Which entry point supplied the entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityInterface {
    EntityApi2,
    EntityApi,
}

#[derive(Debug, Clone)]
pub struct GameTables {
    pub interface: EntityInterface,
    pub entity: FunctionTable,
    pub new_entity: Option<FunctionTable>,
}

impl GameTables {
    /// Real game-side function for `id`, null if the game left it unset.
    pub fn real(&self, id: ApiId) -> *const c_void {
        match id.table {
            ApiTable::Entity => self.entity.get(id),
            ApiTable::NewEntity => self.new_entity.as_ref().map_or(core::ptr::null(), |t| t.get(id)),
            ApiTable::Engine => core::ptr::null(),
        }
    }
}

enum Query {
    Found(FunctionTable),
    Missing,
    /// Refused with its version untouched.
    Refused,
}

/// Call a `(table*, int* version)` entry point.
unsafe fn query_versioned(
    src: &dyn SymbolSource,
    name: &'static CStr,
    table: ApiTable,
    want: c_int,
) -> Result<Query> {
    let entry = name.to_str().unwrap_or("?");
    let Some(sym) = src.symbol(name) else {
        debug!("gamedll: no {}", entry);
        return Ok(Query::Missing);
    };
    let func: GetTableVersionedFn = core::mem::transmute(sym.as_ptr());
    let mut out = FunctionTable::new(table);
    let mut version = want;
    if func(out.as_mut_ptr(), &mut version) != 0 {
        debug!("gamedll: {} supplied {} functions", entry, out.populated());
        return Ok(Query::Found(out));
    }
    if version != want {
        return Err(AgentError::version_mismatch(entry, want, version));
    }
    warn!("gamedll: {} failed", entry);
    Ok(Query::Refused)
}

/// Hand `engine_funcs` to the game module and collect its tables.
///
/// # Safety
/// `src` must resolve symbols of a real game module (or functions with the
/// same signatures). `engine_funcs` and `globals` are passed through to it
/// and must outlive the module.
pub unsafe fn negotiate(
    src: &dyn SymbolSource,
    engine_funcs: *const c_void,
    globals: *mut c_void,
) -> Result<GameTables> {
    let give = src
        .symbol(c"GiveFnptrsToDll")
        .ok_or(AgentError::MissingEntryPoint("GiveFnptrsToDll"))?;
    let give: GiveFnptrsFn = core::mem::transmute(give.as_ptr());
    give(engine_funcs, globals);
    debug!("gamedll: called GiveFnptrsToDll");

    let new_query = query_versioned(src, c"GetNewDLLFunctions", ApiTable::NewEntity, NEW_DLL_FUNCTIONS_VERSION)?;
    let new_entity = match new_query {
        Query::Found(table) => Some(table),
        Query::Missing | Query::Refused => None,
    };

    let refused = match query_versioned(src, c"GetEntityAPI2", ApiTable::Entity, ENTITY_INTERFACE_VERSION)? {
        Query::Found(entity) => {
            return Ok(GameTables {
                interface: EntityInterface::EntityApi2,
                entity,
                new_entity,
            })
        }
        Query::Refused => true,
        Query::Missing => false,
    };

    let Some(sym) = src.symbol(c"GetEntityAPI") else {
        return Err(if refused {
            AgentError::EntryPointFailed("GetEntityAPI2")
        } else {
            AgentError::MissingEntryPoint("GetEntityAPI")
        });
    };
    let get_api: GetTableFn = core::mem::transmute(sym.as_ptr());
    let mut entity = FunctionTable::new(ApiTable::Entity);
    if get_api(entity.as_mut_ptr(), ENTITY_INTERFACE_VERSION) == 0 {
        return Err(AgentError::EntryPointFailed("GetEntityAPI"));
    }
    debug!("gamedll: GetEntityAPI supplied {} functions", entity.populated());
    Ok(GameTables {
        interface: EntityInterface::EntityApi,
        entity,
        new_entity,
    })
}

#[cfg(unix)]
pub use self::unix::{own_module_handle, DlModule};

#[cfg(unix)]
mod unix {
    use std::ffi::{c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};
    use std::ptr::NonNull;

    use log::info;

    use super::SymbolSource;
    use crate::error::{AgentError, Result};

    fn last_dl_error() -> String {
        let err = unsafe { libc::dlerror() };
        if err.is_null() {
            "unknown error".to_string()
        } else {
            unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
        }
    }

    /// A game module opened with `dlopen`. Stays loaded for the life of
    /// the process.
    #[derive(Debug)]
    pub struct DlModule {
        handle: NonNull<c_void>,
        path: PathBuf,
    }

    unsafe impl Send for DlModule {}
    unsafe impl Sync for DlModule {}

    impl DlModule {
        pub fn open(path: &Path) -> Result<Self> {
            let open_failed = |reason: String| AgentError::OpenFailed {
                path: path.to_path_buf(),
                reason,
            };
            let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|e| open_failed(e.to_string()))?;
            let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW) };
            let handle = NonNull::new(handle).ok_or_else(|| open_failed(last_dl_error()))?;
            info!("gamedll: opened {}", path.display());
            Ok(Self {
                handle,
                path: path.to_path_buf(),
            })
        }

        pub fn handle(&self) -> *mut c_void {
            self.handle.as_ptr()
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl SymbolSource for DlModule {
        fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
            NonNull::new(unsafe { libc::dlsym(self.handle.as_ptr(), name.as_ptr()) })
        }
    }

    /// Loader handle of the module this code lives in: the agent library
    /// when loaded as one, otherwise the main program.
    pub fn own_module_handle() -> Option<NonNull<c_void>> {
        unsafe {
            let mut info: libc::Dl_info = core::mem::zeroed();
            let anchor = own_module_handle as *const c_void;
            if libc::dladdr(anchor, &mut info) != 0 && !info.dli_fname.is_null() {
                let handle = libc::dlopen(info.dli_fname, libc::RTLD_NOW | libc::RTLD_NOLOAD);
                if let Some(handle) = NonNull::new(handle) {
                    return Some(handle);
                }
            }
            NonNull::new(libc::dlopen(core::ptr::null(), libc::RTLD_NOW))
        }
    }
}
