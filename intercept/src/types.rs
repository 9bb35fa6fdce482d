#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// The loader's real lookup routine could not be located.
    LookupNotFound,
    /// A page-protection change was refused.
    ProtectFailed,
    AllocationFailed,
    /// Named module or symbol is not loaded.
    NotFound,
    /// No backend for this OS/architecture.
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base_address: usize,
    pub size: usize,
}
