//! metahook agent - loaded into the engine process between the engine and
//! its game module.
//!
//! The agent loads the game module, keeps the tables both sides exchange,
//! and hands each side a table of hooks in place of the other's functions,
//! so every call between them is routed through the loaded plugins.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod gamedll;
pub mod registry;

use std::cell::Cell;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use metahook_api::meta::{self, MetaGlobals};
use metahook_api::{ApiId, ApiTable, ArgPack, ReturnBox};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{AgentConfig, LinkentMode};
use crate::dispatch::Dispatcher;
use crate::error::AgentError;
use crate::gamedll::{FunctionTable, GameTables, SymbolSource};
use crate::registry::{HookPhase, PluginId, PluginList};

/// Global agent state.
static AGENT: OnceLock<Agent> = OnceLock::new();

thread_local! {
    // Nesting depth of `Agent::call` on this thread.
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Whether this thread is inside an intercepted call.
pub fn in_dispatch() -> bool {
    DISPATCH_DEPTH.with(|d| d.get()) > 0
}

/// Marks the thread as dispatching for its lifetime. Nesting-safe.
struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Self {
        DISPATCH_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }

    fn outermost(&self) -> bool {
        DISPATCH_DEPTH.with(|d| d.get()) == 1
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// How a registry change was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Applied,
    /// Queued until the thread's outermost intercepted call returns.
    Deferred,
}

type PluginOp = Box<dyn FnOnce(&mut PluginList) + Send>;

/// The engine's real table and the hook table the game module gets instead.
struct EngineTables {
    real: FunctionTable,
    hooks: FunctionTable,
}

struct LoadedGame {
    source: Box<dyn SymbolSource + Send + Sync>,
    tables: GameTables,
    entity_hooks: FunctionTable,
    new_entity_hooks: Option<FunctionTable>,
}

pub struct Agent {
    config: AgentConfig,
    plugins: RwLock<PluginList>,
    pending: Mutex<Vec<PluginOp>>,
    engine: OnceLock<EngineTables>,
    game: OnceLock<LoadedGame>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            plugins: RwLock::new(PluginList::new()),
            pending: Mutex::new(Vec::new()),
            engine: OnceLock::new(),
            game: OnceLock::new(),
        }
    }

    pub fn get() -> Option<&'static Agent> {
        AGENT.get()
    }

    /// The global agent, configured from the environment on first use.
    pub fn obtain() -> &'static Agent {
        AGENT.get_or_init(|| Agent::new(AgentConfig::from_env()))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Shared view of the plugin list. Recursive, so a handler that calls a
    /// hooked API from inside dispatch cannot deadlock against a queued
    /// writer.
    pub fn plugins(&self) -> RwLockReadGuard<'_, PluginList> {
        self.plugins.read_recursive()
    }

    /// Exclusive access for loading, pausing and unloading plugins. `None`
    /// inside an intercepted call, where the list is being read; use
    /// [`Agent::modify`] there.
    pub fn plugins_mut(&self) -> Option<RwLockWriteGuard<'_, PluginList>> {
        if in_dispatch() {
            return None;
        }
        let mut plugins = self.plugins.write();
        self.drain_pending(&mut plugins);
        Some(plugins)
    }

    /// Apply `op` to the plugin list now, or once the thread's outermost
    /// intercepted call has returned if it is inside one.
    pub fn modify(&self, op: impl FnOnce(&mut PluginList) + Send + 'static) -> Change {
        if in_dispatch() {
            self.pending.lock().push(Box::new(op));
            return Change::Deferred;
        }
        let mut plugins = self.plugins.write();
        self.drain_pending(&mut plugins);
        op(&mut *plugins);
        Change::Applied
    }

    fn drain_pending(&self, plugins: &mut PluginList) {
        let ops = std::mem::take(&mut *self.pending.lock());
        if !ops.is_empty() {
            debug!("registry: applying {} deferred changes", ops.len());
        }
        for op in ops {
            op(&mut *plugins);
        }
    }

    fn apply_pending(&self) {
        if self.pending.lock().is_empty() {
            return;
        }
        let mut plugins = self.plugins.write();
        self.drain_pending(&mut plugins);
    }

    pub fn game_tables(&self) -> Option<&GameTables> {
        self.game.get().map(|g| &g.tables)
    }

    /// The table handed out in place of `table`'s real functions, once
    /// there is one.
    pub fn hook_table(&self, table: ApiTable) -> Option<&FunctionTable> {
        match table {
            ApiTable::Engine => self.engine.get().map(|e| &e.hooks),
            ApiTable::Entity => self.game.get().map(|g| &g.entity_hooks),
            ApiTable::NewEntity => self.game.get().and_then(|g| g.new_entity_hooks.as_ref()),
        }
    }

    /// Open the game module at `path` and negotiate its tables.
    ///
    /// # Safety
    /// `engine_funcs` must point to a complete engine function table that
    /// stays valid for the life of the process.
    #[cfg(unix)]
    pub unsafe fn load_game(
        &self,
        path: &Path,
        engine_funcs: *const c_void,
        globals: *mut c_void,
    ) -> Result<&GameTables, AgentError> {
        let module = gamedll::DlModule::open(path)?;
        let owner = module.handle();
        self.load_from(Box::new(module), owner, engine_funcs, globals)
    }

    #[cfg(not(unix))]
    pub unsafe fn load_game(
        &self,
        path: &Path,
        _engine_funcs: *const c_void,
        _globals: *mut c_void,
    ) -> Result<&GameTables, AgentError> {
        Err(AgentError::OpenFailed {
            path: path.to_path_buf(),
            reason: "dynamic loading is not supported on this platform".to_string(),
        })
    }

    /// Negotiate with an already-open game module whose loader handle is
    /// `owner`, then redirect symbol lookups in this module to it.
    ///
    /// The game module receives the engine hook table, not `engine_funcs`.
    /// The engine tables are kept from the first attempt even if that
    /// attempt fails.
    ///
    /// # Safety
    /// Same as [`Agent::load_game`]; `src` must resolve the game module's
    /// real entry points.
    pub unsafe fn load_from(
        &self,
        src: Box<dyn SymbolSource + Send + Sync>,
        owner: *mut c_void,
        engine_funcs: *const c_void,
        globals: *mut c_void,
    ) -> Result<&GameTables, AgentError> {
        if let Some(loaded) = self.game.get() {
            warn!("game module already loaded, keeping the first one");
            return Ok(&loaded.tables);
        }
        metahook_api::hook::set_router(route);

        // The game may call the engine from inside its entry points.
        let engine = match self.engine.get() {
            Some(engine) => engine,
            None => {
                let real = FunctionTable::copy_from(ApiTable::Engine, engine_funcs);
                let hooks = FunctionTable::hooked(&real);
                self.engine.get_or_init(|| EngineTables { real, hooks })
            }
        };
        let tables = gamedll::negotiate(&*src, engine.hooks.as_ptr(), globals)?;
        self.redirect_lookups(owner)?;

        info!(
            "game module loaded: {:?}, {} entity functions, new API {}",
            tables.interface,
            tables.entity.populated(),
            if tables.new_entity.is_some() { "present" } else { "absent" }
        );
        let entity_hooks = FunctionTable::hooked(&tables.entity);
        let new_entity_hooks = tables.new_entity.as_ref().map(FunctionTable::hooked);
        let loaded = self.game.get_or_init(|| LoadedGame {
            source: src,
            tables,
            entity_hooks,
            new_entity_hooks,
        });
        Ok(&loaded.tables)
    }

    fn redirect_lookups(&self, owner: *mut c_void) -> Result<(), AgentError> {
        let mode = self.config.linkent;
        if mode == LinkentMode::Off {
            debug!("linkent: disabled");
            return Ok(());
        }
        let subject = own_module_handle();
        match metahook_intercept::install_lookup_redirect(subject, owner) {
            Ok(_) => {
                info!("linkent: lookups in {:p} fall back to {:p}", subject, owner);
                Ok(())
            }
            Err(e) if mode == LinkentMode::Optional => {
                warn!("linkent: redirect unavailable ({:?}), continuing without it", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Real implementation behind `id`; null until its side is known.
    pub fn real_function(&self, id: ApiId) -> *const c_void {
        match id.table {
            ApiTable::Engine => self.engine.get().map_or(core::ptr::null(), |e| e.real.get(id)),
            _ => self.game.get().map_or(core::ptr::null(), |g| g.tables.real(id)),
        }
    }

    /// Run the game module's constructor for entity class `name` on `pev`.
    /// Returns `false` if no game module is loaded or it has no such class.
    ///
    /// # Safety
    /// `pev` must be whatever the game's constructors expect.
    pub unsafe fn call_game_entity(&self, name: &CStr, pev: *mut c_void) -> bool {
        let Some(game) = self.game.get() else {
            return false;
        };
        let Some(sym) = game.source.symbol(name) else {
            warn!("game module has no entity class {}", name.to_string_lossy());
            return false;
        };
        let ctor: gamedll::EntityFn = core::mem::transmute(sym.as_ptr());
        ctor(pev);
        true
    }

    /// Route one intercepted call through the plugins to the real function.
    /// Registry changes requested by handlers are applied once the
    /// outermost call on this thread returns.
    ///
    /// # Safety
    /// See [`Dispatcher::dispatch`].
    pub unsafe fn call(&self, id: ApiId, args: &ArgPack) -> Result<ReturnBox, AgentError> {
        let real = self.real_function(id);
        let guard = DispatchGuard::enter();
        let result = {
            let plugins = self.plugins();
            Dispatcher::obtain().dispatch(&*plugins, id, real, args)
        };
        if guard.outermost() {
            drop(guard);
            self.apply_pending();
        }
        Ok(result?)
    }
}

/// Router behind every native hook.
unsafe fn route(id: ApiId, args: &ArgPack) -> Option<ReturnBox> {
    let agent = Agent::get()?;
    match agent.call(id, args) {
        Ok(ret) => Some(ret),
        Err(e) => {
            error!("{}: {}", id, e);
            None
        }
    }
}

#[cfg(unix)]
fn own_module_handle() -> *mut c_void {
    gamedll::own_module_handle().map_or(core::ptr::null_mut(), |h| h.as_ptr())
}

#[cfg(not(unix))]
fn own_module_handle() -> *mut c_void {
    core::ptr::null_mut()
}

fn init_logging(config: &AgentConfig) {
    let mut builder = env_logger::Builder::from_default_env();
    if config.hook_debug {
        builder.filter_module("metahook_intercept", log::LevelFilter::Debug);
    }
    let _ = builder.try_init();
}

fn init(config: AgentConfig) -> Result<()> {
    // Built up front so the first intercepted call doesn't pay for it.
    let callers = metahook_api::CallerTable::obtain();
    debug!("{} invokers ready", callers.len());

    let linkent = config.linkent;
    AGENT.set(Agent::new(config)).map_err(|_| anyhow!("agent already initialized"))?;
    info!("agent initialized, linkent {:?}", linkent);
    Ok(())
}

fn table_from(index: c_int) -> Option<ApiTable> {
    u8::try_from(index).ok().and_then(ApiTable::from_index)
}

/// Agent entry point, run by the loader constructor or by the host.
#[unsafe(no_mangle)]
pub extern "C" fn metahook_agent_init() -> i32 {
    let config = AgentConfig::from_env();
    init_logging(&config);

    match init(config) {
        Ok(()) => 0,
        Err(e) => {
            error!("agent init failed: {:#}", e);
            -1
        }
    }
}

/// Load the configured game module. Returns 0 or an [`metahook_api::ErrorCode`].
///
/// # Safety
/// `engine_funcs` must point to the engine's complete function table.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn metahook_load_game(engine_funcs: *const c_void, globals: *mut c_void) -> c_int {
    let agent = Agent::obtain();
    let Some(path) = agent.config().gamedll.clone() else {
        error!("no game module configured");
        return metahook_api::ErrorCode::OpenFailed as c_int;
    };
    match agent.load_game(&path, engine_funcs, globals) {
        Ok(_) => 0,
        Err(e) => {
            error!("{}", e);
            e.code() as c_int
        }
    }
}

/// Engine entry point: the engine hands over its function table, and the
/// configured game module is loaded behind our hooks.
///
/// # Safety
/// Called by the engine with its own table and globals.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn GiveFnptrsToDll(engine_funcs: *const c_void, globals: *mut c_void) {
    init_logging(Agent::obtain().config());
    if metahook_load_game(engine_funcs, globals) != 0 {
        error!("GiveFnptrsToDll: game module not loaded, game calls will fail");
    }
}

unsafe fn hand_out(table: ApiTable, dest: *mut c_void) -> c_int {
    match Agent::get().and_then(|agent| agent.hook_table(table)) {
        Some(hooks) => {
            hooks.copy_to(dest);
            1
        }
        None => {
            warn!("{:?} table requested but the game module has none", table);
            0
        }
    }
}

/// Fill the engine's entity table with our hooks.
///
/// # Safety
/// `table` must be writable for a whole entity table; `version` must be
/// valid.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn GetEntityAPI2(table: *mut c_void, version: *mut c_int) -> c_int {
    if table.is_null() || version.is_null() {
        return 0;
    }
    if *version != gamedll::ENTITY_INTERFACE_VERSION {
        error!(
            "GetEntityAPI2: engine wants version {}, we have {}",
            *version,
            gamedll::ENTITY_INTERFACE_VERSION
        );
        *version = gamedll::ENTITY_INTERFACE_VERSION;
        return 0;
    }
    hand_out(ApiTable::Entity, table)
}

/// # Safety
/// `table` must be writable for a whole entity table.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn GetEntityAPI(table: *mut c_void, version: c_int) -> c_int {
    if table.is_null() || version != gamedll::ENTITY_INTERFACE_VERSION {
        return 0;
    }
    hand_out(ApiTable::Entity, table)
}

/// Fill the engine's new-entity table with our hooks; 0 if the game module
/// has no such table.
///
/// # Safety
/// `table` must be writable for a whole new-entity table; `version` must
/// be valid.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn GetNewDLLFunctions(table: *mut c_void, version: *mut c_int) -> c_int {
    if table.is_null() || version.is_null() {
        return 0;
    }
    if *version != gamedll::NEW_DLL_FUNCTIONS_VERSION {
        *version = gamedll::NEW_DLL_FUNCTIONS_VERSION;
        return 0;
    }
    hand_out(ApiTable::NewEntity, table)
}

/// Append a plugin to the load order. Returns its id, or -1. Plugins cannot
/// be registered from inside an intercepted call.
///
/// # Safety
/// `name` must be a valid C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn metahook_register_plugin(name: *const c_char) -> c_int {
    if name.is_null() {
        return -1;
    }
    let name = CStr::from_ptr(name).to_string_lossy();
    let Some(mut plugins) = Agent::obtain().plugins_mut() else {
        warn!("plugin {} cannot register during a call", name);
        return -1;
    };
    let PluginId(id) = plugins.register(&name);
    id as c_int
}

fn plugin_known(agent: &Agent, plugin: PluginId) -> bool {
    agent.plugins().name(plugin).is_some()
}

/// Register a plugin's native function table. `table` is 0 engine, 1 entity,
/// 2 new entity; nonzero `post` attaches post handlers. Returns the number of
/// handlers attached, or -1.
///
/// # Safety
/// `base` must point to a complete native table of that kind.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn metahook_attach_table(
    plugin: u32,
    table: c_int,
    post: c_int,
    base: *const c_void,
) -> c_int {
    let Some(table) = table_from(table) else {
        return -1;
    };
    let agent = Agent::obtain();
    let plugin = PluginId(plugin);
    if base.is_null() || !plugin_known(agent, plugin) {
        return -1;
    }
    let phase = if post != 0 { HookPhase::Post } else { HookPhase::Pre };
    // Copied now, so the caller's table need not outlive a deferred change.
    let handlers = FunctionTable::copy_from(table, base);
    let count = handlers.populated();
    agent.modify(move |plugins| {
        plugins.attach_table(plugin, table, phase, handlers.as_ptr());
    });
    count as c_int
}

/// Pause (nonzero) or resume a plugin. Returns 0, or -1 for an unknown plugin.
#[unsafe(no_mangle)]
pub extern "C" fn metahook_set_paused(plugin: u32, paused: c_int) -> c_int {
    let agent = Agent::obtain();
    let plugin = PluginId(plugin);
    if !plugin_known(agent, plugin) {
        return -1;
    }
    agent.modify(move |plugins| {
        if paused != 0 {
            plugins.pause(plugin);
        } else {
            plugins.unpause(plugin);
        }
    });
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn metahook_unload_plugin(plugin: u32) -> c_int {
    let agent = Agent::obtain();
    let plugin = PluginId(plugin);
    if !plugin_known(agent, plugin) {
        return -1;
    }
    agent.modify(move |plugins| {
        plugins.unload(plugin);
    });
    0
}

/// Real function behind `(table, slot)`, for plugins calling past the
/// hooks. Null if unknown or unset.
#[unsafe(no_mangle)]
pub extern "C" fn metahook_real_function(table: c_int, slot: c_int) -> *const c_void {
    let (Some(table), Ok(slot)) = (table_from(table), u16::try_from(slot)) else {
        return core::ptr::null();
    };
    Agent::get().map_or(core::ptr::null(), |agent| agent.real_function(ApiId::new(table, slot)))
}

/// Construct an entity of class `name` through the game module's own
/// constructor. Returns 1 if the class exists, 0 otherwise.
///
/// # Safety
/// `name` must be a valid C string; `pev` is passed to the game module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn metahook_call_game_entity(name: *const c_char, pev: *mut c_void) -> c_int {
    if name.is_null() {
        return 0;
    }
    let name = CStr::from_ptr(name);
    match Agent::get() {
        Some(agent) if agent.call_game_entity(name, pev) => 1,
        _ => 0,
    }
}

/// This thread's result block, for plugins reporting their decisions.
#[unsafe(no_mangle)]
pub extern "C" fn metahook_meta_globals() -> *mut MetaGlobals {
    meta::meta_globals()
}

/// Constructor attribute for automatic initialization on library load (Linux).
///
/// Only fires when a game module is configured, so tools that merely dlopen
/// the agent are left alone.
#[cfg(all(target_os = "linux", not(test)))]
#[unsafe(link_section = ".init_array")]
#[used]
static INIT: extern "C" fn() = {
    extern "C" fn init() {
        if std::env::var_os(config::GAMEDLL_VAR).is_some() {
            metahook_agent_init();
        }
    }
    init
};

/// Process-global lock for tests that call into the loader's `dlsym`, which
/// a redirect test may be patching.
#[cfg(test)]
pub(crate) fn lock_loader_tests() -> parking_lot::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock()
}
