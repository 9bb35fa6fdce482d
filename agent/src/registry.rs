//! Loaded plugins and the handlers they registered.
//!
//! Dispatch only ever reads the registry through [`PluginRegistry::chain`];
//! [`PluginList`] is the in-process implementation, mutated between calls.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use log::debug;
use metahook_api::descriptor::{self, ApiTable};
use metahook_api::{ApiError, ApiId};

/// Load-order identity of a plugin. Lower ids were loaded earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PluginId(pub u32);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin#{}", self.0)
    }
}

/// Whether a handler runs before or after the real function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Pre,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    Running,
    Paused,
}

/// One plugin's slot in a call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallChainEntry {
    pub plugin: PluginId,
    /// Native handler with the API's exact signature, if the plugin has one.
    pub handler: Option<NonNull<c_void>>,
}

pub trait PluginRegistry {
    /// Active plugins in load order, with their handler for `id` in `phase`.
    fn chain(&self, id: ApiId, phase: HookPhase) -> Vec<CallChainEntry>;
}

struct Plugin {
    id: PluginId,
    name: String,
    status: PluginStatus,
    handlers: HashMap<(ApiId, HookPhase), NonNull<c_void>>,
}

impl Plugin {
    fn handler(&self, id: ApiId, phase: HookPhase) -> Option<NonNull<c_void>> {
        self.handlers.get(&(id, phase)).copied()
    }
}

#[derive(Default)]
pub struct PluginList {
    plugins: Vec<Plugin>,
    next_id: u32,
}

impl PluginList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin to the end of the load order.
    pub fn register(&mut self, name: &str) -> PluginId {
        let id = PluginId(self.next_id);
        self.next_id += 1;
        debug!("registry: {} registered as {}", name, id);
        self.plugins.push(Plugin {
            id,
            name: name.to_string(),
            status: PluginStatus::Running,
            handlers: HashMap::new(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn name(&self, plugin: PluginId) -> Option<&str> {
        self.get(plugin).map(|p| p.name.as_str())
    }

    pub fn status(&self, plugin: PluginId) -> Option<PluginStatus> {
        self.get(plugin).map(|p| p.status)
    }

    /// Set or clear (null `func`) one handler. Returns `false` if the plugin
    /// is not loaded.
    pub fn set_handler(
        &mut self,
        plugin: PluginId,
        id: ApiId,
        phase: HookPhase,
        func: *const c_void,
    ) -> Result<bool, ApiError> {
        if descriptor::lookup(id).is_none() {
            return Err(ApiError::UnknownApi(id));
        }
        let Some(p) = self.get_mut(plugin) else {
            return Ok(false);
        };
        match NonNull::new(func as *mut c_void) {
            Some(handler) => p.handlers.insert((id, phase), handler),
            None => p.handlers.remove(&(id, phase)),
        };
        Ok(true)
    }

    /// Register every non-null entry of a native function table as
    /// `plugin`'s handlers for `table`. Returns how many were set, or `None`
    /// if the plugin is not loaded.
    ///
    /// # Safety
    /// `base` must point to a readable table laid out like `table`, i.e. at
    /// least [`descriptor::slot_count`] function pointers.
    pub unsafe fn attach_table(
        &mut self,
        plugin: PluginId,
        table: ApiTable,
        phase: HookPhase,
        base: *const c_void,
    ) -> Option<usize> {
        let p = self.get_mut(plugin)?;
        let mut attached = 0;
        for desc in descriptor::descriptors(table) {
            let entry = (base as *const u8).add(desc.offset) as *const *const c_void;
            let func = core::ptr::read_unaligned(entry);
            if let Some(handler) = NonNull::new(func as *mut c_void) {
                p.handlers.insert((desc.id, phase), handler);
                attached += 1;
            }
        }
        debug!("registry: {} attached {} {:?} {:?} handlers", plugin, attached, table, phase);
        Some(attached)
    }

    pub fn pause(&mut self, plugin: PluginId) -> bool {
        self.set_status(plugin, PluginStatus::Paused)
    }

    pub fn unpause(&mut self, plugin: PluginId) -> bool {
        self.set_status(plugin, PluginStatus::Running)
    }

    /// Drop a plugin and all its handlers. Later plugins keep their order.
    pub fn unload(&mut self, plugin: PluginId) -> bool {
        let before = self.plugins.len();
        self.plugins.retain(|p| p.id != plugin);
        let removed = self.plugins.len() != before;
        if removed {
            debug!("registry: {} unloaded", plugin);
        }
        removed
    }

    fn set_status(&mut self, plugin: PluginId, status: PluginStatus) -> bool {
        match self.get_mut(plugin) {
            Some(p) => {
                p.status = status;
                true
            }
            None => false,
        }
    }

    fn get(&self, plugin: PluginId) -> Option<&Plugin> {
        self.plugins.iter().find(|p| p.id == plugin)
    }

    fn get_mut(&mut self, plugin: PluginId) -> Option<&mut Plugin> {
        self.plugins.iter_mut().find(|p| p.id == plugin)
    }
}

impl PluginRegistry for PluginList {
    fn chain(&self, id: ApiId, phase: HookPhase) -> Vec<CallChainEntry> {
        self.plugins
            .iter()
            .filter(|p| p.status == PluginStatus::Running)
            .map(|p| CallChainEntry {
                plugin: p.id,
                handler: p.handler(id, phase),
            })
            .collect()
    }
}

// Handler pointers are code addresses, immutable once registered.
unsafe impl Send for PluginList {}
unsafe impl Sync for PluginList {}
