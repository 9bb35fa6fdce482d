//! The chokepoint every intercepted call passes through.
//!
//! A call runs every active pre handler in load order, then the real
//! function unless some handler superseded it, then every post handler.
//! Handlers steer the outcome through the thread's [`MetaGlobals`].

use std::ffi::c_void;

use log::{debug, error, warn};
use metahook_api::descriptor::{self, ApiDescriptor};
use metahook_api::meta::{self, MetaGlobals, MetaResult};
use metahook_api::{ApiError, ApiId, ArgPack, CallerTable, ReturnBox};

use crate::registry::{HookPhase, PluginRegistry};

/// What one phase of handlers decided.
#[derive(Debug, Clone, Copy)]
struct PhaseOutcome {
    status: MetaResult,
    /// Value of the last handler that reported `Override` or stronger.
    override_ret: Option<ReturnBox>,
}

pub struct Dispatcher<'a> {
    callers: &'a CallerTable,
}

impl Dispatcher<'static> {
    /// Dispatcher over the process-wide caller table.
    pub fn obtain() -> Self {
        Self::new(CallerTable::obtain())
    }
}

impl<'a> Dispatcher<'a> {
    pub fn new(callers: &'a CallerTable) -> Self {
        Self { callers }
    }

    /// Route one call to `id` through the plugins in `registry`, then to
    /// `real`.
    ///
    /// The calling thread's meta globals are restored before returning, so
    /// a handler that calls back into a hooked API sees its own state
    /// afterwards.
    ///
    /// # Safety
    /// `real` and every handler in `registry` for `id` must be functions
    /// with `id`'s native signature, and `args` must hold whatever those
    /// functions expect.
    pub unsafe fn dispatch<R: PluginRegistry + ?Sized>(
        &self,
        registry: &R,
        id: ApiId,
        real: *const c_void,
        args: &ArgPack,
    ) -> Result<ReturnBox, ApiError> {
        let desc = descriptor::lookup(id).ok_or(ApiError::UnknownApi(id))?;
        if args.shape() != desc.shape {
            return Err(ApiError::ShapeMismatch {
                expected: desc.shape,
                actual: args.shape(),
            });
        }

        let saved = meta::snapshot();
        let result = self.run(registry, desc, real, args);
        meta::restore(saved);
        result
    }

    unsafe fn run<R: PluginRegistry + ?Sized>(
        &self,
        registry: &R,
        desc: &ApiDescriptor,
        real: *const c_void,
        args: &ArgPack,
    ) -> Result<ReturnBox, ApiError> {
        meta::restore(MetaGlobals::for_call(desc.ret));

        let pre = self.run_phase(registry, desc, HookPhase::Pre, args, None)?;

        let orig_ret = match pre.override_ret {
            Some(value) if pre.status == MetaResult::Supercede => {
                debug!("dispatch: {} ({}) superseded", desc.name, desc.id);
                value
            }
            _ => self.callers.call(desc.ret, desc.shape, real, args)?,
        };
        meta::with_globals(|g| g.orig_ret = orig_ret);

        let post = self.run_phase(registry, desc, HookPhase::Post, args, pre.override_ret)?;
        Ok(post.override_ret.unwrap_or(orig_ret))
    }

    /// Run every handler of one phase. All handlers run; a supersede never
    /// short-circuits the ones loaded after it.
    unsafe fn run_phase<R: PluginRegistry + ?Sized>(
        &self,
        registry: &R,
        desc: &ApiDescriptor,
        phase: HookPhase,
        args: &ArgPack,
        mut override_ret: Option<ReturnBox>,
    ) -> Result<PhaseOutcome, ApiError> {
        let mut status = MetaResult::Unset;
        let mut prev = MetaResult::Unset;

        for entry in registry.chain(desc.id, phase) {
            let Some(handler) = entry.handler else {
                continue;
            };
            meta::with_globals(|g| {
                g.mres = MetaResult::Unset;
                g.prev_mres = prev;
                g.status = status;
            });

            let ret = self.callers.call(desc.ret, desc.shape, handler.as_ptr(), args)?;

            let mres = match (meta::result(), phase) {
                (MetaResult::Unset, _) => {
                    error!(
                        "dispatch: {} left no result for {} ({:?}), treating as ignored",
                        entry.plugin, desc.name, phase
                    );
                    MetaResult::Ignored
                }
                (MetaResult::Supercede, HookPhase::Post) => {
                    warn!(
                        "dispatch: {} tried to supersede {} after the call, treating as override",
                        entry.plugin, desc.name
                    );
                    MetaResult::Override
                }
                (r, _) => r,
            };

            if mres >= MetaResult::Override {
                override_ret = Some(ret);
                meta::with_globals(|g| g.override_ret = ret);
            }
            status = status.max(mres);
            prev = mres;
        }

        Ok(PhaseOutcome { status, override_ret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PluginList;
    use metahook_api::args::{PackP, PackVoid};
    use metahook_api::{ApiTable, ErrorCode};
    use std::cell::RefCell;
    use std::ffi::c_int;

    // Int/Void
    const LAG_COMP: ApiId = ApiId::new(ApiTable::Entity, 49);
    // Int/P
    const SPAWN: ApiId = ApiId::new(ApiTable::Entity, 1);

    thread_local! {
        static CALLS: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
        static SEEN: RefCell<Vec<(MetaResult, MetaResult)>> = const { RefCell::new(Vec::new()) };
        static ORIG: RefCell<Vec<ReturnBox>> = const { RefCell::new(Vec::new()) };
    }

    fn log(name: &'static str) {
        CALLS.with(|c| c.borrow_mut().push(name));
        let g = meta::snapshot();
        SEEN.with(|s| s.borrow_mut().push((g.prev_mres, g.status)));
    }

    fn take_calls() -> Vec<&'static str> {
        SEEN.with(|s| s.borrow_mut().clear());
        ORIG.with(|o| o.borrow_mut().clear());
        CALLS.with(|c| std::mem::take(&mut *c.borrow_mut()))
    }

    extern "C" fn real() -> c_int {
        log("real");
        7
    }
    extern "C" fn supersede_a() -> c_int {
        log("a");
        meta::set_result(MetaResult::Supercede);
        1
    }
    extern "C" fn supersede_b() -> c_int {
        log("b");
        meta::set_result(MetaResult::Supercede);
        2
    }
    extern "C" fn supersede_c() -> c_int {
        log("c");
        meta::set_result(MetaResult::Supercede);
        3
    }
    extern "C" fn ignore() -> c_int {
        log("ignore");
        meta::set_result(MetaResult::Ignored);
        100
    }
    extern "C" fn handle() -> c_int {
        log("handle");
        meta::set_result(MetaResult::Handled);
        101
    }
    extern "C" fn override_42() -> c_int {
        log("override");
        meta::set_result(MetaResult::Override);
        42
    }
    extern "C" fn silent() -> c_int {
        log("silent");
        55
    }
    extern "C" fn post_observe() -> c_int {
        log("post");
        ORIG.with(|o| o.borrow_mut().push(meta::snapshot().orig_ret));
        meta::set_result(MetaResult::Ignored);
        0
    }
    extern "C" fn post_supersede() -> c_int {
        log("post-supersede");
        meta::set_result(MetaResult::Supercede);
        99
    }

    extern "C" fn real_spawn(ent: *const c_void) -> c_int {
        log("real");
        ent as usize as c_int
    }
    extern "C" fn spawn_plus_one(ent: *const c_void) -> c_int {
        log("plugin");
        meta::set_result(MetaResult::Supercede);
        ent as usize as c_int + 1
    }

    fn plugins(pre: &[extern "C" fn() -> c_int]) -> PluginList {
        let mut list = PluginList::new();
        for (i, handler) in pre.iter().enumerate() {
            let id = list.register(&format!("p{i}"));
            list.set_handler(id, LAG_COMP, HookPhase::Pre, *handler as *const c_void).unwrap();
        }
        list
    }

    fn call(list: &PluginList) -> Result<ReturnBox, ApiError> {
        let args = ArgPack::from(PackVoid {});
        unsafe { Dispatcher::obtain().dispatch(list, LAG_COMP, real as *const c_void, &args) }
    }

    #[test]
    fn every_superseding_plugin_runs_and_the_last_one_wins() {
        take_calls();
        let list = plugins(&[supersede_a, supersede_b, supersede_c]);
        assert_eq!(call(&list), Ok(ReturnBox::Int(3)));
        assert_eq!(take_calls(), vec!["a", "b", "c"]);
    }

    #[test]
    fn without_supersede_the_real_result_is_returned_unchanged() {
        take_calls();
        let list = plugins(&[ignore, handle]);
        assert_eq!(call(&list), Ok(ReturnBox::Int(7)));
        assert_eq!(take_calls(), vec!["ignore", "handle", "real"]);

        assert_eq!(call(&PluginList::new()), Ok(ReturnBox::Int(7)));
        assert_eq!(take_calls(), vec!["real"]);
    }

    #[test]
    fn override_runs_the_real_function_but_returns_the_plugin_value() {
        take_calls();
        let list = plugins(&[override_42, handle]);
        assert_eq!(call(&list), Ok(ReturnBox::Int(42)));
        assert_eq!(take_calls(), vec!["override", "handle", "real"]);
    }

    #[test]
    fn handlers_see_previous_result_and_running_status() {
        take_calls();
        let list = plugins(&[handle, ignore, override_42]);
        call(&list).unwrap();
        let seen = SEEN.with(|s| s.borrow().clone());
        // real() logs too; only the handlers matter here.
        assert_eq!(
            &seen[..3],
            &[
                (MetaResult::Unset, MetaResult::Unset),
                (MetaResult::Handled, MetaResult::Handled),
                (MetaResult::Ignored, MetaResult::Handled),
            ]
        );
    }

    #[test]
    fn unset_result_counts_as_ignored() {
        take_calls();
        let list = plugins(&[silent]);
        assert_eq!(call(&list), Ok(ReturnBox::Int(7)));
        assert_eq!(take_calls(), vec!["silent", "real"]);
    }

    #[test]
    fn paused_plugins_are_skipped() {
        take_calls();
        let mut list = plugins(&[supersede_a, supersede_b]);
        list.pause(crate::registry::PluginId(1));
        assert_eq!(call(&list), Ok(ReturnBox::Int(1)));
        assert_eq!(take_calls(), vec!["a"]);
    }

    #[test]
    fn post_handlers_observe_the_original_return() {
        take_calls();
        let mut list = plugins(&[handle]);
        let p = list.register("post");
        list.set_handler(p, LAG_COMP, HookPhase::Post, post_observe as *const c_void).unwrap();
        assert_eq!(call(&list), Ok(ReturnBox::Int(7)));
        let orig = ORIG.with(|o| o.borrow().clone());
        assert_eq!(orig, vec![ReturnBox::Int(7)]);
        assert_eq!(take_calls(), vec!["handle", "real", "post"]);
    }

    #[test]
    fn post_observes_the_superseding_value_instead_of_a_real_call() {
        take_calls();
        let mut list = plugins(&[supersede_b]);
        let p = list.register("post");
        list.set_handler(p, LAG_COMP, HookPhase::Post, post_observe as *const c_void).unwrap();
        assert_eq!(call(&list), Ok(ReturnBox::Int(2)));
        assert_eq!(ORIG.with(|o| o.borrow().clone()), vec![ReturnBox::Int(2)]);
        assert_eq!(take_calls(), vec!["b", "post"]);
    }

    #[test]
    fn post_supersede_is_downgraded_to_override() {
        take_calls();
        let mut list = plugins(&[]);
        let p = list.register("post");
        list.set_handler(p, LAG_COMP, HookPhase::Post, post_supersede as *const c_void).unwrap();
        assert_eq!(call(&list), Ok(ReturnBox::Int(99)));
        assert_eq!(take_calls(), vec!["real", "post-supersede"]);
    }

    #[test]
    fn arguments_reach_handlers_and_the_real_function() {
        take_calls();
        let mut list = PluginList::new();
        let a = list.register("a");
        let args = ArgPack::from(PackP { p1: 20 as *const c_void });

        let r = unsafe { Dispatcher::obtain().dispatch(&list, SPAWN, real_spawn as *const c_void, &args) };
        assert_eq!(r, Ok(ReturnBox::Int(20)));

        list.set_handler(a, SPAWN, HookPhase::Pre, spawn_plus_one as *const c_void).unwrap();
        let r = unsafe { Dispatcher::obtain().dispatch(&list, SPAWN, real_spawn as *const c_void, &args) };
        assert_eq!(r, Ok(ReturnBox::Int(21)));
        assert_eq!(take_calls(), vec!["real", "plugin"]);
    }

    #[test]
    fn globals_are_restored_after_dispatch() {
        take_calls();
        meta::set_result(MetaResult::Handled);
        let before = meta::snapshot();
        let list = plugins(&[supersede_a]);
        call(&list).unwrap();
        assert_eq!(meta::snapshot(), before);
        meta::restore(MetaGlobals::new());
        take_calls();
    }

    #[test]
    fn unknown_api_and_wrong_shape_call_nothing() {
        take_calls();
        let list = plugins(&[supersede_a]);
        let args = ArgPack::from(PackVoid {});
        let bogus = ApiId::new(ApiTable::Entity, 500);
        let err = unsafe { Dispatcher::obtain().dispatch(&list, bogus, real as *const c_void, &args) }
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownApi);

        let err = unsafe { Dispatcher::obtain().dispatch(&list, SPAWN, real_spawn as *const c_void, &args) }
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShapeMismatch);
        assert!(take_calls().is_empty());
    }

    #[test]
    fn null_real_function_fails_the_call() {
        take_calls();
        let list = plugins(&[ignore]);
        let args = ArgPack::from(PackVoid {});
        let err = unsafe { Dispatcher::obtain().dispatch(&list, LAG_COMP, core::ptr::null(), &args) }
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NullFunction);
        assert_eq!(take_calls(), vec!["ignore"]);
    }
}
