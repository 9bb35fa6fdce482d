//! Native entry points.
//!
//! Every non-variadic API has a generated `extern "C"` hook in
//! [`crate::args::hooks`]. A hook packs its native arguments and hands them
//! to the process router, which the dispatch layer installs once with
//! [`set_router`]. [`crate::descriptor::hook_table`] lays the hooks out in
//! slot order so a whole table can be handed to the other side.

use std::sync::OnceLock;

use log::warn;

use crate::args::ArgPack;
use crate::descriptor::{ApiId, ApiTable};
use crate::ret::{RetType, ReturnBox};

/// Receives every hooked call. `None` means nothing could be produced and
/// the hook returns the zero value of its return type.
pub type RouteFn = unsafe fn(ApiId, &ArgPack) -> Option<ReturnBox>;

static ROUTER: OnceLock<RouteFn> = OnceLock::new();

/// Install the process router. Only the first call wins.
pub fn set_router(router: RouteFn) -> bool {
    ROUTER.set(router).is_ok()
}

pub fn router_installed() -> bool {
    ROUTER.get().is_some()
}

#[doc(hidden)]
pub unsafe fn route(table: u8, slot: u16, ret: RetType, args: &ArgPack) -> ReturnBox {
    let Some(table) = ApiTable::from_index(table) else {
        return ReturnBox::zeroed(ret);
    };
    let Some(router) = ROUTER.get() else {
        warn!("{:?}#{slot} called before a router was installed", table);
        return ReturnBox::zeroed(ret);
    };
    match router(ApiId::new(table, slot), args) {
        Some(value) if value.ret_type() == ret => value,
        _ => ReturnBox::zeroed(ret),
    }
}
