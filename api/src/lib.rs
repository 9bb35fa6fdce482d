//! Shared call-marshaling contract between the dispatch layer and plugins.
//!
//! - [`args`]: argument pack catalog, one `#[repr(C)]` struct per shape
//! - [`caller`]: (return type, shape) → native invoker
//! - [`descriptor`]: every interceptable function, by table and slot
//! - [`hook`]: native entry points that route calls into dispatch
//! - [`meta`]: how handlers report override/supersede decisions

pub mod args;
pub mod caller;
pub mod descriptor;
pub mod error;
pub mod hook;
pub mod meta;
pub mod ret;

pub use args::{ArgPack, Shape};
pub use caller::CallerTable;
pub use descriptor::{ApiDescriptor, ApiId, ApiTable};
pub use error::{ApiError, ErrorCode};
pub use meta::{MetaGlobals, MetaResult};
pub use ret::{RetType, ReturnBox};
