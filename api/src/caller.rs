//! Caller Table: (return type, shape) → invoker lookup.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::OnceLock;

use log::debug;

use crate::args::{ArgPack, InvokeFn, Shape, CALLERS};
use crate::error::{ApiError, Result};
use crate::ret::{RetType, ReturnBox};

static CALLER_TABLE: OnceLock<CallerTable> = OnceLock::new();

pub struct CallerTable {
    callers: HashMap<(RetType, Shape), InvokeFn>,
}

impl CallerTable {
    /// Build a fresh table from the argument pack catalog.
    pub fn new() -> Self {
        let callers: HashMap<_, _> = CALLERS
            .iter()
            .map(|entry| ((entry.ret, entry.shape), entry.invoke))
            .collect();
        debug!("caller table: {} invokers", callers.len());
        Self { callers }
    }

    /// Process-wide table, built on first use.
    pub fn obtain() -> &'static CallerTable {
        CALLER_TABLE.get_or_init(CallerTable::new)
    }

    pub fn supports(&self, ret: RetType, shape: Shape) -> bool {
        self.callers.contains_key(&(ret, shape))
    }

    pub fn len(&self) -> usize {
        self.callers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }

    /// Invoke `func` as a native `ret (shape...)` function with `args`.
    ///
    /// # Safety
    /// `func` must be null or point to a function whose native signature is
    /// exactly `ret` over `shape`'s fields. Pointer fields of `args` must be
    /// whatever that function expects.
    pub unsafe fn call(
        &self,
        ret: RetType,
        shape: Shape,
        func: *const c_void,
        args: &ArgPack,
    ) -> Result<ReturnBox> {
        let invoke = self
            .callers
            .get(&(ret, shape))
            .ok_or(ApiError::MissingCaller { ret, shape })?;
        let func = NonNull::new(func as *mut c_void).ok_or(ApiError::NullFunction { ret, shape })?;
        if args.shape() != shape {
            return Err(ApiError::ShapeMismatch { expected: shape, actual: args.shape() });
        }
        invoke(func, args)
    }
}

impl Default for CallerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::stubs;
    use crate::args::{stub_cases, PackI, PackIPV, PackPPV};
    use crate::descriptor::{self, ApiTable};
    use std::ffi::{c_char, c_int, CStr};

    #[test]
    fn every_caller_forwards_fields_in_order_and_boxes_the_sentinel() {
        let table = CallerTable::new();
        let cases = stub_cases();
        assert!(!cases.is_empty());
        for p in cases {
            let (pack, expected_args) = (p.sample)();
            stubs::take_recorded();
            let ret = unsafe { table.call(p.ret, p.shape, p.stub as *const c_void, &pack) }
                .unwrap_or_else(|e| panic!("{:?}/{:?}: {e}", p.ret, p.shape));
            assert_eq!(stubs::take_recorded(), expected_args, "{:?}/{:?} argument order", p.ret, p.shape);
            assert_eq!(ret, p.expected, "{:?}/{:?} return", p.ret, p.shape);
            assert_eq!(ret.ret_type(), p.ret);
        }
    }

    #[test]
    fn every_descriptor_has_a_stub_or_is_variadic() {
        let cases = stub_cases();
        for table in [ApiTable::Engine, ApiTable::Entity, ApiTable::NewEntity] {
            for d in descriptor::descriptors(table) {
                let covered = cases.iter().any(|p| p.ret == d.ret && p.shape == d.shape);
                let variadic = matches!(d.shape, Shape::PPV | Shape::IPV);
                assert!(covered || variadic, "{} has no recording stub", d.name);
            }
        }
    }

    #[test]
    fn null_function_is_rejected_before_calling() {
        let table = CallerTable::new();
        let pack = ArgPack::from(PackI { i1: 1 });
        let err = unsafe { table.call(RetType::Int, Shape::I, std::ptr::null(), &pack) }.unwrap_err();
        assert_eq!(err, ApiError::NullFunction { ret: RetType::Int, shape: Shape::I });
        assert_eq!(err.code(), crate::ErrorCode::NullFunction);
    }

    #[test]
    fn mismatched_pack_is_rejected() {
        extern "C" fn never(_: c_int, _: c_int) -> c_int {
            panic!("must not be called");
        }
        let table = CallerTable::new();
        let pack = ArgPack::from(PackI { i1: 1 });
        let err = unsafe { table.call(RetType::Int, Shape::II, never as *const c_void, &pack) }.unwrap_err();
        assert_eq!(err, ApiError::ShapeMismatch { expected: Shape::II, actual: Shape::I });
    }

    #[test]
    fn unknown_pair_reports_missing_caller() {
        let table = CallerTable::new();
        assert!(!table.supports(RetType::Char, Shape::II));
        let pack = ArgPack::from(PackI { i1: 1 });
        let err = unsafe { table.call(RetType::Char, Shape::I, 1 as *const c_void, &pack) }.unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::MissingCaller);
    }

    #[test]
    fn obtain_returns_the_same_table() {
        let a = CallerTable::obtain() as *const CallerTable;
        let b = CallerTable::obtain() as *const CallerTable;
        assert_eq!(a, b);
        assert_eq!(CallerTable::obtain().len(), CallerTable::new().len());
    }

    #[test]
    fn pointer_variadic_forwards_message_verbatim() {
        let mut buf = [0 as c_char; 64];
        let message = c"100% done %n";
        let pack = ArgPack::from(PackPPV {
            p1: buf.as_mut_ptr() as *const c_void,
            fmt: c"%s".as_ptr(),
            message: message.as_ptr(),
        });
        let ret = unsafe {
            CallerTable::obtain().call(RetType::Void, Shape::PPV, libc::sprintf as *const c_void, &pack)
        }
        .unwrap();
        assert_eq!(ret, ReturnBox::Void);
        let written = unsafe { CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(written, message);
    }

    extern "C" {
        fn dprintf(fd: c_int, format: *const c_char, ...) -> c_int;
    }

    #[test]
    fn int_variadic_forwards_message_verbatim() {
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let pack = ArgPack::from(PackIPV {
            i1: fds[1],
            fmt: c"%d".as_ptr(),
            message: c"L 10:00 - %s".as_ptr(),
        });
        unsafe { CallerTable::obtain().call(RetType::Void, Shape::IPV, dprintf as *const c_void, &pack) }
            .unwrap();
        let mut out = [0u8; 32];
        let n = unsafe { libc::read(fds[0], out.as_mut_ptr() as *mut c_void, out.len()) };
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        assert_eq!(&out[..n as usize], b"L 10:00 - %s");
    }
}
