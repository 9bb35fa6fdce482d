//! Argument pack catalog.
//!
//! One `#[repr(C)]` structure per distinct native argument shape used by the
//! engine and game-module APIs, plus one invoker per (return type, shape)
//! pair that actually occurs. Everything is generated from the single
//! `arg_packs!` table at the bottom of this file, so adding a shape or a
//! return type for an existing shape is a one-line change there.
//!
//! Field order is native parameter order. Unsigned `short`/`char`
//! parameters are carried as `unsigned int`, which is what they are promoted
//! to at the call site.

use core::ffi::{c_char, c_int, c_uint, c_ulong, c_ushort, c_void};
use core::ptr::NonNull;

use crate::error::ApiError;
use crate::ret::{RetType, ReturnBox};

/// Opaque native pointer argument (entity, vector, string, ...).
pub type Ptr = *const c_void;

pub(crate) type InvokeFn = unsafe fn(NonNull<c_void>, &ArgPack) -> Result<ReturnBox, ApiError>;

pub(crate) struct CallerEntry {
    pub ret: RetType,
    pub shape: Shape,
    pub invoke: InvokeFn,
}

macro_rules! native_ret {
    (Int) => { c_int };
    (UInt) => { c_uint };
    (ULong) => { c_ulong };
    (Float) => { f32 };
    (Ptr) => { *mut c_void };
    (UShort) => { c_ushort };
    (Char) => { c_char };
}

macro_rules! pack_struct {
    ($(#[$meta:meta])* $pack:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[repr(C)]
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct $pack {
            $(pub $field: $ty,)*
        }
    };
    ($(#[$meta:meta])* $pack:ident { $($field:ident : $ty:ty),* ; $fmt:ident, $msg:ident }) => {
        $(#[$meta])*
        ///
        /// The last two fields hold the caller's format string and the
        /// already formatted text; only the text is forwarded.
        #[repr(C)]
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct $pack {
            $(pub $field: $ty,)*
            pub $fmt: *const c_char,
            pub $msg: *const c_char,
        }
    };
}

macro_rules! invoker {
    // Variadic target: forward the preformatted message through "%s" so it is
    // never interpreted as a format string a second time.
    (Void, $shape:ident { $($field:ident : $ty:ty),* ; $fmt:ident, $msg:ident }) => {{
        unsafe fn invoke(func: NonNull<c_void>, args: &ArgPack) -> Result<ReturnBox, ApiError> {
            let ArgPack::$shape(pack) = args else {
                return Err(ApiError::ShapeMismatch { expected: Shape::$shape, actual: args.shape() });
            };
            let f: unsafe extern "C" fn($($ty,)* *const c_char, ...) = core::mem::transmute(func.as_ptr());
            f($(pack.$field,)* b"%s\0".as_ptr() as *const c_char, pack.$msg);
            Ok(ReturnBox::Void)
        }
        invoke as InvokeFn
    }};
    (Void, $shape:ident { $($field:ident : $ty:ty),* $(,)? }) => {{
        #[allow(unused_variables)]
        unsafe fn invoke(func: NonNull<c_void>, args: &ArgPack) -> Result<ReturnBox, ApiError> {
            let ArgPack::$shape(pack) = args else {
                return Err(ApiError::ShapeMismatch { expected: Shape::$shape, actual: args.shape() });
            };
            let f: unsafe extern "C" fn($($ty),*) = core::mem::transmute(func.as_ptr());
            f($(pack.$field),*);
            Ok(ReturnBox::Void)
        }
        invoke as InvokeFn
    }};
    ($ret:ident, $shape:ident { $($field:ident : $ty:ty),* $(,)? }) => {{
        #[allow(unused_variables)]
        unsafe fn invoke(func: NonNull<c_void>, args: &ArgPack) -> Result<ReturnBox, ApiError> {
            let ArgPack::$shape(pack) = args else {
                return Err(ApiError::ShapeMismatch { expected: Shape::$shape, actual: args.shape() });
            };
            let f: unsafe extern "C" fn($($ty),*) -> native_ret!($ret) = core::mem::transmute(func.as_ptr());
            Ok(ReturnBox::$ret(f($(pack.$field),*)))
        }
        invoke as InvokeFn
    }};
}

// Native entry point for one API: packs its arguments and routes them by
// (table, slot). Variadic shapes get none; a C-variadic function cannot be
// defined on stable Rust.
macro_rules! hook_fn {
    ($ret:ident, $shape:ident $pack:ident { $($field:ident : $ty:ty),* ; $fmt:ident, $msg:ident }) => {};
    (Void, $shape:ident $pack:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        pub unsafe extern "C" fn Void<const TABLE: u8, const SLOT: u16>($($field: $ty),*) {
            let args = ArgPack::$shape($pack { $($field),* });
            crate::hook::route(TABLE, SLOT, RetType::Void, &args);
        }
    };
    ($ret:ident, $shape:ident $pack:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        pub unsafe extern "C" fn $ret<const TABLE: u8, const SLOT: u16>(
            $($field: $ty),*
        ) -> native_ret!($ret) {
            let args = ArgPack::$shape($pack { $($field),* });
            match crate::hook::route(TABLE, SLOT, RetType::$ret, &args) {
                ReturnBox::$ret(value) => value,
                _ => core::mem::zeroed(),
            }
        }
    };
}

macro_rules! hook_fns {
    ($shape:ident $pack:ident $fields:tt [$($ret:ident),*]) => {
        #[allow(non_snake_case)]
        pub mod $shape {
            #[allow(unused_imports)]
            use crate::args::*;

            $(hook_fn!($ret, $shape $pack $fields);)*
        }
    };
}

#[cfg(test)]
macro_rules! stub_case {
    ($ret:ident, $shape:ident $pack:ident { $($field:ident : $ty:ty),* ; $fmt:ident, $msg:ident }) => {
        None
    };
    (Void, $shape:ident $pack:ident { $($field:ident : $ty:ty),* $(,)? }) => {{
        extern "C" fn stub($($field: $ty),*) {
            $(stubs::record($field);)*
        }
        #[allow(unused_mut)]
        fn sample() -> (ArgPack, Vec<u64>) {
            let mut seq = stubs::Seq::default();
            let pack = $pack { $($field: seq.next()),* };
            (ArgPack::$shape(pack), seq.into_expected())
        }
        Some(stubs::StubCase {
            ret: RetType::Void,
            shape: Shape::$shape,
            stub: stub as usize,
            sample,
            expected: ReturnBox::Void,
        })
    }};
    ($ret:ident, $shape:ident $pack:ident { $($field:ident : $ty:ty),* $(,)? }) => {{
        extern "C" fn stub($($field: $ty),*) -> native_ret!($ret) {
            $(stubs::record($field);)*
            <native_ret!($ret) as stubs::Sentinel>::sentinel()
        }
        #[allow(unused_mut)]
        fn sample() -> (ArgPack, Vec<u64>) {
            let mut seq = stubs::Seq::default();
            let pack = $pack { $($field: seq.next()),* };
            (ArgPack::$shape(pack), seq.into_expected())
        }
        Some(stubs::StubCase {
            ret: RetType::$ret,
            shape: Shape::$shape,
            stub: stub as usize,
            sample,
            expected: ReturnBox::$ret(<native_ret!($ret) as stubs::Sentinel>::sentinel()),
        })
    }};
}

macro_rules! arg_packs {
    ($(
        $(#[$meta:meta])*
        $shape:ident => $pack:ident $fields:tt returns [$($ret:ident),* $(,)?];
    )*) => {
        $(
            pack_struct!($(#[$meta])* $pack $fields);

            impl From<$pack> for ArgPack {
                fn from(pack: $pack) -> Self {
                    ArgPack::$shape(pack)
                }
            }
        )*

        /// Argument shape tag. Letters spell the native parameter list:
        /// `I` int, `U` unsigned int, `L` unsigned long, `F` float,
        /// `P` pointer, `V` preformatted variadic message.
        #[allow(clippy::upper_case_acronyms)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Shape {
            $($shape,)*
        }

        /// One call's arguments, tagged with their shape.
        #[allow(clippy::upper_case_acronyms)]
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub enum ArgPack {
            $($shape($pack),)*
        }

        impl ArgPack {
            pub fn shape(&self) -> Shape {
                match self {
                    $(ArgPack::$shape(_) => Shape::$shape,)*
                }
            }
        }

        impl Shape {
            pub const ALL: &'static [Shape] = &[$(Shape::$shape,)*];
        }

        pub(crate) static CALLERS: &[CallerEntry] = &[
            $($(
                CallerEntry {
                    ret: RetType::$ret,
                    shape: Shape::$shape,
                    invoke: invoker!($ret, $shape $fields),
                },
            )*)*
        ];

        /// Native hooks, `hooks::<Shape>::<Ret>::<TABLE, SLOT>`.
        pub mod hooks {
            $(hook_fns!($shape $pack $fields [$($ret),*]);)*
        }

        #[cfg(test)]
        pub(crate) fn stub_cases() -> Vec<stubs::StubCase> {
            let all: Vec<Option<stubs::StubCase>> = vec![
                $($(stub_case!($ret, $shape $pack $fields),)*)*
            ];
            all.into_iter().flatten().collect()
        }
    };
}

arg_packs! {
    Void => PackVoid {} returns [Void, Ptr, Int, Float];
    I => PackI { i1: c_int } returns [Void, Ptr, Int];
    II => PackII { i1: c_int, i2: c_int } returns [Void, Int];
    III => PackIII { i1: c_int, i2: c_int, i3: c_int } returns [Int];
    U => PackU { u1: c_uint } returns [Ptr];
    L => PackL { l1: c_ulong } returns [ULong];
    F => PackF { f1: f32 } returns [Void];
    FF => PackFF { f1: f32, f2: f32 } returns [Float];
    P => PackP { p1: Ptr } returns [Void, Ptr, Char, Int, UInt, Float];
    PP => PackPP { p1: Ptr, p2: Ptr } returns [Void, Ptr, Int];
    PPP => PackPPP { p1: Ptr, p2: Ptr, p3: Ptr } returns [Void, Ptr, Int];
    PPPP => PackPPPP { p1: Ptr, p2: Ptr, p3: Ptr, p4: Ptr } returns [Void, Int];
    /// Printf-style call with a leading pointer.
    PPV => PackPPV { p1: Ptr; fmt, message } returns [Void];
    /// Printf-style call with a leading int.
    IPV => PackIPV { i1: c_int; fmt, message } returns [Void];
    IIPP => PackIIPP { i1: c_int, i2: c_int, p1: Ptr, p2: Ptr } returns [Void];
    IIPPIPP => PackIIPPIPP {
        i1: c_int, i2: c_int, p1: Ptr, p2: Ptr, i3: c_int, p3: Ptr, p4: Ptr
    } returns [Void];
    PPFF => PackPPFF { p1: Ptr, p2: Ptr, f1: f32, f2: f32 } returns [Void];
    PPIIPP => PackPPIIPP { p1: Ptr, p2: Ptr, i1: c_int, i2: c_int, p3: Ptr, p4: Ptr } returns [Void];
    PPFFFUUU => PackPPFFFUUU {
        p1: Ptr, p2: Ptr, f1: f32, f2: f32, f3: f32, u1: c_uint, u2: c_uint, u3: c_uint
    } returns [Void];
    PPF => PackPPF { p1: Ptr, p2: Ptr, f1: f32 } returns [Ptr];
    PPFI => PackPPFI { p1: Ptr, p2: Ptr, f1: f32, i1: c_int } returns [Void];
    PPI => PackPPI { p1: Ptr, p2: Ptr, i1: c_int } returns [Void, Int];
    PPU => PackPPU { p1: Ptr, p2: Ptr, u1: c_uint } returns [Void];
    PPIPP => PackPPIPP { p1: Ptr, p2: Ptr, i1: c_int, p3: Ptr, p4: Ptr } returns [Void];
    PPIFPP => PackPPIFPP { p1: Ptr, p2: Ptr, i1: c_int, f1: f32, p3: Ptr, p4: Ptr } returns [Void];
    PPPFFII => PackPPPFFII {
        p1: Ptr, p2: Ptr, p3: Ptr, f1: f32, f2: f32, i1: c_int, i2: c_int
    } returns [Void];
    PPPIPP => PackPPPIPP { p1: Ptr, p2: Ptr, p3: Ptr, i1: c_int, p4: Ptr, p5: Ptr } returns [Int];
    PPPPI => PackPPPPI { p1: Ptr, p2: Ptr, p3: Ptr, p4: Ptr, i1: c_int } returns [Void];
    IP => PackIP { i1: c_int, p1: Ptr } returns [Void, UShort, Int];
    IPP => PackIPP { i1: c_int, p1: Ptr, p2: Ptr } returns [Int];
    IPPP => PackIPPP { i1: c_int, p1: Ptr, p2: Ptr, p3: Ptr } returns [Void];
    IPUFPPFFIIII => PackIPUFPPFFIIII {
        i1: c_int, p1: Ptr, u1: c_uint, f1: f32, p2: Ptr, p3: Ptr,
        f2: f32, f3: f32, i2: c_int, i3: c_int, i4: c_int, i5: c_int
    } returns [Void];
    PF => PackPF { p1: Ptr, f1: f32 } returns [Void];
    PFF => PackPFF { p1: Ptr, f1: f32, f2: f32 } returns [Void];
    PFFI => PackPFFI { p1: Ptr, f1: f32, f2: f32, i1: c_int } returns [Int];
    PFP => PackPFP { p1: Ptr, f1: f32, p2: Ptr } returns [Void];
    PI => PackPI { p1: Ptr, i1: c_int } returns [Void, Ptr, Int];
    PII => PackPII { p1: Ptr, i1: c_int, i2: c_int } returns [Void];
    PIII => PackPIII { p1: Ptr, i1: c_int, i2: c_int, i3: c_int } returns [Void];
    PIIII => PackPIIII { p1: Ptr, i1: c_int, i2: c_int, i3: c_int, i4: c_int } returns [Void];
    PIP => PackPIP { p1: Ptr, i1: c_int, p2: Ptr } returns [Void, Ptr];
    PIPP => PackPIPP { p1: Ptr, i1: c_int, p2: Ptr, p3: Ptr } returns [Void];
    PIPFFII => PackPIPFFII {
        p1: Ptr, i1: c_int, p2: Ptr, f1: f32, f2: f32, i2: c_int, i3: c_int
    } returns [Void];
    PIPFFIIIIPP => PackPIPFFIIIIPP {
        p1: Ptr, i1: c_int, p2: Ptr, f1: f32, f2: f32,
        i2: c_int, i3: c_int, i4: c_int, i5: c_int, p3: Ptr, p4: Ptr
    } returns [Void];
    PIPPIIP => PackPIPPIIP {
        p1: Ptr, i1: c_int, p2: Ptr, p3: Ptr, i2: c_int, i3: c_int, p4: Ptr
    } returns [Int];
    PU => PackPU { p1: Ptr, u1: c_uint } returns [Void];
}

#[cfg(test)]
pub(crate) mod stubs {
    //! Recording stubs used to check that every invoker passes fields in
    //! declared order and boxes the stub's sentinel with the right tag.

    use super::*;
    use std::cell::RefCell;

    thread_local! {
        static RECORDED: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
    }

    pub(crate) struct StubCase {
        pub ret: RetType,
        pub shape: Shape,
        pub stub: usize,
        pub sample: fn() -> (ArgPack, Vec<u64>),
        pub expected: ReturnBox,
    }

    pub(crate) fn take_recorded() -> Vec<u64> {
        RECORDED.with(|r| std::mem::take(&mut *r.borrow_mut()))
    }

    pub(crate) fn record<T: Sample>(value: T) {
        RECORDED.with(|r| r.borrow_mut().push(value.bits()));
    }

    /// Field values that differ per position, so a swapped pair shows up.
    pub(crate) trait Sample: Copy {
        fn at(position: usize) -> Self;
        fn bits(self) -> u64;
    }

    impl Sample for i32 {
        fn at(position: usize) -> Self {
            -100 - position as i32
        }
        fn bits(self) -> u64 {
            self as u32 as u64
        }
    }

    impl Sample for u32 {
        fn at(position: usize) -> Self {
            0xA000 + position as u32
        }
        fn bits(self) -> u64 {
            self as u64
        }
    }

    impl Sample for u64 {
        fn at(position: usize) -> Self {
            0xB000_0000_0000 + position as u64
        }
        fn bits(self) -> u64 {
            self
        }
    }

    impl Sample for f32 {
        fn at(position: usize) -> Self {
            position as f32 + 0.25
        }
        fn bits(self) -> u64 {
            self.to_bits() as u64
        }
    }

    impl Sample for *const c_void {
        fn at(position: usize) -> Self {
            (0x1000 + position * 0x10) as *const c_void
        }
        fn bits(self) -> u64 {
            self as usize as u64
        }
    }

    #[derive(Default)]
    pub(crate) struct Seq {
        position: usize,
        expected: Vec<u64>,
    }

    impl Seq {
        #[allow(clippy::should_implement_trait)]
        pub fn next<T: Sample>(&mut self) -> T {
            let value = T::at(self.position);
            self.position += 1;
            self.expected.push(value.bits());
            value
        }

        pub fn into_expected(self) -> Vec<u64> {
            self.expected
        }
    }

    pub(crate) trait Sentinel {
        fn sentinel() -> Self;
    }

    impl Sentinel for i32 {
        fn sentinel() -> Self {
            0x5EED
        }
    }

    impl Sentinel for u32 {
        fn sentinel() -> Self {
            0xFACE
        }
    }

    impl Sentinel for u64 {
        fn sentinel() -> Self {
            0xDEAD_BEEF
        }
    }

    impl Sentinel for u16 {
        fn sentinel() -> Self {
            0x0777
        }
    }

    impl Sentinel for i8 {
        fn sentinel() -> Self {
            0x2A
        }
    }

    impl Sentinel for u8 {
        fn sentinel() -> Self {
            0x2A
        }
    }

    impl Sentinel for f32 {
        fn sentinel() -> Self {
            42.75
        }
    }

    impl Sentinel for *mut c_void {
        fn sentinel() -> Self {
            0xBEE0 as *mut c_void
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_are_unique_and_packs_report_their_shape() {
        let mut seen = std::collections::HashSet::new();
        for shape in Shape::ALL {
            assert!(seen.insert(*shape), "duplicate shape {shape:?}");
        }
        let pack: ArgPack = PackPI { p1: core::ptr::null(), i1: 3 }.into();
        assert_eq!(pack.shape(), Shape::PI);
    }

    #[test]
    fn every_shape_has_at_least_one_caller() {
        for shape in Shape::ALL {
            assert!(
                CALLERS.iter().any(|c| c.shape == *shape),
                "shape {shape:?} has no caller routine"
            );
        }
    }

    #[test]
    fn caller_pairs_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for c in CALLERS {
            assert!(seen.insert((c.ret, c.shape)), "duplicate caller {:?}/{:?}", c.ret, c.shape);
        }
    }

    #[test]
    fn pack_layout_matches_native_struct() {
        // int, pointer, pointer: pointer-aligned after the leading int.
        let ptr = core::mem::size_of::<*const c_void>();
        let expected = if ptr == 8 { 24 } else { 12 };
        assert_eq!(core::mem::size_of::<PackIPP>(), expected);
        assert_eq!(core::mem::size_of::<PackVoid>(), 0);
    }
}
