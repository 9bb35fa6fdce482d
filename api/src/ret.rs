use core::ffi::{c_char, c_int, c_uint, c_ulong, c_ushort, c_void};

/// Native return type of an API function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetType {
    Void,
    Int,
    UInt,
    ULong,
    Float,
    Ptr,
    UShort,
    Char,
}

/// A call's result, whatever its native type.
///
/// `#[repr(C)]` so native plugins can read `orig_ret`/`override_ret` out of
/// the meta globals block as a plain tagged union.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReturnBox {
    Void,
    Int(c_int),
    UInt(c_uint),
    ULong(c_ulong),
    Float(f32),
    Ptr(*mut c_void),
    UShort(c_ushort),
    Char(c_char),
}

impl ReturnBox {
    /// The zero value of `ret`, used when nothing produced a result.
    pub const fn zeroed(ret: RetType) -> Self {
        match ret {
            RetType::Void => ReturnBox::Void,
            RetType::Int => ReturnBox::Int(0),
            RetType::UInt => ReturnBox::UInt(0),
            RetType::ULong => ReturnBox::ULong(0),
            RetType::Float => ReturnBox::Float(0.0),
            RetType::Ptr => ReturnBox::Ptr(core::ptr::null_mut()),
            RetType::UShort => ReturnBox::UShort(0),
            RetType::Char => ReturnBox::Char(0),
        }
    }

    pub fn ret_type(&self) -> RetType {
        match self {
            ReturnBox::Void => RetType::Void,
            ReturnBox::Int(_) => RetType::Int,
            ReturnBox::UInt(_) => RetType::UInt,
            ReturnBox::ULong(_) => RetType::ULong,
            ReturnBox::Float(_) => RetType::Float,
            ReturnBox::Ptr(_) => RetType::Ptr,
            ReturnBox::UShort(_) => RetType::UShort,
            ReturnBox::Char(_) => RetType::Char,
        }
    }

    pub fn as_int(&self) -> Option<c_int> {
        match *self {
            ReturnBox::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<*mut c_void> {
        match *self {
            ReturnBox::Ptr(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match *self {
            ReturnBox::Float(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_carries_requested_tag() {
        for ret in [
            RetType::Void,
            RetType::Int,
            RetType::UInt,
            RetType::ULong,
            RetType::Float,
            RetType::Ptr,
            RetType::UShort,
            RetType::Char,
        ] {
            assert_eq!(ReturnBox::zeroed(ret).ret_type(), ret);
        }
    }

    #[test]
    fn accessors_only_match_their_variant() {
        assert_eq!(ReturnBox::Int(7).as_int(), Some(7));
        assert_eq!(ReturnBox::UInt(7).as_int(), None);
        assert_eq!(ReturnBox::Float(1.5).as_float(), Some(1.5));
        assert!(ReturnBox::Void.as_ptr().is_none());
    }
}
