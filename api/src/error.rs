use thiserror::Error;

use crate::args::Shape;
use crate::descriptor::ApiId;
use crate::ret::RetType;

/// Fixed error-code enumeration every subsystem boundary translates into.
///
/// The discriminants are part of the plugin-facing ABI; never renumber.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UnknownApi = 1,
    NullFunction = 2,
    ShapeMismatch = 3,
    MissingCaller = 4,
    LookupNotFound = 5,
    ProtectFailed = 6,
    Unsupported = 7,
    VersionMismatch = 8,
    MissingEntryPoint = 9,
    EntryPointFailed = 10,
    OpenFailed = 11,
}

/// Registry inconsistencies. Each one fails a single call and is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("unknown API id {0}")]
    UnknownApi(ApiId),

    #[error("null function pointer for {ret:?}/{shape:?} call")]
    NullFunction { ret: RetType, shape: Shape },

    #[error("argument pack shape {actual:?} does not match expected {expected:?}")]
    ShapeMismatch { expected: Shape, actual: Shape },

    #[error("no caller routine for {ret:?}/{shape:?}")]
    MissingCaller { ret: RetType, shape: Shape },
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::UnknownApi(_) => ErrorCode::UnknownApi,
            ApiError::NullFunction { .. } => ErrorCode::NullFunction,
            ApiError::ShapeMismatch { .. } => ErrorCode::ShapeMismatch,
            ApiError::MissingCaller { .. } => ErrorCode::MissingCaller,
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
