use std::fmt;
use std::path::PathBuf;

use metahook_api::{ApiError, ErrorCode};
use metahook_intercept::HookError;
use thiserror::Error;

/// Which side of a version handshake is behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outdated {
    GameModule,
    Engine,
}

impl Outdated {
    /// The game module reported `actual` where we wanted `expected`.
    pub fn from_versions(expected: i32, actual: i32) -> Self {
        if actual > expected {
            Outdated::Engine
        } else {
            Outdated::GameModule
        }
    }
}

impl fmt::Display for Outdated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outdated::GameModule => f.write_str("game module appears to be outdated"),
            Outdated::Engine => f.write_str("engine appears to be outdated"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("symbol redirection failed: {0:?}")]
    Linkent(HookError),

    #[error("{entry}: interface version mismatch, expected {expected}, game module has {actual} ({outdated})")]
    VersionMismatch {
        entry: &'static str,
        expected: i32,
        actual: i32,
        outdated: Outdated,
    },

    #[error("game module does not export {0}")]
    MissingEntryPoint(&'static str),

    #[error("{0} failed without reporting a version")]
    EntryPointFailed(&'static str),

    #[error("cannot open game module {}: {reason}", path.display())]
    OpenFailed { path: PathBuf, reason: String },
}

impl From<HookError> for AgentError {
    fn from(err: HookError) -> Self {
        AgentError::Linkent(err)
    }
}

impl AgentError {
    pub fn version_mismatch(entry: &'static str, expected: i32, actual: i32) -> Self {
        AgentError::VersionMismatch {
            entry,
            expected,
            actual,
            outdated: Outdated::from_versions(expected, actual),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::Api(e) => e.code(),
            AgentError::Linkent(HookError::LookupNotFound | HookError::NotFound) => ErrorCode::LookupNotFound,
            AgentError::Linkent(HookError::ProtectFailed | HookError::AllocationFailed) => ErrorCode::ProtectFailed,
            AgentError::Linkent(HookError::Unsupported) => ErrorCode::Unsupported,
            AgentError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            AgentError::MissingEntryPoint(_) => ErrorCode::MissingEntryPoint,
            AgentError::EntryPointFailed(_) => ErrorCode::EntryPointFailed,
            AgentError::OpenFailed { .. } => ErrorCode::OpenFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;
    use metahook_api::{ApiId, ApiTable};

    #[test]
    fn outdated_side_follows_the_lower_version() {
        assert_eq!(Outdated::from_versions(140, 139), Outdated::GameModule);
        assert_eq!(Outdated::from_versions(140, 141), Outdated::Engine);
    }

    #[test]
    fn mismatch_message_names_both_versions_and_the_outdated_side() {
        let err = AgentError::version_mismatch("GetEntityAPI2", 140, 139);
        let msg = err.to_string();
        assert!(msg.contains("140") && msg.contains("139"), "{msg}");
        assert!(msg.contains("game module appears to be outdated"), "{msg}");
        assert_eq!(err.code(), ErrorCode::VersionMismatch);
    }

    #[test]
    fn codes_translate_across_crate_boundaries() {
        let api = AgentError::from(ApiError::UnknownApi(ApiId::new(ApiTable::Entity, 99)));
        assert_eq!(api.code(), ErrorCode::UnknownApi);
        assert_eq!(AgentError::from(HookError::LookupNotFound).code(), ErrorCode::LookupNotFound);
        assert_eq!(AgentError::from(HookError::ProtectFailed).code(), ErrorCode::ProtectFailed);
        assert_eq!(AgentError::from(HookError::Unsupported).code(), ErrorCode::Unsupported);
        assert_eq!(AgentError::MissingEntryPoint("GiveFnptrsToDll").code(), ErrorCode::MissingEntryPoint);
    }
}
