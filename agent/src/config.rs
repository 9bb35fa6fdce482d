//! Agent settings, read once from the environment.

use std::path::PathBuf;
use std::str::FromStr;

use log::warn;

pub const LINKENT_VAR: &str = "METAHOOK_LINKENT";
pub const GAMEDLL_VAR: &str = "METAHOOK_GAMEDLL";
pub const HOOK_DEBUG_VAR: &str = "METAHOOK_HOOK_DEBUG";

/// What to do about the loader-lookup redirect when a game module loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkentMode {
    /// Redirect failure aborts the game-module load.
    #[default]
    Required,
    /// Redirect failure is logged and loading continues.
    Optional,
    /// Never install the redirect.
    Off,
}

impl FromStr for LinkentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "required" | "1" | "on" => Ok(LinkentMode::Required),
            "optional" => Ok(LinkentMode::Optional),
            "off" | "0" | "none" => Ok(LinkentMode::Off),
            other => Err(format!("unknown linkent mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentConfig {
    pub linkent: LinkentMode,
    /// Game module to load at startup, if any.
    pub gamedll: Option<PathBuf>,
    pub hook_debug: bool,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unparseable values fall back
    /// to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let linkent = match lookup(LINKENT_VAR) {
            Some(value) => value.parse().unwrap_or_else(|e| {
                warn!("{LINKENT_VAR}: {e}, using required");
                LinkentMode::Required
            }),
            None => LinkentMode::default(),
        };
        let gamedll = lookup(GAMEDLL_VAR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let hook_debug = lookup(HOOK_DEBUG_VAR).is_some_and(|v| !v.is_empty() && v != "0");

        Self {
            linkent,
            gamedll,
            hook_debug,
        }
    }
}
