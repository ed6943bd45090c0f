//! Per-database options settable at runtime: `EXCLUSIVE` and
//! `OPTIMIZE_REUSE_RESULTS`.

use std::fmt;

use keystone_core::{StorageError, StoreResult};

/// A parsed option assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    /// Acquire or release exclusive mode for the issuing session
    Exclusive(bool),
    /// Enable or bypass the result cache
    OptimizeReuseResults(bool),
}

impl Setting {
    /// Parse `name = value`. Names are case-insensitive; values are
    /// `TRUE`, `FALSE`, `1` or `0`.
    pub fn parse(name: &str, value: &str) -> StoreResult<Self> {
        let invalid = || StorageError::InvalidSetting {
            name: name.to_string(),
            value: value.to_string(),
        };
        let flag = parse_bool(value).ok_or_else(invalid)?;
        match name.trim().to_ascii_uppercase().as_str() {
            "EXCLUSIVE" => Ok(Setting::Exclusive(flag)),
            "OPTIMIZE_REUSE_RESULTS" => Ok(Setting::OptimizeReuseResults(flag)),
            _ => Err(invalid()),
        }
    }

    /// Canonical option name.
    pub fn name(&self) -> &'static str {
        match self {
            Setting::Exclusive(_) => "EXCLUSIVE",
            Setting::OptimizeReuseResults(_) => "OPTIMIZE_REUSE_RESULTS",
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Setting::Exclusive(v) | Setting::OptimizeReuseResults(v) => *v,
        };
        write!(f, "{} {}", self.name(), if value { "TRUE" } else { "FALSE" })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_uppercase().as_str() {
        "TRUE" | "1" => Some(true),
        "FALSE" | "0" => Some(false),
        _ => None,
    }
}
