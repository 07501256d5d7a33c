use std::fmt;

use crate::error::PreflightError;

pub const MARKER_VAR: &str = "CALLED_FROM_RUN";

pub const MIN_RUNTIME_VERSION: RuntimeVersion = RuntimeVersion {
    major: 1,
    minor: 70,
    patch: 0,
};

// Recorded by build.rs.
pub const BUILD_RUNTIME_VERSION: &str = env!("DATAGEN_RUNTIME_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl RuntimeVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        let token = raw
            .split_whitespace()
            .find(|t| t.chars().next().map_or(false, |c| c.is_ascii_digit()))?;
        let core = token.split(['-', '+']).next().unwrap_or(token);
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

pub fn check_runtime_version(found: &str, minimum: RuntimeVersion) -> Result<(), PreflightError> {
    let parsed =
        RuntimeVersion::parse(found).ok_or_else(|| PreflightError::UnknownRuntime(found.to_string()))?;
    if parsed < minimum {
        return Err(PreflightError::UnsupportedRuntime {
            found: parsed,
            minimum,
        });
    }
    Ok(())
}

pub fn check_marker(lookup: &dyn Fn(&str) -> Option<String>) -> Result<(), PreflightError> {
    match lookup(MARKER_VAR) {
        Some(_) => Ok(()),
        None => Err(PreflightError::MissingMarker(MARKER_VAR)),
    }
}

pub fn preflight(lookup: &dyn Fn(&str) -> Option<String>) -> Result<(), PreflightError> {
    preflight_with_runtime(BUILD_RUNTIME_VERSION, lookup)
}

pub fn preflight_with_runtime(
    runtime: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), PreflightError> {
    check_runtime_version(runtime, MIN_RUNTIME_VERSION)?;
    check_marker(lookup)?;
    tracing::debug!(runtime, "preflight passed");
    Ok(())
}
