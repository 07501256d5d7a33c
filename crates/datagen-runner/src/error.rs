use std::path::PathBuf;
use thiserror::Error;

use crate::preflight::RuntimeVersion;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("runtime {found} is too old: {minimum} or later is required")]
    UnsupportedRuntime {
        found: RuntimeVersion,
        minimum: RuntimeVersion,
    },
    #[error("could not determine runtime version from '{0}'")]
    UnknownRuntime(String),
    #[error("Please use run.sh to call me, thanks! ({0} is not set)")]
    MissingMarker(&'static str),
}

#[derive(Debug, Default, Error)]
#[error("{}", render_config_problems(.missing, .malformed))]
pub struct ConfigError {
    pub missing: Vec<&'static str>,
    pub malformed: Vec<(&'static str, String)>,
}

impl ConfigError {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.malformed.is_empty()
    }
}

fn render_config_problems(missing: &[&'static str], malformed: &[(&'static str, String)]) -> String {
    let mut lines = vec!["environment is missing required configuration:".to_string()];
    for name in missing {
        lines.push(format!("  - {} (not set)", name));
    }
    for (name, reason) in malformed {
        lines.push(format!("  - {} ({})", name, reason));
    }
    lines.join("\n")
}

#[derive(Debug, Error)]
pub enum DatagenError {
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to read settings {path}: {source}")]
    SettingsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings {path}: {reason}")]
    Settings { path: PathBuf, reason: String },
    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Non zero exit while running {command} generating data (scale factor {scale_factor}, status {status})")]
    JobFailed {
        scale_factor: u32,
        command: String,
        status: String,
    },
}

pub type Result<T> = std::result::Result<T, DatagenError>;
