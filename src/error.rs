use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostsError {
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),

    #[error("permission denied on {path}: {reason}")]
    PermissionDenied { path: PathBuf, reason: String },

    #[error("hosts file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("error updating hosts file: {0}")]
    Io(#[from] io::Error),
}

impl HostsError {
    /// Classifies an I/O error raised while touching `path`.
    pub fn from_io(err: io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::FileNotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_path_buf(),
                reason: err.to_string(),
            },
            _ => Self::Io(err),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("missing variable '{0}'")]
    MissingVariable(String),

    #[error("unbalanced brace at offset {offset} in {template:?}")]
    Unbalanced { template: String, offset: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("could not read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("error parsing config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("pipeline timeout_secs must be positive, got {0}")]
    Timeout(u64),

    #[error("invalid tool definition #{index}: {reason}")]
    Invalid { index: usize, reason: String },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("aborted after hosts update failed: {0}")]
    Aborted(#[source] HostsError),
}
