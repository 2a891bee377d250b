use std::{fs, io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// How much tool output gets echoed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    #[default]
    Normal,
    Debug,
}

impl Verbosity {
    pub fn is_debug(self) -> bool {
        self == Self::Debug
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    #[serde(rename = "tool_name", alias = "executable")]
    pub executable: String,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub wordlist: Option<String>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub output_args: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Position of a tool in the pipeline. Tools without an explicit order run
/// after every ordered group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OrderKey {
    Explicit(i64),
    Unordered,
}

impl std::fmt::Display for OrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit(order) => write!(f, "{order}"),
            Self::Unordered => write!(f, "unordered"),
        }
    }
}

impl ToolSpec {
    pub fn new(name: &str, executable: &str) -> Self {
        Self {
            name: name.to_string(),
            executable: executable.to_string(),
            order: None,
            arguments: Vec::new(),
            wordlist: None,
            output_file: None,
            output_args: None,
            timeout_secs: None,
        }
    }

    pub fn order_key(&self) -> OrderKey {
        self.order.map_or(OrderKey::Unordered, OrderKey::Explicit)
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("loading config from {:?}", path);
        let raw = fs::read_to_string(path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
            _ => ConfigError::Read {
                path: path.to_path_buf(),
                source,
            },
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::Timeout(0));
        }

        for (index, tool) in self.tools.iter().enumerate() {
            let invalid = |reason: &str| ConfigError::Invalid {
                index,
                reason: reason.to_string(),
            };

            if tool.name.trim().is_empty() {
                return Err(invalid("name is empty"));
            }
            if tool.executable.trim().is_empty() {
                return Err(invalid("tool_name is empty"));
            }
            if tool.timeout_secs == Some(0) {
                return Err(invalid("timeout_secs must be positive"));
            }
            if tool.output_args.is_some() && tool.output_file.is_none() {
                warn!("{}: output_args given without output_file, ignoring", tool.name);
            }
        }

        if self.tools.is_empty() {
            warn!("No tools configured");
        }
        Ok(())
    }

    pub fn timeout_for(&self, tool: &ToolSpec) -> Duration {
        tool.timeout_secs
            .or(self.timeout_secs)
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs)
    }
}
