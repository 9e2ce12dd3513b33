//! Configuration models for astack.
//!
//! The CLI reads everything it needs from one TOML file: where the array
//! store lives, how the run behaves, and which built-in functions to apply.

use super::{DType, Kwargs};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Top-level configuration for astack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Array store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Run behavior
    #[serde(default)]
    pub run: RunConfig,

    /// Functions to apply, in declaration order
    #[serde(default)]
    pub functions: Vec<FunctionConfig>,
}

/// Array store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store directory (supports ${ENV_VAR} expansion)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Chunk length hint recorded on newly created arrays
    #[serde(default = "default_chunk_len")]
    pub chunk_len: u64,

    /// Growth bound for newly created arrays (unbounded when absent)
    #[serde(default)]
    pub max_len: Option<u64>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("astack_store")
}

fn default_chunk_len() -> u64 {
    1024
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            chunk_len: default_chunk_len(),
            max_len: None,
        }
    }
}

/// Run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Resume existing arrays (true) or overwrite them (false)
    #[serde(default = "default_true")]
    pub append: bool,

    /// Show a progress bar
    #[serde(default = "default_true")]
    pub progress: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            append: true,
            progress: true,
        }
    }
}

/// One function definition: a built-in function and its output array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// Output array name
    pub name: String,

    /// Built-in function to apply (see `astack example`)
    pub function: String,

    /// Output element type (e.g. "float64", "uint32", "str16")
    pub dtype: DType,

    /// Trailing shape of each output element
    #[serde(default)]
    pub shape: Vec<usize>,

    /// Fixed keyword arguments
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })
    }

    /// Store directory with environment variables expanded.
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(expand_env_vars(&self.store.path.to_string_lossy()))
    }

    /// Check the function list: at least one entry, unique output names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.functions.is_empty() {
            return Err(ConfigError::NoFunctions);
        }

        let mut seen = HashSet::new();
        for function in &self.functions {
            if !seen.insert(function.name.as_str()) {
                return Err(ConfigError::DuplicateOutput(function.name.clone()));
            }
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return result;
    };

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("No [[functions]] defined")]
    NoFunctions,

    #[error("Output '{0}' is defined more than once")]
    DuplicateOutput(String),

    #[error("Unknown function '{function}' for output '{output}'")]
    UnknownFunction { output: String, function: String },

    #[error("Invalid function definition for output '{output}': {reason}")]
    InvalidFunction { output: String, reason: String },
}
