//! Error types for configuration loading

use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("secret '{key}' not found in {path}")]
    SecretNotFound { key: String, path: PathBuf },

    /// `!include` pointed at something that is not a usable path
    #[error("invalid include '{path}' in {source_file}: {reason}")]
    InvalidInclude {
        path: String,
        source_file: PathBuf,
        reason: String,
    },

    /// The chain lists every file from the outermost include inwards
    #[error("circular include of {path} (via {})", display_chain(.chain))]
    CircularInclude { path: PathBuf, chain: Vec<PathBuf> },

    #[error("environment variable '{var}' not set and no default given")]
    EnvVarNotFound { var: String },

    /// A tag argument had the wrong shape
    #[error("invalid argument for {tag}: {reason}")]
    InvalidTag { tag: String, reason: String },
}

fn display_chain(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
