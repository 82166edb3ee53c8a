//! YAML configuration loading for Automate
//!
//! Configuration files are plain YAML plus three tags:
//!
//! - `!include path` - Another file's document, relative to the including file
//! - `!env_var NAME [default]` - An environment variable
//! - `!secret key` - A value from `secrets.yaml` in the configuration directory
//!
//! The result is a tag-free [`Value`] ready to be deserialized into the
//! engine's configuration types.
//!
//! # Example
//!
//! ```ignore
//! use automate_config::load_yaml;
//!
//! let document = load_yaml("/etc/automate", "automate.yaml")?;
//! ```

mod error;
mod loader;
mod secrets;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, load_yaml_string, YamlLoader};
pub use secrets::{Secrets, SECRETS_FILE};

pub use serde_yaml::Value;
