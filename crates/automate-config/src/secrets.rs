//! `secrets.yaml` next to the main configuration file

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SECRETS_FILE: &str = "secrets.yaml";

/// Values substituted for `!secret key`
///
/// Values keep their YAML type, so a secret threshold stays a number.
#[derive(Debug, Clone)]
pub struct Secrets {
    values: Mapping,
    path: PathBuf,
}

impl Secrets {
    /// Load `secrets.yaml` from `config_dir`; a missing file is an empty store
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let path = config_dir.join(SECRETS_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "No secrets file");
            return Ok(Self {
                values: Mapping::new(),
                path,
            });
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;
        let values = match serde_yaml::from_str::<Value>(&content) {
            Ok(Value::Mapping(values)) => values,
            Ok(Value::Null) => Mapping::new(),
            Ok(_) => {
                return Err(ConfigError::InvalidTag {
                    tag: "!secret".to_string(),
                    reason: format!("{} must be a mapping", path.display()),
                })
            }
            Err(source) => {
                return Err(ConfigError::ParseYaml {
                    path: path.clone(),
                    source,
                })
            }
        };

        debug!(path = %path.display(), count = values.len(), "Loaded secrets");
        Ok(Self { values, path })
    }

    /// An in-memory store, mostly for tests
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (Value::String(k.into()), v.into()))
                .collect(),
            path: PathBuf::from(SECRETS_FILE),
        }
    }

    pub fn get(&self, key: &str) -> ConfigResult<&Value> {
        self.values.get(key).ok_or_else(|| ConfigError::SecretNotFound {
            key: key.to_string(),
            path: self.path.clone(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for Secrets {
    fn default() -> Self {
        Self::from_pairs(Vec::<(String, Value)>::new())
    }
}
