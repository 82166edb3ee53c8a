//! YAML loader with custom tag support
//!
//! - `!include path` - Replace the node with another file's document
//! - `!env_var NAME [default]` - Environment variable, parsed as a YAML scalar
//! - `!secret key` - Value from `secrets.yaml`

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

pub struct YamlLoader {
    /// Base directory for top-level relative paths
    config_dir: PathBuf,
    secrets: Secrets,
    /// Files currently being loaded, outermost first
    include_stack: Vec<PathBuf>,
}

impl YamlLoader {
    /// Create a loader, reading `secrets.yaml` from `config_dir`
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            include_stack: Vec::new(),
        }
    }

    /// Load a file and resolve every tag in it
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.resolve_path(path.as_ref());
        let key = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        if self.include_stack.contains(&key) {
            return Err(ConfigError::CircularInclude {
                path,
                chain: self.include_stack.clone(),
            });
        }
        debug!(path = %path.display(), depth = self.include_stack.len(), "Loading YAML file");

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.include_stack.push(key);
        let result = self.load_string(&content, &path);
        self.include_stack.pop();
        result
    }

    /// Parse `content` as if it were read from `source_path`
    pub fn load_string(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value = serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source,
        })?;
        self.process_value(value, source_path)
    }

    fn process_value(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.process_tagged(*tagged, source_path),
            Value::Mapping(map) => {
                let mut result = serde_yaml::Mapping::with_capacity(map.len());
                for (k, v) in map {
                    let k = self.process_value(k, source_path)?;
                    let v = self.process_value(v, source_path)?;
                    result.insert(k, v);
                }
                Ok(Value::Mapping(result))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|v| self.process_value(v, source_path))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn process_tagged(&mut self, tagged: TaggedValue, source_path: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(tag = %tag, "Processing tag");

        match tag.as_str() {
            "!include" => self.process_include(&tagged.value, source_path),
            "!env_var" => process_env_var(&tagged.value),
            "!secret" => self.process_secret(&tagged.value),
            _ => {
                warn!(tag = %tag, file = %source_path.display(), "Unknown YAML tag kept as is");
                let value = self.process_value(tagged.value, source_path)?;
                Ok(Value::Tagged(Box::new(TaggedValue {
                    tag: tagged.tag,
                    value,
                })))
            }
        }
    }

    fn process_include(&mut self, value: &Value, source_path: &Path) -> ConfigResult<Value> {
        let Value::String(name) = value else {
            return Err(ConfigError::InvalidInclude {
                path: format!("{:?}", value),
                source_file: source_path.to_path_buf(),
                reason: "path must be a string".to_string(),
            });
        };
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidInclude {
                path: name.clone(),
                source_file: source_path.to_path_buf(),
                reason: "path is empty".to_string(),
            });
        }

        // Relative to the including file, not the working directory
        let base = source_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(self.config_dir.as_path());
        let target = if Path::new(name).is_absolute() {
            PathBuf::from(name)
        } else {
            base.join(name)
        };
        debug!(from = %source_path.display(), include = %target.display(), "Including file");
        self.load_file(target)
    }

    fn process_secret(&self, value: &Value) -> ConfigResult<Value> {
        let Value::String(key) = value else {
            return Err(ConfigError::InvalidTag {
                tag: "!secret".to_string(),
                reason: "key must be a string".to_string(),
            });
        };
        let secret = self.secrets.get(key)?;
        debug!(key = %key, "Substituted secret");
        Ok(secret.clone())
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }

    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

/// `!env_var NAME` or `!env_var NAME default`
fn process_env_var(value: &Value) -> ConfigResult<Value> {
    let Value::String(spec) = value else {
        return Err(ConfigError::InvalidTag {
            tag: "!env_var".to_string(),
            reason: "expected a variable name and an optional default".to_string(),
        });
    };
    let spec = spec.trim();
    let (var, default) = match spec.split_once(char::is_whitespace) {
        Some((var, default)) => (var, Some(default.trim())),
        None => (spec, None),
    };
    if var.is_empty() {
        return Err(ConfigError::InvalidTag {
            tag: "!env_var".to_string(),
            reason: "variable name is empty".to_string(),
        });
    }

    let raw = match std::env::var(var) {
        Ok(v) => {
            debug!(var = %var, "Substituted environment variable");
            v
        }
        Err(_) => match default {
            Some(d) => {
                debug!(var = %var, "Environment variable not set, using default");
                d.to_string()
            }
            None => return Err(ConfigError::EnvVarNotFound { var: var.to_string() }),
        },
    };
    Ok(scalar(&raw))
}

/// Parse text the way YAML would type a plain scalar; anything else stays a string
fn scalar(raw: &str) -> Value {
    match serde_yaml::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_))) => v,
        _ => Value::String(raw.to_string()),
    }
}

/// Load a file from `config_dir` with full tag processing
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    let mut loader = YamlLoader::new(config_dir)?;
    loader.load_file(file)
}

/// Load YAML text; includes resolve relative to `config_dir`
pub fn load_yaml_string(config_dir: impl Into<PathBuf>, content: &str) -> ConfigResult<Value> {
    let mut loader = YamlLoader::new(config_dir)?;
    let source = loader.config_dir().join("<string>");
    loader.load_string(content, &source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn get<'a>(value: &'a Value, key: &str) -> &'a Value {
        value.get(key).unwrap_or_else(|| panic!("missing key {key}"))
    }

    #[test]
    fn test_load_simple_yaml() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "automate.yaml",
            "sensors:\n  motion: { kind: bool }\n",
        );

        let value = load_yaml(dir.path(), "automate.yaml").unwrap();
        assert!(get(get(&value, "sensors"), "motion").is_mapping());
    }

    #[test]
    fn test_include_is_relative_to_the_including_file() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "rooms/hall/programs.yaml", "night: { priority: 2 }\n");
        write_file(dir.path(), "rooms/hall.yaml", "programs: !include hall/programs.yaml\n");
        write_file(dir.path(), "automate.yaml", "hall: !include rooms/hall.yaml\n");

        let value = load_yaml(dir.path(), "automate.yaml").unwrap();
        let night = get(get(get(&value, "hall"), "programs"), "night");
        assert_eq!(get(night, "priority").as_i64(), Some(2));
    }

    #[test]
    fn test_same_file_may_be_included_twice() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "common.yaml", "kind: bool\n");
        write_file(
            dir.path(),
            "automate.yaml",
            "a: !include common.yaml\nb: !include common.yaml\n",
        );

        let value = load_yaml(dir.path(), "automate.yaml").unwrap();
        assert_eq!(get(get(&value, "a"), "kind"), get(get(&value, "b"), "kind"));
    }

    #[test]
    fn test_circular_include_reports_the_chain() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.yaml", "b: !include b.yaml\n");
        write_file(dir.path(), "b.yaml", "a: !include a.yaml\n");

        let err = load_yaml(dir.path(), "a.yaml").unwrap_err();
        let ConfigError::CircularInclude { path, chain } = &err else {
            panic!("expected a circular include, got {err}");
        };
        assert!(path.ends_with("a.yaml"));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_missing_include_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "automate.yaml", "x: !include nowhere.yaml\n");
        assert!(matches!(
            load_yaml(dir.path(), "automate.yaml"),
            Err(ConfigError::ReadFile { .. })
        ));
    }

    #[test]
    fn test_non_string_include_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "automate.yaml", "x: !include [a, b]\n");
        assert!(matches!(
            load_yaml(dir.path(), "automate.yaml"),
            Err(ConfigError::InvalidInclude { .. })
        ));
    }

    #[test]
    fn test_secret_keeps_its_type() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "secrets.yaml", "threshold: 40\n");
        write_file(dir.path(), "automate.yaml", "limit: !secret threshold\n");

        let value = load_yaml(dir.path(), "automate.yaml").unwrap();
        assert_eq!(get(&value, "limit").as_i64(), Some(40));
    }

    #[test]
    fn test_missing_secret() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "automate.yaml", "password: !secret nonexistent\n");
        assert!(matches!(
            load_yaml(dir.path(), "automate.yaml"),
            Err(ConfigError::SecretNotFound { .. })
        ));
    }

    #[test]
    fn test_env_var_with_and_without_default() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("AUTOMATE_TEST_DELAY", "2.5");
        std::env::remove_var("AUTOMATE_TEST_UNSET");
        let value = load_yaml_string(
            dir.path(),
            "delay: !env_var AUTOMATE_TEST_DELAY\n\
             fallback: !env_var AUTOMATE_TEST_UNSET kitchen light\n\
             flag: !env_var AUTOMATE_TEST_UNSET true\n",
        )
        .unwrap();
        std::env::remove_var("AUTOMATE_TEST_DELAY");

        assert_eq!(get(&value, "delay").as_f64(), Some(2.5));
        assert_eq!(get(&value, "fallback").as_str(), Some("kitchen light"));
        assert_eq!(get(&value, "flag").as_bool(), Some(true));
    }

    #[test]
    fn test_env_var_without_default_must_exist() {
        let dir = TempDir::new().unwrap();
        std::env::remove_var("AUTOMATE_TEST_MISSING");
        assert!(matches!(
            load_yaml_string(dir.path(), "x: !env_var AUTOMATE_TEST_MISSING\n"),
            Err(ConfigError::EnvVarNotFound { .. })
        ));
    }

    #[test]
    fn test_unknown_tag_is_kept() {
        let dir = TempDir::new().unwrap();
        let value = load_yaml_string(dir.path(), "x: !custom 5\n").unwrap();
        assert!(matches!(get(&value, "x"), Value::Tagged(_)));
    }
}
