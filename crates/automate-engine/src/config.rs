//! Configuration schema for a whole system
//!
//! ```yaml
//! settings:
//!   history_capacity: 50
//! sensors:
//!   motion: { kind: bool, reset_delay: 30 }
//!   doorbell: { kind: bool, event: true }
//! actuators:
//!   lamp: { kind: bool, safety_delay: "00:00:02" }
//!   blinds: { kind: float, interpolate: { slave: motor, change_frequency: 20, change_time: 5 } }
//!   motor: { kind: float, slave: true }
//! programs:
//!   lights_on_motion:
//!     active_condition: motion
//!     on_activate: { set_status: [lamp, true] }
//! ```
//!
//! Expressions: a bare string is a name, any other scalar a literal, a
//! sequence a list, and a single-key mapping `{op: args}` a node. `args` is
//! a sequence of positional operands, a single operand, or a mapping of named
//! operands with an optional `args:` sequence. `{literal: x}` is always a
//! literal.

use automate_core::{DelayMode, Value, ValueKind, DEFAULT_PRIORITY, DEFAULT_PROGRAM_PRIORITY};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::expr::{Expr, ExprKind, Operand};
use crate::interpolate::Interpolation;
use crate::program::ProgramSpec;
use crate::status::ObjectSettings;

/// System-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    /// History entries kept per object
    pub history_capacity: usize,

    /// Commits closer together than this overwrite the newest history entry
    #[serde(with = "duration_serde")]
    pub history_min_interval: Duration,

    /// Priority of every actuator's default program
    pub default_program_priority: f64,

    /// Threads driving delay timers
    pub timer_threads: usize,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            history_capacity: automate_core::DEFAULT_HISTORY_CAPACITY,
            history_min_interval: Duration::ZERO,
            default_program_priority: DEFAULT_PROGRAM_PRIORITY,
            timer_threads: 2,
        }
    }
}

/// Settings shared by sensors and actuators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectConfig {
    pub kind: ValueKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(with = "duration_serde")]
    pub safety_delay: Duration,
    pub safety_mode: DelayMode,

    #[serde(with = "duration_serde")]
    pub change_delay: Duration,
    pub change_mode: DelayMode,

    pub silent: bool,
    pub debug: bool,
    pub description: String,
    pub tags: Vec<String>,
}

impl ObjectConfig {
    pub fn settings(&self) -> ObjectSettings {
        ObjectSettings {
            safety_delay: self.safety_delay,
            safety_mode: self.safety_mode,
            change_delay: self.change_delay,
            change_mode: self.change_mode,
            silent: self.silent,
            debug: self.debug,
            description: self.description.clone(),
            tags: self.tags.clone(),
            ..ObjectSettings::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    #[serde(flatten)]
    pub object: ObjectConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_min: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_max: Option<f64>,

    /// Return to the default this long after a non-default value
    #[serde(with = "duration_serde")]
    pub reset_delay: Duration,

    /// Bool sensor that drops back to false right after every true
    pub event: bool,
}

impl SensorConfig {
    pub fn settings(&self) -> ObjectSettings {
        ObjectSettings {
            value_min: self.value_min,
            value_max: self.value_max,
            reset_delay: self.reset_delay,
            ..self.object.settings()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    #[serde(flatten)]
    pub object: ObjectConfig,

    /// Accept changes from anyone instead of arbitrating
    pub slave: bool,

    /// Priority overrides by program name
    pub priorities: IndexMap<String, f64>,

    /// Walk a slave actuator towards this actuator's status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpolate: Option<InterpolationConfig>,
}

/// ```yaml
/// interpolate: { slave: servo, change_frequency: 20, change_time: 2 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolationConfig {
    pub slave: String,

    /// Steps per second
    pub change_frequency: f64,

    /// Units per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,

    /// Duration of every change; exclusive with `speed`
    #[serde(default, with = "opt_duration_serde", skip_serializing_if = "Option::is_none")]
    pub change_time: Option<Duration>,
}

impl InterpolationConfig {
    pub fn mode(&self) -> EngineResult<Interpolation> {
        match (self.speed, self.change_time) {
            (Some(speed), None) => Ok(Interpolation::ConstantSpeed { speed }),
            (None, Some(change_time)) => Ok(Interpolation::ConstantTime { change_time }),
            _ => Err(EngineError::InvalidConfig(format!(
                "interpolation onto {} needs exactly one of speed and change_time",
                self.slave
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_condition: Option<ExprConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_condition: Option<ExprConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_activate: Option<ExprConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_update: Option<ExprConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_deactivate: Option<ExprConfig>,

    pub triggers: Vec<String>,
    pub exclude_triggers: Vec<String>,
    pub targets: Vec<String>,

    pub description: String,
    pub tags: Vec<String>,
    pub silent: bool,
    pub debug: bool,
}

impl ProgramConfig {
    /// Build a program description; names stay unresolved until attach
    pub fn to_spec(&self, name: &str) -> EngineResult<ProgramSpec> {
        let mut spec = ProgramSpec::new(name)
            .priority(self.priority.unwrap_or(DEFAULT_PRIORITY))
            .triggers(self.triggers.clone())
            .exclude_triggers(self.exclude_triggers.clone())
            .targets(self.targets.clone())
            .description(self.description.clone())
            .tags(self.tags.clone())
            .silent(self.silent)
            .debug(self.debug);
        let parsed = |e: &Option<ExprConfig>| -> EngineResult<Option<Arc<Expr>>> {
            e.as_ref().map(ExprConfig::to_expr).transpose()
        };
        if let Some(e) = parsed(&self.active_condition)? {
            spec = spec.active_condition(e);
        }
        if let Some(e) = parsed(&self.update_condition)? {
            spec = spec.update_condition(e);
        }
        if let Some(e) = parsed(&self.on_activate)? {
            spec = spec.on_activate(e);
        }
        if let Some(e) = parsed(&self.on_update)? {
            spec = spec.on_update(e);
        }
        if let Some(e) = parsed(&self.on_deactivate)? {
            spec = spec.on_deactivate(e);
        }
        Ok(spec)
    }
}

/// An expression as written in configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ExprConfig {
    Name(String),
    Literal(Value),
    List(Vec<ExprConfig>),
    Node {
        op: String,
        args: Vec<ExprConfig>,
        kwargs: IndexMap<String, ExprConfig>,
    },
}

impl ExprConfig {
    pub fn to_operand(&self) -> EngineResult<Operand> {
        match self {
            ExprConfig::Name(name) => Ok(Operand::Name(name.clone())),
            ExprConfig::Literal(v) => Ok(Operand::Literal(v.clone())),
            ExprConfig::List(items) => items
                .iter()
                .map(ExprConfig::to_operand)
                .collect::<EngineResult<Vec<_>>>()
                .map(Operand::List),
            ExprConfig::Node { op, args, kwargs } => {
                let kind = ExprKind::from_name(op).ok_or_else(|| {
                    EngineError::InvalidConfig(format!("unknown expression '{}'", op))
                })?;
                if kind == ExprKind::Func {
                    return Err(EngineError::InvalidConfig(
                        "func nodes can only be built in code".to_string(),
                    ));
                }
                let args = args
                    .iter()
                    .map(ExprConfig::to_operand)
                    .collect::<EngineResult<Vec<_>>>()?;
                let mut named = IndexMap::new();
                for (key, value) in kwargs {
                    named.insert(key.clone(), value.to_operand()?);
                }
                Ok(Operand::Expr(Expr::with_kwargs(kind, args, named)))
            }
        }
    }

    pub fn to_expr(&self) -> EngineResult<Arc<Expr>> {
        Ok(Expr::from_operand(self.to_operand()?))
    }
}

impl TryFrom<serde_yaml::Value> for ExprConfig {
    type Error = String;

    fn try_from(value: serde_yaml::Value) -> Result<Self, Self::Error> {
        use serde_yaml::Value as Yaml;
        match value {
            Yaml::String(s) => Ok(ExprConfig::Name(s)),
            Yaml::Null | Yaml::Bool(_) | Yaml::Number(_) => Ok(ExprConfig::Literal(yaml_literal(&value)?)),
            Yaml::Sequence(items) => items
                .into_iter()
                .map(ExprConfig::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(ExprConfig::List),
            Yaml::Mapping(map) => {
                let mut entries = map.into_iter();
                let (Some((key, body)), None) = (entries.next(), entries.next()) else {
                    return Err("an expression mapping must have exactly one key".to_string());
                };
                let Yaml::String(op) = key else {
                    return Err(format!("expression name must be a string, got {:?}", key));
                };
                if op == "literal" {
                    return Ok(ExprConfig::Literal(yaml_literal(&body)?));
                }
                let (args, kwargs) = node_operands(body)?;
                Ok(ExprConfig::Node { op, args, kwargs })
            }
            Yaml::Tagged(tagged) => Err(format!("unresolved tag {}", tagged.tag)),
        }
    }
}

fn node_operands(
    body: serde_yaml::Value,
) -> Result<(Vec<ExprConfig>, IndexMap<String, ExprConfig>), String> {
    use serde_yaml::Value as Yaml;
    match body {
        Yaml::Null => Ok((Vec::new(), IndexMap::new())),
        Yaml::Sequence(items) => Ok((
            items
                .into_iter()
                .map(ExprConfig::try_from)
                .collect::<Result<_, _>>()?,
            IndexMap::new(),
        )),
        // Named operands, unless this is itself a nested node
        Yaml::Mapping(map) if map.len() != 1 || map.contains_key("args") || !is_node_key(&map) => {
            let mut args = Vec::new();
            let mut kwargs = IndexMap::new();
            for (key, value) in map {
                let Yaml::String(key) = key else {
                    return Err(format!("operand name must be a string, got {:?}", key));
                };
                if key == "args" {
                    match value {
                        Yaml::Sequence(items) => {
                            for item in items {
                                args.push(ExprConfig::try_from(item)?);
                            }
                        }
                        single => args.push(ExprConfig::try_from(single)?),
                    }
                } else {
                    kwargs.insert(key, ExprConfig::try_from(value)?);
                }
            }
            Ok((args, kwargs))
        }
        single => Ok((vec![ExprConfig::try_from(single)?], IndexMap::new())),
    }
}

fn is_node_key(map: &serde_yaml::Mapping) -> bool {
    map.keys().any(|k| {
        k.as_str()
            .is_some_and(|op| op == "literal" || ExprKind::from_name(op).is_some())
    })
}

fn yaml_literal(value: &serde_yaml::Value) -> Result<Value, String> {
    serde_json::to_value(value)
        .map(Value::from)
        .map_err(|e| format!("cannot use {:?} as a value: {}", value, e))
}

impl From<ExprConfig> for serde_yaml::Value {
    fn from(config: ExprConfig) -> Self {
        use serde_yaml::Value as Yaml;
        match config {
            ExprConfig::Name(name) => Yaml::String(name),
            ExprConfig::Literal(Value::Str(s)) => {
                let mut map = serde_yaml::Mapping::new();
                map.insert(Yaml::String("literal".into()), Yaml::String(s));
                Yaml::Mapping(map)
            }
            ExprConfig::Literal(v) => {
                serde_yaml::to_value(serde_json::Value::from(v)).unwrap_or(Yaml::Null)
            }
            ExprConfig::List(items) => Yaml::Sequence(items.into_iter().map(Into::into).collect()),
            ExprConfig::Node { op, args, kwargs } => {
                let body = if kwargs.is_empty() {
                    Yaml::Sequence(args.into_iter().map(Into::into).collect())
                } else {
                    let mut map = serde_yaml::Mapping::new();
                    if !args.is_empty() {
                        map.insert(
                            Yaml::String("args".into()),
                            Yaml::Sequence(args.into_iter().map(Into::into).collect()),
                        );
                    }
                    for (key, value) in kwargs {
                        map.insert(Yaml::String(key), value.into());
                    }
                    Yaml::Mapping(map)
                };
                let mut map = serde_yaml::Mapping::new();
                map.insert(Yaml::String(op), body);
                Yaml::Mapping(map)
            }
        }
    }
}

impl Serialize for ExprConfig {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_yaml::Value::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ExprConfig {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_yaml::Value::deserialize(deserializer)?;
        ExprConfig::try_from(raw).map_err(serde::de::Error::custom)
    }
}

/// A whole system
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub settings: SystemSettings,
    pub sensors: IndexMap<String, SensorConfig>,
    pub actuators: IndexMap<String, ActuatorConfig>,
    pub programs: IndexMap<String, ProgramConfig>,
}

impl SystemConfig {
    pub fn from_yaml_str(text: &str) -> EngineResult<Self> {
        serde_yaml::from_str(text).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }

    /// Build from an already loaded document (tags resolved)
    pub fn from_yaml_value(value: serde_yaml::Value) -> EngineResult<Self> {
        serde_yaml::from_value(value).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }
}

/// Parse `SS`, `MM:SS` or `HH:MM:SS`; plain seconds may be fractional
pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    let whole = |p: &str, what: &str| -> Result<u64, String> {
        p.trim().parse().map_err(|_| format!("invalid {} in {:?}", what, s))
    };
    match parts.as_slice() {
        [secs] => {
            let secs: f64 = secs
                .trim()
                .parse()
                .map_err(|_| format!("invalid seconds in {:?}", s))?;
            Duration::try_from_secs_f64(secs).map_err(|e| format!("{:?}: {}", s, e))
        }
        [mins, secs] => Ok(Duration::from_secs(
            whole(mins, "minutes")? * 60 + whole(secs, "seconds")?,
        )),
        [hours, mins, secs] => Ok(Duration::from_secs(
            whole(hours, "hours")? * 3600 + whole(mins, "minutes")? * 60 + whole(secs, "seconds")?,
        )),
        _ => Err(format!("invalid duration format {:?}", s)),
    }
}

/// Durations as seconds or `HH:MM:SS` strings
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.subsec_nanos() != 0 {
            return serializer.serialize_f64(value.as_secs_f64());
        }
        let secs = value.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;
        serializer.serialize_str(&format!("{:02}:{:02}:{:02}", hours, mins, secs))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => {
                Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
            }
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

/// Optional durations in the same formats
pub(crate) mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Wrapped(#[serde(with = "super::duration_serde")] Duration);

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => super::duration_serde::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(d)| d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_formats() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("0.5").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("02:30").unwrap(), Duration::from_secs(150));
        assert_eq!(parse_duration("01:00:00").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("a:b").is_err());
        assert!(parse_duration("1:2:3:4").is_err());
    }

    #[test]
    fn test_expression_forms() {
        let yaml = r#"
            - lamp
            - 3
            - {literal: lamp}
            - {not: motion}
            - {set_status: [lamp, true]}
            - {set_status: {args: [lamp, 1], force: true}}
            - {anything: }
        "#;
        let parsed: Vec<ExprConfig> = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(parsed[0], ExprConfig::Name("lamp".into()));
        assert_eq!(parsed[1], ExprConfig::Literal(Value::Int(3)));
        assert_eq!(parsed[2], ExprConfig::Literal(Value::Str("lamp".into())));
        assert_eq!(
            parsed[3],
            ExprConfig::Node {
                op: "not".into(),
                args: vec![ExprConfig::Name("motion".into())],
                kwargs: IndexMap::new(),
            }
        );
        let ExprConfig::Node { args, .. } = &parsed[4] else {
            panic!("expected a node");
        };
        assert_eq!(args.len(), 2);
        let ExprConfig::Node { args, kwargs, .. } = &parsed[5] else {
            panic!("expected a node");
        };
        assert_eq!(args.len(), 2);
        assert_eq!(kwargs["force"], ExprConfig::Literal(Value::Bool(true)));
        assert!(matches!(&parsed[6], ExprConfig::Node { args, .. } if args.is_empty()));
    }

    #[test]
    fn test_single_nested_node_is_positional() {
        let parsed: ExprConfig = serde_yaml::from_str("{not: {equal: [a, 1]}}").unwrap();
        let ExprConfig::Node { args, kwargs, .. } = parsed else {
            panic!("expected a node");
        };
        assert!(kwargs.is_empty());
        assert!(matches!(&args[0], ExprConfig::Node { op, .. } if op == "equal"));
    }

    #[test]
    fn test_unknown_expression_is_rejected() {
        let parsed: ExprConfig = serde_yaml::from_str("{frobnicate: [a]}").unwrap();
        assert!(matches!(
            parsed.to_operand(),
            Err(EngineError::InvalidConfig(_))
        ));
        assert!(serde_yaml::from_str::<ExprConfig>("{a: 1, b: 2}").is_err());
    }

    #[test]
    fn test_system_config_defaults() {
        let config = SystemConfig::from_yaml_str(
            r#"
            sensors:
              temp: { kind: float, value_min: -40, value_max: 60, change_delay: 1.5 }
            actuators:
              heater: { kind: bool, safety_delay: "00:00:02", safety_mode: both, priorities: { night: 5 } }
            programs:
              night:
                active_condition: { less: [temp, 18] }
                on_activate: { set_status: [heater, true] }
            "#,
        )
        .unwrap();

        assert_eq!(config.settings, SystemSettings::default());
        let temp = &config.sensors["temp"];
        assert_eq!(temp.object.kind, ValueKind::Float);
        assert_eq!(temp.settings().change_delay, Duration::from_millis(1500));
        assert_eq!(temp.settings().value_min, Some(-40.0));
        let heater = &config.actuators["heater"];
        assert_eq!(heater.object.safety_delay, Duration::from_secs(2));
        assert_eq!(heater.object.safety_mode, DelayMode::Both);
        assert_eq!(heater.priorities["night"], 5.0);
        let spec = config.programs["night"].to_spec("night").unwrap();
        assert_eq!(spec.priority, DEFAULT_PRIORITY);
    }
}

