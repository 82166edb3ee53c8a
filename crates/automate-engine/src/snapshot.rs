//! Read-only views for persistence and UI collaborators

use automate_core::{HistoryEntry, Value, ValueKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::program::Program;
use crate::status::{Role, StatusObject};

/// One status object at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusObjectSnapshot {
    pub name: String,
    pub role: Role,
    pub kind: ValueKind,
    pub status: Value,
    pub default: Value,
    pub changing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_scheduled_action: Option<DateTime<Utc>>,
    pub history: Vec<HistoryEntry>,
    /// Actuators: program names, lowest priority first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub program_stack: Vec<String>,
    pub slave: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl From<&StatusObject> for StatusObjectSnapshot {
    fn from(object: &StatusObject) -> Self {
        let settings = object.settings();
        Self {
            name: object.name().to_string(),
            role: object.role(),
            kind: object.kind(),
            status: object.status(),
            default: object.default_value().clone(),
            changing: object.changing(),
            next_scheduled_action: object.next_scheduled_action(),
            history: object.history(),
            program_stack: object.program_stack(),
            slave: object.is_slave(),
            description: settings.description,
            tags: settings.tags,
        }
    }
}

/// One program at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSnapshot {
    pub name: String,
    pub priority: f64,
    pub active: bool,
    pub actual_triggers: Vec<String>,
    pub actual_targets: Vec<String>,
    pub active_condition: String,
    pub update_condition: String,
    pub on_activate: String,
    pub on_update: String,
    pub on_deactivate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl From<&Program> for ProgramSnapshot {
    fn from(program: &Program) -> Self {
        let conditions = program.conditions();
        let names = |objects: Vec<std::sync::Arc<StatusObject>>| -> Vec<String> {
            objects.iter().map(|o| o.name().to_string()).collect()
        };
        Self {
            name: program.name().to_string(),
            priority: program.priority(),
            active: program.is_active(),
            actual_triggers: names(program.actual_triggers()),
            actual_targets: names(program.actual_targets()),
            active_condition: conditions.active_condition.to_string(),
            update_condition: conditions.update_condition.to_string(),
            on_activate: conditions.on_activate.to_string(),
            on_update: conditions.on_update.to_string(),
            on_deactivate: conditions.on_deactivate.to_string(),
            description: program.description(),
            tags: program.tags(),
        }
    }
}

/// Everything in a system, in creation order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub objects: Vec<StatusObjectSnapshot>,
    pub programs: Vec<ProgramSnapshot>,
}

impl SystemSnapshot {
    pub fn object(&self, name: &str) -> Option<&StatusObjectSnapshot> {
        self.objects.iter().find(|o| o.name == name)
    }

    pub fn program(&self, name: &str) -> Option<&ProgramSnapshot> {
        self.programs.iter().find(|p| p.name == name)
    }
}
