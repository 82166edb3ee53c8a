//! Event types published by the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Value;

/// Trait for typed event data
pub trait EventData: Clone + Send + Sync + 'static {
    /// The event type string for this data type
    fn event_type() -> &'static str;
}

/// Event type identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType(String);

impl EventType {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Special event type that matches all events
    pub fn match_all() -> Self {
        Self("*".to_string())
    }

    pub fn is_match_all(&self) -> bool {
        self.0 == "*"
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event as delivered to bus subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    pub event_type: EventType,
    pub data: T,
    pub time_fired: DateTime<Utc>,
}

impl<T> Event<T> {
    pub fn new(event_type: impl Into<EventType>, data: T) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            time_fired: Utc::now(),
        }
    }
}

impl<T: EventData> Event<T> {
    pub fn typed(data: T) -> Self {
        Self::new(T::event_type(), data)
    }
}

/// Standard event types fired by the engine
pub mod events {
    use super::*;

    /// A status commit went through the worker queue
    pub const STATUS_CHANGED: &str = "status_changed";

    /// A program's active condition turned true
    pub const PROGRAM_ACTIVATED: &str = "program_activated";

    /// A program's active condition turned false
    pub const PROGRAM_DEACTIVATED: &str = "program_deactivated";

    /// Data for STATUS_CHANGED events
    ///
    /// `old == new` when the commit was forced with an unchanged value.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StatusChangedData {
        pub object: String,
        pub old: Value,
        pub new: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub program: Option<String>,
    }

    impl EventData for StatusChangedData {
        fn event_type() -> &'static str {
            STATUS_CHANGED
        }
    }

    /// Data for PROGRAM_ACTIVATED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ProgramActivatedData {
        pub program: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub trigger: Option<String>,
    }

    impl EventData for ProgramActivatedData {
        fn event_type() -> &'static str {
            PROGRAM_ACTIVATED
        }
    }

    /// Data for PROGRAM_DEACTIVATED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ProgramDeactivatedData {
        pub program: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub trigger: Option<String>,
    }

    impl EventData for ProgramDeactivatedData {
        fn event_type() -> &'static str {
            PROGRAM_DEACTIVATED
        }
    }
}
