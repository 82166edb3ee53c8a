//! Core types for Automate
//!
//! This crate provides the fundamental types shared by the engine crates:
//! [`Value`], [`ObjectName`], ids, delay modes, bounded history and the
//! payloads of engine events.

mod event;
mod history;
mod ids;
mod mode;
mod name;
pub mod sync;
mod value;

pub use event::{events, Event, EventData, EventType};
pub use history::{History, HistoryEntry, DEFAULT_HISTORY_CAPACITY};
pub use ids::{ObjectId, ProgramId, Sequence};
pub use mode::{DelayMode, Direction};
pub use name::{NameError, ObjectName};
pub use value::{Value, ValueError, ValueKind, ValueResult};

/// Priority of the default program every actuator starts with
pub const DEFAULT_PROGRAM_PRIORITY: f64 = 0.0;

/// Priority of a program that does not set one
pub const DEFAULT_PRIORITY: f64 = 1.0;
