//! Automation Engine
//!
//! Reactive automation over named status objects. Sensors mirror the
//! outside world, actuators are driven by programs, and every actuator
//! arbitrates between the programs that want to control it.
//!
//! # Architecture
//!
//! ```text
//! SENSOR CHANGE → PROGRAM TRIGGERS → CONDITIONS → ACTIONS → ACTUATOR STACK
//! ```
//!
//! - **Status objects**: typed values with change/safety delays and history
//! - **Expressions**: callable trees that read objects and perform actions
//! - **Programs**: conditions plus actions, re-evaluated when a trigger changes
//! - **Arbitration**: the highest-priority active program wins an actuator
//!
//! # Key Types
//!
//! - [`System`] - Owns objects, programs and the runtime behind them
//! - [`StatusObject`] - A sensor or an actuator
//! - [`Program`] - A prioritized rule
//! - [`Expr`] - An expression node
//! - [`SystemConfig`] - Declarative description of a whole system

mod actuator;
pub mod config;
mod context;
mod error;
pub mod expr;
mod interpolate;
mod program;
mod registry;
mod snapshot;
mod status;
mod system;

pub use config::{
    ActuatorConfig, ExprConfig, InterpolationConfig, ObjectConfig, ProgramConfig, SensorConfig,
    SystemConfig, SystemSettings,
};
pub use error::{EngineError, EngineResult, EvalError, EvalResult};
pub use expr::{EvalContext, Expr, ExprKind, NativeFn, Operand};
pub use interpolate::Interpolation;
pub use program::{Conditions, Program, ProgramSpec};
pub use registry::Entity;
pub use snapshot::{ProgramSnapshot, StatusObjectSnapshot, SystemSnapshot};
pub use status::{
    Listener, ListenerId, ObjectSettings, Role, StatusChange, StatusHook, StatusObject,
};
pub use system::{ObjectSpec, System};

pub use automate_core::{DelayMode, ObjectName, Value, ValueKind};
