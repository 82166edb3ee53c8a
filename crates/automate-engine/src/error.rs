//! Engine error types

use automate_core::{NameError, ValueError};
use thiserror::Error;

/// Errors surfaced by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// A non-slave actuator was asked to change by a program outside its stack
    #[error("{program} may not set the status of {object}: not in its program stack")]
    Unauthorized { object: String, program: String },

    /// A value could not be coerced to the object's declared kind
    #[error("invalid status for {object}: {source}")]
    Validation {
        object: String,
        #[source]
        source: ValueError,
    },

    /// Dependencies or status were requested before the system was live
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("unknown object: {0}")]
    UnknownObject(String),

    #[error("name already registered: {0}")]
    DuplicateName(String),

    #[error(transparent)]
    InvalidName(#[from] NameError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Evaluation(#[from] EvalError),

    #[error("worker queue unavailable: {0}")]
    WorkerStopped(#[from] automate_worker::WorkerError),

    #[error("failed to start timer runtime: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while evaluating an expression
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("expression is not attached to a running system")]
    NotReady,

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("{kind} expects {expected} argument(s), got {got}")]
    Arity {
        kind: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("{0} is not a status object")]
    NotAnObject(String),

    #[error("set_status: {targets} target(s) but {values} value(s)")]
    LengthMismatch { targets: usize, values: usize },

    #[error("switch selector {0} is out of range")]
    NoSuchCase(String),

    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("regular expression has no group {0}")]
    NoSuchGroup(usize),

    #[error("invalid duration: {0}")]
    Duration(String),

    #[error("{0}")]
    Failed(String),
}

/// Result type for expression evaluation
pub type EvalResult<T> = Result<T, EvalError>;
