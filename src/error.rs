//! Unified error types for the vacstand control core.
//!
//! A single `Error` enum that every subsystem can convert into, keeping the
//! supervision loops' error handling uniform. Ordinary "could not reach the
//! target in time" is **not** an error; wait helpers return `false` and the
//! loop retries. `Error` is reserved for configuration/logic faults and for
//! conditions that make continuing unsafe (the engine fail-stops on them).

use thiserror::Error;

/// Every fallible operation in the core funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A sensor returned implausible data. Fatal inside a control loop:
    /// sequencing valves on a garbage reading is unsafe.
    #[error("sensor '{name}': {what}")]
    Sensor { name: String, what: String },

    /// A required collaborator (gauge, valve, callback) was not bound for
    /// the requested operation.
    #[error("missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// Configuration is invalid or could not be loaded.
    #[error("config: {0}")]
    Config(String),

    /// Invariant violation detected inside a control loop. The supervisor
    /// treats this as fatal and terminates the loop (fail-stop).
    #[error("control loop: {0}")]
    ControlLoop(String),
}

/// Core-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Convenience constructor for sensor failures.
    pub fn sensor(name: impl Into<String>, what: impl Into<String>) -> Self {
        Self::Sensor {
            name: name.into(),
            what: what.into(),
        }
    }
}
