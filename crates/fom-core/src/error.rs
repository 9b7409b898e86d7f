//! Error types for the FOM scheduler and request handler
//!
//! Only recoverable conditions are errors: failure to create a FOM,
//! configuration problems, resource exhaustion at start-up and service
//! life-cycle problems. Failures of a running operation are phases, and
//! broken scheduler contracts are panics.

use thiserror::Error;

/// Result type for scheduler operations
pub type FomResult<T> = Result<T, FomError>;

/// Errors reported by the scheduler and the request handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FomError {
    /// No FOM type is registered for the fop opcode
    #[error("no fom type registered for opcode {opcode}")]
    NoSuchFomType { opcode: u32 },

    /// A FOM type with this opcode is already registered
    #[error("fom type for opcode {opcode} already registered")]
    FomTypeExists { opcode: u32 },

    /// The request handler stopped accepting new operations
    #[error("request handler is shutting down")]
    ShuttingDown,

    /// The FOM-type factory refused to build a FOM
    #[error("fom creation failed: {0}")]
    Factory(String),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A handler thread could not be started
    #[error("failed to spawn handler thread: {0}")]
    WorkerSpawn(String),

    /// A consistency scan found a broken locality invariant
    #[error("locality invariant violated: {0}")]
    Invariant(String),

    /// No service type or running service with this name
    #[error("service {0:?} not found")]
    ServiceNotFound(String),

    /// A service with this name is already registered or running
    #[error("service {0:?} already exists")]
    ServiceExists(String),

    /// Service specific start-up failed
    #[error("service {name:?} failed to start: {reason}")]
    ServiceStart { name: String, reason: String },

    /// Service operation is not permitted in its current phase
    #[error("service {name:?} is in phase {phase}, operation not permitted")]
    InvalidServicePhase { name: String, phase: &'static str },

    /// A standard request phase (authentication, resources, transaction)
    /// refused the operation
    #[error("{phase} failed: {reason}")]
    PhaseFailed { phase: &'static str, reason: String },

    /// The domain timed the operation out while it waited
    #[error("operation timed out")]
    TimedOut,
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}
