//! Error types for slotsched

use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for slotsched
#[derive(Error, Debug)]
pub enum SlotschedError {
    /// A requested amount is not acceptable for the slot type
    #[error("Invalid resource argument: {0}")]
    InvalidResourceArgument(String),

    /// The requested slots belong to mutually exclusive families
    #[error("Invalid resource combination: {0}")]
    InvalidResourceCombination(String),

    /// The request quantizes down to nothing on the target devices
    #[error("Not a multiple of quantum: {0}")]
    NotMultipleOfQuantum(String),

    /// Not enough free capacity for a slot
    #[error("Insufficient resource: {message} (slot: {slot_name}, requested: {requested}, allocatable: {allocatable})")]
    InsufficientResource {
        message: String,
        slot_name: String,
        requested: Decimal,
        allocatable: Decimal,
    },

    /// No agent can host the session or kernel
    #[error("Instance not available: {0}")]
    InstanceNotAvailable(String),

    /// The session itself is malformed
    #[error("Bad request: {0}")]
    GenericBadRequest(String),

    /// Scheduler configuration failed validation
    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown scheduler name
    #[error("Unknown scheduler: {0}")]
    UnknownScheduler(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Agent not found
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SlotschedError {
    /// Whether the session should stay pending and be retried on a later tick
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SlotschedError::InsufficientResource { .. } | SlotschedError::InstanceNotAvailable(_)
        )
    }
}

/// Result type for slotsched operations
pub type SlotschedResult<T> = Result<T, SlotschedError>;

impl From<serde_json::Error> for SlotschedError {
    fn from(err: serde_json::Error) -> Self {
        SlotschedError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SlotschedError {
    fn from(err: toml::de::Error) -> Self {
        SlotschedError::Config(err.to_string())
    }
}
