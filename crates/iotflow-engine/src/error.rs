/*!
 * Error types for the iotflow engine crate.
 */
use thiserror::Error;

/// Error type for controller, automation and telemetry operations
#[derive(Error, Debug)]
pub enum Error {
    /// Device layer failure (not connected, timeout, capability, ...)
    #[error(transparent)]
    Device(#[from] iotflow_devices::DeviceError),

    /// Core failure (store, config, ...)
    #[error(transparent)]
    Core(#[from] iotflow_core::Error),

    /// Unknown group, rule, scene or schedule
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of record
        kind: &'static str,
        /// Identifier looked up
        id: String,
    },

    /// Rule definition or evaluation error
    #[error("Rule error: {0}")]
    Rule(String),

    /// Input failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Telemetry pipeline error
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Failure reported by an externally supplied collaborator
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a not-found error
    pub fn not_found<S: AsRef<str>>(kind: &'static str, id: S) -> Self {
        Error::NotFound {
            kind,
            id: id.as_ref().to_string(),
        }
    }

    /// Create a new rule error
    pub fn rule<S: AsRef<str>>(msg: S) -> Self {
        Error::Rule(msg.as_ref().to_string())
    }

    /// Create a new validation error
    pub fn validation<S: AsRef<str>>(msg: S) -> Self {
        Error::Validation(msg.as_ref().to_string())
    }

    /// Create a new telemetry error
    pub fn telemetry<S: AsRef<str>>(msg: S) -> Self {
        Error::Telemetry(msg.as_ref().to_string())
    }

    /// Whether the error names a missing record at any layer
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Device(e) => e.is_not_found(),
            Error::Core(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Whether the error is a device timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Device(e) if e.is_timeout())
    }

    /// Whether the device had no live session
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Error::Device(e) if e.is_not_connected())
    }

    /// Whether the device lacks the capability a command needs
    pub fn is_capability(&self) -> bool {
        matches!(
            self,
            Error::Device(iotflow_devices::DeviceError::Capability { .. })
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(err.to_string())
    }
}
