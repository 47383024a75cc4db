/*!
 * Device error taxonomy.
 *
 * Adapter failures are converted into these variants at the manager
 * boundary so callers can tell a timeout from an offline device.
 */
use std::time::Duration;

use iotflow_core::device::{Capability, Protocol};
use thiserror::Error;

/// Device operation errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device could not be reached or rejected the session
    #[error("Connection to {device_id} failed: {reason}")]
    Connection {
        #[allow(missing_docs)]
        device_id: String,
        #[allow(missing_docs)]
        reason: String,
    },

    /// The device has no live session
    #[error("Device {0} is not connected")]
    NotConnected(String),

    /// The command needs a capability the device does not declare
    #[error("Device {device_id} lacks capability {capability} required by '{command}'")]
    Capability {
        #[allow(missing_docs)]
        device_id: String,
        #[allow(missing_docs)]
        command: String,
        #[allow(missing_docs)]
        capability: Capability,
    },

    /// No correlated response arrived in time
    #[error("{operation} on {device_id} timed out after {after:?}")]
    Timeout {
        #[allow(missing_docs)]
        device_id: String,
        #[allow(missing_docs)]
        operation: String,
        #[allow(missing_docs)]
        after: Duration,
    },

    /// A record with the same id already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown device, subscription or similar
    #[error("Not found: {0}")]
    NotFound(String),

    /// Frame could not be encoded or decoded, or the device reported a
    /// protocol-level failure
    #[error("{protocol} transport error: {message}")]
    Transport {
        #[allow(missing_docs)]
        protocol: Protocol,
        #[allow(missing_docs)]
        message: String,
    },

    /// No adapter is registered for the protocol
    #[error("No adapter registered for protocol {0}")]
    UnsupportedProtocol(Protocol),

    /// The command or its parameters are malformed
    #[error("Invalid command '{command}': {reason}")]
    InvalidCommand {
        #[allow(missing_docs)]
        command: String,
        #[allow(missing_docs)]
        reason: String,
    },

    /// Error from the core crate (store, config, ...)
    #[error(transparent)]
    Core(#[from] iotflow_core::Error),

    /// Error raised by an externally supplied adapter
    #[error("Adapter error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result alias for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a connection error
    pub fn connection<D: Into<String>, R: Into<String>>(device_id: D, reason: R) -> Self {
        Self::Connection {
            device_id: device_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-connected error
    pub fn not_connected<D: Into<String>>(device_id: D) -> Self {
        Self::NotConnected(device_id.into())
    }

    /// Create a timeout error
    pub fn timeout<D: Into<String>, O: Into<String>>(
        device_id: D,
        operation: O,
        after: Duration,
    ) -> Self {
        Self::Timeout {
            device_id: device_id.into(),
            operation: operation.into(),
            after,
        }
    }

    /// Create a transport error
    pub fn transport<M: Into<String>>(protocol: Protocol, message: M) -> Self {
        Self::Transport {
            protocol,
            message: message.into(),
        }
    }

    /// Create an invalid-command error
    pub fn invalid_command<C: Into<String>, R: Into<String>>(command: C, reason: R) -> Self {
        Self::InvalidCommand {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }

    /// Whether the error is a command or connect timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the device had no live session
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected(_))
    }

    /// Whether the error is a duplicate-id conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Core(e) => e.is_conflict(),
            _ => false,
        }
    }

    /// Whether the error names a missing record
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Core(e) => e.is_not_found(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let err = DeviceError::timeout("lamp", "send_command", Duration::from_secs(2));
        assert!(err.is_timeout());
        assert!(!err.is_not_connected());
        assert!(err.to_string().contains("lamp"));

        assert!(DeviceError::not_connected("lamp").is_not_connected());
        assert!(DeviceError::from(iotflow_core::Error::conflict("dup")).is_conflict());
    }

    #[test]
    fn test_display() {
        let err = DeviceError::Capability {
            device_id: "lock-1".into(),
            command: "set_brightness".into(),
            capability: Capability::Dimming,
        };
        assert_eq!(
            err.to_string(),
            "Device lock-1 lacks capability dimming required by 'set_brightness'"
        );
    }
}
