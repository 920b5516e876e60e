//! Error types for device sessions.

use std::io;

use thiserror::Error;

use crate::control_interface::protocol::Command;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, YeelightError>;

/// Errors that can occur while talking to a device.
#[derive(Debug, Error)]
pub enum YeelightError {
    /// The TCP connect did not complete before the connect timeout.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// The device refused the connection, or it could not be opened at all.
    #[error("connection refused: {0}")]
    ConnectionRefused(#[source] io::Error),

    /// A command was attempted while the session is not connected.
    #[error("not connected")]
    NotConnected,

    /// The command was registered but could not be written to the socket.
    #[error("failed to send command {} ({})", .command.id, .command.method)]
    SendFailure {
        command: Command,
        #[source]
        source: io::Error,
    },

    /// No response arrived before the command's deadline.
    #[error("command {id} ({method}) timed out")]
    CommandTimeout { id: u64, method: String },

    /// The device answered with an application-level error.
    #[error("device error {code}: {message}")]
    DeviceError { code: i64, message: String },

    /// The connection was torn down while the command was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// A caller-supplied parameter is out of its documented range.
    #[error("{field} must be within {min}..={max}, got {value}")]
    Validation {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// A message could not be encoded or decoded.
    #[error("parse error: {0}")]
    Parse(String),
}

impl YeelightError {
    /// Checks `value` against an inclusive range, producing a [`YeelightError::Validation`].
    pub fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<()> {
        if (min..=max).contains(&value) {
            Ok(())
        } else {
            Err(YeelightError::Validation {
                field,
                value,
                min,
                max,
            })
        }
    }

    /// True for errors that end the connection rather than a single command.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            YeelightError::ConnectionTimeout
                | YeelightError::ConnectionRefused(_)
                | YeelightError::ConnectionClosed
                | YeelightError::NotConnected
        )
    }
}

impl From<serde_json::Error> for YeelightError {
    fn from(e: serde_json::Error) -> Self {
        YeelightError::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_range_bounds() {
        assert!(YeelightError::check_range("bright", 1, 1, 100).is_ok());
        assert!(YeelightError::check_range("bright", 100, 1, 100).is_ok());
        let err = YeelightError::check_range("bright", 0, 1, 100).unwrap_err();
        assert_eq!(err.to_string(), "bright must be within 1..=100, got 0");
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(YeelightError::ConnectionClosed.is_connection_error());
        assert!(!YeelightError::DeviceError {
            code: -1,
            message: "unsupported method".to_string()
        }
        .is_connection_error());
    }
}
