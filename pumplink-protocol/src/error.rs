//! Error handling for the PumpLink protocol engine
//!
//! Every public operation returns [`Result`], so a caller awaiting a request,
//! a stream or a lifecycle command always gets an explicit outcome.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! Connection failures, failed writes and a vanished link. These are always
//! recoverable through reconnection and are never fatal to the process.
//!
//! ### Frame Errors
//! Checksum mismatches and malformed headers. The offending frame is dropped
//! and logged; the owning transaction keeps waiting for its own timeout.
//!
//! ### Handshake Errors
//! Protocol-level rejection of a handshake round. Fatal to the current
//! connection attempt only.
//!
//! ### Bond Loss
//! The pump no longer recognises this central's transport bond. Fatal to
//! auto-reconnection until the user pairs again.
//!
//! ### Caller-Visible Errors
//! Timeouts, "not connected" and decode failures are distinct variants so a
//! scheduler can tell them apart.

use thiserror::Error;

/// Result type for protocol operations
///
/// # Examples
///
/// ```rust
/// use pumplink_protocol::Result;
///
/// fn example() -> Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while talking to a pump
///
/// # Examples
///
/// ```rust
/// use pumplink_protocol::ProtocolError;
///
/// let error = ProtocolError::NotConnected;
/// assert_eq!(error.to_string(), "Not connected");
///
/// let error = ProtocolError::Timeout("history log stream".to_string());
/// assert!(error.is_recoverable());
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (credential files, configuration files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Transport layer error (connect, write, subscribe, bond removal)
    #[error("Transport error: {0}")]
    Transport(String),

    /// No authenticated session is available
    #[error("Not connected")]
    NotConnected,

    /// No pairing code is known for this pump
    #[error("Not paired")]
    NotPaired,

    /// A request, stream or handshake did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A pending operation was cancelled (teardown, eviction, unpair)
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// A frame failed validation
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Cargo does not fit into a single frame
    #[error("Cargo too large: {0} bytes (max: {1})")]
    CargoTooLarge(usize, usize),

    /// The handshake was rejected or produced inconsistent data
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The pump no longer honours the transport bond
    #[error("Bond lost: {0}")]
    BondLost(String),

    /// The pluggable decoder could not interpret a validated cargo
    #[error("Decode error: {0}")]
    Decode(String),

    /// A response arrived with an opcode other than the one expected
    #[error("Unexpected response opcode 0x{actual:02x} (expected 0x{expected:02x})")]
    UnexpectedResponse { expected: u8, actual: u8 },

    /// Configuration is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A cryptographic primitive failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Operation attempted in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Attempt to address something that could change pump state
    #[error("Read-only violation: {0}")]
    ReadOnlyViolation(String),
}

impl ProtocolError {
    /// Check if this error is recoverable (transient error that can be retried)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pumplink_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::Transport("write failed".to_string()).is_recoverable());
    /// assert!(!ProtocolError::NotPaired.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::Cancelled(_)
                | ProtocolError::NotConnected
                | ProtocolError::InvalidFrame(_)
                | ProtocolError::Io(_)
        )
    }

    /// Check if this error requires user action (re-pairing, fixing config)
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotPaired
                | ProtocolError::BondLost(_)
                | ProtocolError::Authentication(_)
                | ProtocolError::Configuration(_)
                | ProtocolError::Toml(_)
        )
    }

    /// Get a user-friendly error message suitable for display in UI
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotPaired => {
                "Pump not paired. Enter the pairing code shown on the pump.".to_string()
            }
            ProtocolError::NotConnected => {
                "Pump not connected. Waiting for the pump to come back in range.".to_string()
            }
            ProtocolError::BondLost(_) => {
                "The pump no longer recognises this phone. Remove it from Bluetooth settings and pair again."
                    .to_string()
            }
            ProtocolError::Authentication(msg) => {
                format!("Pairing failed: {}. Check the pairing code.", msg)
            }
            ProtocolError::Timeout(msg) => {
                format!("Timeout: {}. The pump may be out of range.", msg)
            }
            ProtocolError::Transport(msg) => {
                format!("Bluetooth error: {}. Reconnecting.", msg)
            }
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::ReadOnlyViolation(msg) => {
                format!("Refused: {}. This app only reads pump data.", msg)
            }
            other => other.to_string(),
        }
    }

    /// Create a transport error from any displayable cause
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        ProtocolError::Transport(msg.to_string())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidState(msg.into())
    }
}

impl From<ring::error::Unspecified> for ProtocolError {
    fn from(_: ring::error::Unspecified) -> Self {
        ProtocolError::Crypto("unspecified ring failure".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::CargoTooLarge(300, 253);
        assert_eq!(error.to_string(), "Cargo too large: 300 bytes (max: 253)");

        let error = ProtocolError::UnexpectedResponse {
            expected: 0x41,
            actual: 0x43,
        };
        assert_eq!(
            error.to_string(),
            "Unexpected response opcode 0x43 (expected 0x41)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::NotFound, "credentials.json");
        let protocol_error: ProtocolError = io_error.into();

        assert!(matches!(protocol_error, ProtocolError::Io(_)));
        assert!(protocol_error.to_string().contains("credentials.json"));
    }

    #[test]
    fn test_bond_loss_needs_user() {
        let error = ProtocolError::BondLost("insufficient authentication".to_string());
        assert!(error.requires_user_action());
        assert!(!error.is_recoverable());
        assert!(error.user_message().contains("pair again"));
    }

    #[test]
    fn test_ring_error_conversion() {
        let error: ProtocolError = ring::error::Unspecified.into();
        assert!(matches!(error, ProtocolError::Crypto(_)));
    }
}
