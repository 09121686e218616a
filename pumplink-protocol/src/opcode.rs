//! Opcodes understood by the engine
//!
//! Requests use even opcodes and the pump answers with `request + 1`. The
//! handshake range and the pump-control range can never be wrapped in a
//! [`RequestOpcode`], which is the only way to reach
//! [`PumpLink::send_request`](crate::PumpLink::send_request).

use crate::{ProtocolError, Result};
use std::fmt;

/// Handshake opcodes (Authorization channel)
pub mod auth {
    pub const CENTRAL_CHALLENGE_REQUEST: u8 = 0x10;
    pub const CENTRAL_CHALLENGE_RESPONSE: u8 = 0x11;
    pub const PUMP_CHALLENGE_REQUEST: u8 = 0x12;
    pub const PUMP_CHALLENGE_RESPONSE: u8 = 0x13;

    pub const PAKE_ROUND_1A_REQUEST: u8 = 0x20;
    pub const PAKE_ROUND_1A_RESPONSE: u8 = 0x21;
    pub const PAKE_ROUND_1B_REQUEST: u8 = 0x22;
    pub const PAKE_ROUND_1B_RESPONSE: u8 = 0x23;
    pub const PAKE_ROUND_2_REQUEST: u8 = 0x24;
    pub const PAKE_ROUND_2_RESPONSE: u8 = 0x25;
    pub const PAKE_ROUND_3_REQUEST: u8 = 0x26;
    pub const PAKE_ROUND_3_RESPONSE: u8 = 0x27;
    pub const PAKE_ROUND_4_REQUEST: u8 = 0x28;
    pub const PAKE_ROUND_4_RESPONSE: u8 = 0x29;
}

/// Status requests the pump expects right after a handshake
pub mod session {
    pub const API_VERSION_REQUEST: u8 = 0x40;
    pub const PUMP_VERSION_REQUEST: u8 = 0x42;
    pub const TIME_SINCE_RESET_REQUEST: u8 = 0x44;

    /// Acknowledged on CurrentStatus, data follows on HistoryLog
    pub const HISTORY_LOG_REQUEST: u8 = 0x60;
}

const RESERVED_AUTH: std::ops::RangeInclusive<u8> = 0x10..=0x2F;
const PUMP_CONTROL: std::ops::RangeInclusive<u8> = 0x80..=0xFF;

/// An opcode that is safe to send as a status request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestOpcode(u8);

impl RequestOpcode {
    /// Validate a raw opcode as a read-only status request
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::ReadOnlyViolation` for response opcodes,
    /// handshake opcodes and anything in the pump-control range.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pumplink_protocol::RequestOpcode;
    ///
    /// let iob = RequestOpcode::new(0x6c).unwrap();
    /// assert_eq!(iob.response_opcode(), 0x6d);
    ///
    /// assert!(RequestOpcode::new(0x9a).is_err()); // control command
    /// assert!(RequestOpcode::new(0x41).is_err()); // response opcode
    /// ```
    pub fn new(opcode: u8) -> Result<Self> {
        if PUMP_CONTROL.contains(&opcode) {
            return Err(ProtocolError::ReadOnlyViolation(format!(
                "opcode 0x{:02x} is a pump control command",
                opcode
            )));
        }
        if RESERVED_AUTH.contains(&opcode) {
            return Err(ProtocolError::ReadOnlyViolation(format!(
                "opcode 0x{:02x} is reserved for the handshake",
                opcode
            )));
        }
        if opcode % 2 != 0 {
            return Err(ProtocolError::ReadOnlyViolation(format!(
                "opcode 0x{:02x} is a response opcode",
                opcode
            )));
        }
        Ok(Self(opcode))
    }

    /// Raw opcode byte
    pub fn get(self) -> u8 {
        self.0
    }

    /// Opcode the pump answers with
    pub fn response_opcode(self) -> u8 {
        self.0 + 1
    }
}

impl fmt::Display for RequestOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

impl TryFrom<u8> for RequestOpcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_opcodes_accepted() {
        for op in [
            session::API_VERSION_REQUEST,
            session::PUMP_VERSION_REQUEST,
            session::TIME_SINCE_RESET_REQUEST,
            session::HISTORY_LOG_REQUEST,
            0x00,
            0x7e,
        ] {
            assert!(RequestOpcode::new(op).is_ok(), "0x{:02x} rejected", op);
        }
    }

    #[test]
    fn test_control_and_handshake_rejected() {
        for op in [0x80, 0x9a, 0xfe, auth::PAKE_ROUND_1A_REQUEST, auth::CENTRAL_CHALLENGE_REQUEST] {
            let err = RequestOpcode::new(op).unwrap_err();
            assert!(matches!(err, ProtocolError::ReadOnlyViolation(_)));
        }
    }

    #[test]
    fn test_response_opcode() {
        let op = RequestOpcode::new(session::API_VERSION_REQUEST).unwrap();
        assert_eq!(op.response_opcode(), 0x41);
        assert_eq!(op.to_string(), "0x40");
    }
}
