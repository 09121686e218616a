//! Pluggable response decoding
//!
//! The engine never interprets cargo. Callers that want a domain value hand
//! [`PumpLink::request_decoded`](crate::PumpLink::request_decoded) a
//! [`ResponseDecoder`] for the opcode they asked for.

use crate::opcode::RequestOpcode;
use crate::{ProtocolError, Result};

/// Turns validated response cargo into a domain value
pub trait ResponseDecoder: Send + Sync {
    type Output;

    /// Request opcode this decoder understands
    fn request_opcode(&self) -> RequestOpcode;

    /// Decode the cargo of one response frame
    ///
    /// # Errors
    ///
    /// Implementations return `ProtocolError::Decode` for cargo they cannot
    /// interpret.
    fn decode(&self, cargo: &[u8]) -> Result<Self::Output>;
}

/// Check that a cargo has exactly `expected` bytes
pub fn expect_len(cargo: &[u8], expected: usize) -> Result<()> {
    if cargo.len() != expected {
        return Err(ProtocolError::Decode(format!(
            "expected {} cargo bytes, got {}",
            expected,
            cargo.len()
        )));
    }
    Ok(())
}
