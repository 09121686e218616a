//! Handshake state machines.
//!
//! The pump answers nothing until one of two mutually exclusive handshakes
//! has completed on the Authorization channel:
//!
//! - a legacy challenge-response, selected by pairing codes longer than
//!   [`PAKE_MAX_CODE_LEN`] characters
//! - a password-authenticated key exchange (SPAKE2, then X25519), run in
//!   bootstrap mode (5 rounds) the first time and in confirmation mode (2 rounds) once a
//!   derived secret has been persisted
//!
//! The variant is picked once in [`AuthSession::begin`] and dispatched
//! through a private tagged enum. An [`AuthSession`] is pure: it consumes
//! response cargos and produces the next request, leaving framing, writes
//! and persistence to the connection lifecycle.
//!
//! ## Cargo Layout
//!
//! ```text
//! request:  app instance id (2B LE) | round payload
//! response: app instance id (2B LE) | status (1B, 0 = accepted) | round payload
//! ```

pub mod challenge;
pub mod crypto;
pub mod pake;

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::credentials::DerivedSecret;
use crate::{ProtocolError, Result};

pub use challenge::ChallengeResponse;
pub use pake::{PakeHandshake, PakeMode};

/// Longest pairing code that selects the key exchange
pub const PAKE_MAX_CODE_LEN: usize = 10;

/// Status byte value meaning "accepted"
pub const STATUS_OK: u8 = 0;

/// Handshake variant chosen for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    ChallengeResponse,
    Pake(PakeMode),
}

impl AuthProtocol {
    /// Picks the handshake from the credential shape.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pumplink_protocol::auth::{AuthProtocol, PakeMode};
    ///
    /// assert_eq!(
    ///     AuthProtocol::select("482913", false),
    ///     AuthProtocol::Pake(PakeMode::Bootstrap)
    /// );
    /// assert_eq!(
    ///     AuthProtocol::select("482913", true),
    ///     AuthProtocol::Pake(PakeMode::Confirmation)
    /// );
    /// assert_eq!(
    ///     AuthProtocol::select("abcdefghijklmnop", true),
    ///     AuthProtocol::ChallengeResponse
    /// );
    /// ```
    #[must_use]
    pub fn select(code: &str, has_derived_secret: bool) -> Self {
        if code.chars().count() > PAKE_MAX_CODE_LEN {
            AuthProtocol::ChallengeResponse
        } else if has_derived_secret {
            AuthProtocol::Pake(PakeMode::Confirmation)
        } else {
            AuthProtocol::Pake(PakeMode::Bootstrap)
        }
    }

    /// Number of request/response rounds to completion
    #[must_use]
    pub fn rounds(self) -> usize {
        match self {
            AuthProtocol::ChallengeResponse => 2,
            AuthProtocol::Pake(PakeMode::Bootstrap) => 5,
            AuthProtocol::Pake(PakeMode::Confirmation) => 2,
        }
    }
}

impl fmt::Display for AuthProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthProtocol::ChallengeResponse => write!(f, "challenge-response"),
            AuthProtocol::Pake(PakeMode::Bootstrap) => write!(f, "key exchange (bootstrap)"),
            AuthProtocol::Pake(PakeMode::Confirmation) => write!(f, "key exchange (confirmation)"),
        }
    }
}

/// A handshake frame to send on the Authorization channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub opcode: u8,
    pub cargo: Vec<u8>,
}

/// Result of a successful handshake
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub protocol: AuthProtocol,
    /// Newly derived secret to persist (bootstrap mode only)
    pub derived_secret: Option<DerivedSecret>,
    /// Rounds exchanged
    pub rounds: usize,
}

/// What to do after feeding a response
#[derive(Debug, Clone)]
pub enum AuthStep {
    Send(AuthRequest),
    Authenticated(AuthOutcome),
}

/// Why a handshake ended without success
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// The pump refused a round, or its proof did not verify
    #[error("handshake rejected: {reason}")]
    Rejected {
        reason: String,
        /// The persisted derived secret must be discarded
        invalidate_secret: bool,
    },

    /// A response could not be interpreted
    #[error("malformed handshake response: {0}")]
    Malformed(String),

    /// The overall deadline passed
    #[error("handshake deadline exceeded")]
    TimedOut,
}

impl From<HandshakeFailure> for ProtocolError {
    fn from(failure: HandshakeFailure) -> Self {
        match failure {
            HandshakeFailure::TimedOut => ProtocolError::Timeout("handshake".to_string()),
            other => ProtocolError::Authentication(other.to_string()),
        }
    }
}

/// What a variant wants next, without the cargo header
#[derive(Debug)]
pub(crate) enum Advance {
    Next { opcode: u8, payload: Vec<u8> },
    Finished(Option<DerivedSecret>),
}

enum Machine {
    Challenge(ChallengeResponse),
    Pake(Box<PakeHandshake>),
    Finished,
}

/// One handshake attempt, recreated for every connection.
pub struct AuthSession {
    protocol: AuthProtocol,
    app_id: u16,
    deadline: Instant,
    rounds: usize,
    machine: Machine,
}

impl AuthSession {
    /// Selects the handshake and builds its first request.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Configuration` for an empty pairing code and
    /// `ProtocolError::Crypto` if key material cannot be generated.
    pub fn begin(
        code: &str,
        derived_secret: Option<&DerivedSecret>,
        app_id: u16,
        timeout: Duration,
    ) -> Result<(Self, AuthRequest)> {
        if code.is_empty() {
            return Err(ProtocolError::Configuration("empty pairing code".to_string()));
        }

        let protocol = AuthProtocol::select(code, derived_secret.is_some());
        let (machine, opcode, payload) = match protocol {
            AuthProtocol::ChallengeResponse => {
                let machine = ChallengeResponse::new(code)?;
                let (opcode, payload) = machine.initial_request();
                (Machine::Challenge(machine), opcode, payload)
            }
            AuthProtocol::Pake(mode) => {
                let secret = match mode {
                    PakeMode::Confirmation => derived_secret.cloned(),
                    PakeMode::Bootstrap => None,
                };
                let (machine, opcode, payload) = PakeHandshake::start(code, secret)?;
                (Machine::Pake(Box::new(machine)), opcode, payload)
            }
        };

        info!("Starting {} handshake ({} rounds)", protocol, protocol.rounds());

        let session = Self {
            protocol,
            app_id,
            deadline: Instant::now() + timeout,
            rounds: 0,
            machine,
        };
        let request = session.request(opcode, payload);
        Ok((session, request))
    }

    pub fn protocol(&self) -> AuthProtocol {
        self.protocol
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn rounds_completed(&self) -> usize {
        self.rounds
    }

    /// Response opcode the session is waiting for
    pub fn expected_opcode(&self) -> Option<u8> {
        match &self.machine {
            Machine::Challenge(m) => m.expected_response(),
            Machine::Pake(m) => m.expected_response(),
            Machine::Finished => None,
        }
    }

    /// Feeds one validated response frame.
    ///
    /// # Errors
    ///
    /// Returns the [`HandshakeFailure`] that ends this attempt. The session
    /// must not be used afterwards.
    pub fn on_response(
        &mut self,
        opcode: u8,
        cargo: &[u8],
    ) -> std::result::Result<AuthStep, HandshakeFailure> {
        if Instant::now() > self.deadline {
            warn!("Handshake response after deadline");
            self.machine = Machine::Finished;
            return Err(HandshakeFailure::TimedOut);
        }

        let expected = self.expected_opcode().ok_or_else(|| {
            HandshakeFailure::Malformed(format!("response 0x{:02x} after completion", opcode))
        })?;
        if opcode != expected {
            self.machine = Machine::Finished;
            return Err(HandshakeFailure::Malformed(format!(
                "expected opcode 0x{:02x}, got 0x{:02x}",
                expected, opcode
            )));
        }

        let outcome = self.advance(opcode, cargo);
        if outcome.is_err() {
            self.machine = Machine::Finished;
        }
        outcome
    }

    fn advance(
        &mut self,
        opcode: u8,
        cargo: &[u8],
    ) -> std::result::Result<AuthStep, HandshakeFailure> {
        if cargo.len() < 3 {
            return Err(HandshakeFailure::Malformed(format!(
                "response cargo of {} bytes",
                cargo.len()
            )));
        }

        let app_id = u16::from_le_bytes([cargo[0], cargo[1]]);
        if app_id != self.app_id {
            return Err(HandshakeFailure::Malformed(format!(
                "app instance id {} does not match {}",
                app_id, self.app_id
            )));
        }

        let status = cargo[2];
        if status != STATUS_OK {
            return Err(HandshakeFailure::Rejected {
                reason: format!("pump refused round {} with status {}", self.rounds + 1, status),
                invalidate_secret: self.protocol == AuthProtocol::Pake(PakeMode::Confirmation),
            });
        }

        let payload = &cargo[3..];
        let advance = match &mut self.machine {
            Machine::Challenge(m) => m.on_response(opcode, payload)?,
            Machine::Pake(m) => m.on_response(opcode, payload)?,
            Machine::Finished => {
                return Err(HandshakeFailure::Malformed("session already finished".to_string()))
            }
        };
        self.rounds += 1;

        match advance {
            Advance::Next { opcode, payload } => {
                debug!("Handshake round {} complete", self.rounds);
                Ok(AuthStep::Send(self.request(opcode, payload)))
            }
            Advance::Finished(derived_secret) => {
                self.machine = Machine::Finished;
                info!("{} handshake succeeded after {} rounds", self.protocol, self.rounds);
                Ok(AuthStep::Authenticated(AuthOutcome {
                    protocol: self.protocol,
                    derived_secret,
                    rounds: self.rounds,
                }))
            }
        }
    }

    fn request(&self, opcode: u8, payload: Vec<u8>) -> AuthRequest {
        let mut cargo = Vec::with_capacity(2 + payload.len());
        cargo.extend_from_slice(&self.app_id.to_le_bytes());
        cargo.extend_from_slice(&payload);
        AuthRequest { opcode, cargo }
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("protocol", &self.protocol)
            .field("rounds", &self.rounds)
            .field("expected_opcode", &self.expected_opcode())
            .finish()
    }
}
