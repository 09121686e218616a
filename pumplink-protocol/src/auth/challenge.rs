//! Legacy challenge-response handshake.
//!
//! ```text
//! central                                   pump
//!   │ 0x10 central challenge (8B)            │
//!   │──────────────────────────────────────▶ │
//!   │            0x11 pump challenge (8B)    │
//!   │ ◀──────────────────────────────────────│
//!   │ 0x12 HMAC(code, pump ‖ central)        │
//!   │──────────────────────────────────────▶ │
//!   │            0x13 status                 │
//!   │ ◀──────────────────────────────────────│
//! ```

use super::crypto::{hmac_sha256, random_bytes, TAG_LEN};
use super::{Advance, HandshakeFailure};
use crate::opcode::auth as op;
use crate::Result;

/// Size of each side's challenge
pub const CHALLENGE_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingPumpChallenge,
    AwaitingConfirmation,
    Done,
}

/// Central side of the challenge-response exchange.
pub struct ChallengeResponse {
    code: Vec<u8>,
    central_challenge: [u8; CHALLENGE_SIZE],
    stage: Stage,
}

impl ChallengeResponse {
    /// Creates the exchange with a fresh random challenge.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Crypto` if the RNG fails.
    pub fn new(code: &str) -> Result<Self> {
        Ok(Self {
            code: code.as_bytes().to_vec(),
            central_challenge: random_bytes()?,
            stage: Stage::AwaitingPumpChallenge,
        })
    }

    /// Opcode and payload of the first request.
    #[must_use]
    pub fn initial_request(&self) -> (u8, Vec<u8>) {
        (op::CENTRAL_CHALLENGE_REQUEST, self.central_challenge.to_vec())
    }

    #[must_use]
    pub fn expected_response(&self) -> Option<u8> {
        match self.stage {
            Stage::AwaitingPumpChallenge => Some(op::CENTRAL_CHALLENGE_RESPONSE),
            Stage::AwaitingConfirmation => Some(op::PUMP_CHALLENGE_RESPONSE),
            Stage::Done => None,
        }
    }

    pub(crate) fn on_response(
        &mut self,
        opcode: u8,
        payload: &[u8],
    ) -> std::result::Result<Advance, HandshakeFailure> {
        match (self.stage, opcode) {
            (Stage::AwaitingPumpChallenge, op::CENTRAL_CHALLENGE_RESPONSE) => {
                let pump_challenge: [u8; CHALLENGE_SIZE] =
                    payload.try_into().map_err(|_| {
                        HandshakeFailure::Malformed(format!(
                            "pump challenge of {} bytes",
                            payload.len()
                        ))
                    })?;
                let proof = challenge_proof(&self.code, &pump_challenge, &self.central_challenge);
                self.stage = Stage::AwaitingConfirmation;
                Ok(Advance::Next {
                    opcode: op::PUMP_CHALLENGE_REQUEST,
                    payload: proof.to_vec(),
                })
            }
            (Stage::AwaitingConfirmation, op::PUMP_CHALLENGE_RESPONSE) => {
                self.stage = Stage::Done;
                Ok(Advance::Finished(None))
            }
            (stage, opcode) => Err(HandshakeFailure::Malformed(format!(
                "opcode 0x{:02x} in stage {:?}",
                opcode, stage
            ))),
        }
    }
}

impl std::fmt::Debug for ChallengeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeResponse")
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

/// Response the pump expects to its challenge.
pub(crate) fn challenge_proof(
    code: &[u8],
    pump_challenge: &[u8],
    central_challenge: &[u8],
) -> [u8; TAG_LEN] {
    hmac_sha256(code, &[pump_challenge, central_challenge])
}
