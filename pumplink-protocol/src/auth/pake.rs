//! Password-authenticated key exchange.
//!
//! Bootstrap mode runs every round and ends with a fresh derived secret;
//! confirmation mode skips straight to the nonce round and proves
//! possession of the persisted secret.
//!
//! | Round | Request | Response | Payload (each direction)                         |
//! |-------|---------|----------|--------------------------------------------------|
//! | 1a    | `0x20`  | `0x21`   | SPAKE2 message (Ed25519)                         |
//! | 1b    | `0x22`  | `0x23`   | HMAC(k_pake, role ‖ own message ‖ peer message)  |
//! | 2     | `0x24`  | `0x25`   | X25519 key (32B) ‖ HMAC(k_pake, role ‖ key)      |
//! | 3     | `0x26`  | `0x27`   | nonce (16B)                                      |
//! | 4     | `0x28`  | `0x29`   | HMAC(secret, role ‖ own nonce ‖ peer nonce)      |
//!
//! `k_pw` is the pairing code stretched with HKDF and is only ever fed into
//! SPAKE2, so the transcript gives an eavesdropper nothing to test code
//! guesses against. `k_pake` is the SPAKE2 output. In bootstrap mode the
//! derived secret is `HKDF(salt = central nonce ‖ pump nonce, ikm = dh ‖ k_pake)`.

use super::crypto::{
    self, agree, finish_pake, generate_key_share, hmac_sha256, random_bytes, start_pake,
    verify_hmac, KeyShare, PakeShare, Role, PUBLIC_KEY_LEN, TAG_LEN,
};
use super::{Advance, HandshakeFailure};
use crate::credentials::DerivedSecret;
use crate::opcode::auth as op;
use crate::Result;

/// Size of each side's round-3 nonce
pub const NONCE_SIZE: usize = 16;

/// Round-2 payload: X25519 key followed by its MAC
pub const AUTHENTICATED_SHARE_LEN: usize = PUBLIC_KEY_LEN + TAG_LEN;

const SECRET_INFO: &[u8] = b"pumplink derived secret";

/// Which flavour of the exchange is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakeMode {
    /// First pairing; needs the pump's pairing screen
    Bootstrap,
    /// Replays a persisted derived secret
    Confirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    PakeMessage,
    KeyConfirmation,
    KeyShare,
    Nonce,
    Confirm,
    Done,
}

/// Central side of the key exchange.
pub struct PakeHandshake {
    mode: PakeMode,
    pake: Option<PakeShare>,
    pending_share: Option<KeyShare>,
    central_message: Vec<u8>,
    pump_message: Vec<u8>,
    pake_key: [u8; 32],
    shared: [u8; 32],
    central_nonce: [u8; NONCE_SIZE],
    pump_nonce: Option<[u8; NONCE_SIZE]>,
    secret: Option<DerivedSecret>,
    stage: Stage,
}

impl PakeHandshake {
    /// Builds the exchange and its first request.
    ///
    /// Passing a secret selects confirmation mode.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Crypto` if key material cannot be generated.
    pub fn start(code: &str, secret: Option<DerivedSecret>) -> Result<(Self, u8, Vec<u8>)> {
        let mode = if secret.is_some() {
            PakeMode::Confirmation
        } else {
            PakeMode::Bootstrap
        };

        let mut handshake = Self {
            mode,
            pake: None,
            pending_share: None,
            central_message: Vec::new(),
            pump_message: Vec::new(),
            pake_key: [0; 32],
            shared: [0; 32],
            central_nonce: random_bytes()?,
            pump_nonce: None,
            secret,
            stage: Stage::PakeMessage,
        };

        let (opcode, payload) = match mode {
            PakeMode::Bootstrap => {
                let share = start_pake(&crypto::password_key(code)?, Role::Central);
                handshake.central_message = share.message.clone();
                handshake.pake = Some(share);
                (op::PAKE_ROUND_1A_REQUEST, handshake.central_message.clone())
            }
            PakeMode::Confirmation => {
                handshake.stage = Stage::Nonce;
                (op::PAKE_ROUND_3_REQUEST, handshake.central_nonce.to_vec())
            }
        };
        Ok((handshake, opcode, payload))
    }

    pub fn mode(&self) -> PakeMode {
        self.mode
    }

    #[must_use]
    pub fn expected_response(&self) -> Option<u8> {
        match self.stage {
            Stage::PakeMessage => Some(op::PAKE_ROUND_1A_RESPONSE),
            Stage::KeyConfirmation => Some(op::PAKE_ROUND_1B_RESPONSE),
            Stage::KeyShare => Some(op::PAKE_ROUND_2_RESPONSE),
            Stage::Nonce => Some(op::PAKE_ROUND_3_RESPONSE),
            Stage::Confirm => Some(op::PAKE_ROUND_4_RESPONSE),
            Stage::Done => None,
        }
    }

    fn reject(&self, reason: &str) -> HandshakeFailure {
        HandshakeFailure::Rejected {
            reason: reason.to_string(),
            invalidate_secret: self.mode == PakeMode::Confirmation,
        }
    }

    pub(crate) fn on_response(
        &mut self,
        opcode: u8,
        payload: &[u8],
    ) -> std::result::Result<Advance, HandshakeFailure> {
        match (self.stage, opcode) {
            (Stage::PakeMessage, op::PAKE_ROUND_1A_RESPONSE) => {
                let share = self.pake.take().ok_or_else(|| {
                    HandshakeFailure::Malformed("PAKE state already consumed".to_string())
                })?;
                self.pake_key = finish_pake(share, payload)
                    .map_err(|e| HandshakeFailure::Malformed(e.to_string()))?;
                self.pump_message = payload.to_vec();

                self.stage = Stage::KeyConfirmation;
                let commit = commitment(
                    &self.pake_key,
                    Role::Central,
                    &self.central_message,
                    &self.pump_message,
                );
                Ok(Advance::Next {
                    opcode: op::PAKE_ROUND_1B_REQUEST,
                    payload: commit.to_vec(),
                })
            }
            (Stage::KeyConfirmation, op::PAKE_ROUND_1B_RESPONSE) => {
                let parts = [Role::Pump.label(), &self.pump_message[..], &self.central_message[..]];
                if !verify_hmac(&self.pake_key, &parts, payload) {
                    return Err(self.reject("pump key confirmation does not match the pairing code"));
                }

                let share = generate_key_share()
                    .map_err(|e| HandshakeFailure::Malformed(e.to_string()))?;
                let request = authenticated_share(&self.pake_key, Role::Central, &share.public);
                self.stage = Stage::KeyShare;
                self.pending_share = Some(share);
                Ok(Advance::Next {
                    opcode: op::PAKE_ROUND_2_REQUEST,
                    payload: request,
                })
            }
            (Stage::KeyShare, op::PAKE_ROUND_2_RESPONSE) => {
                let pump_public = open_share(&self.pake_key, Role::Pump, payload)
                    .ok_or_else(|| self.reject("pump key share is not authenticated"))?;
                let share = self.pending_share.take().ok_or_else(|| {
                    HandshakeFailure::Malformed("key share already consumed".to_string())
                })?;
                self.shared = agree(share.private, &pump_public)
                    .map_err(|e| HandshakeFailure::Malformed(e.to_string()))?;

                self.stage = Stage::Nonce;
                Ok(Advance::Next {
                    opcode: op::PAKE_ROUND_3_REQUEST,
                    payload: self.central_nonce.to_vec(),
                })
            }
            (Stage::Nonce, op::PAKE_ROUND_3_RESPONSE) => {
                let pump_nonce: [u8; NONCE_SIZE] = fixed(payload, "pump nonce")?;
                if self.mode == PakeMode::Bootstrap {
                    let secret = derive_secret(
                        &self.central_nonce,
                        &pump_nonce,
                        &self.shared,
                        &self.pake_key,
                    )
                    .map_err(|e| HandshakeFailure::Malformed(e.to_string()))?;
                    self.secret = Some(secret);
                }
                let secret = self
                    .secret
                    .as_ref()
                    .ok_or_else(|| HandshakeFailure::Malformed("no derived secret".to_string()))?;

                let tag = confirmation_tag(secret, Role::Central, &self.central_nonce, &pump_nonce);
                self.pump_nonce = Some(pump_nonce);
                self.stage = Stage::Confirm;
                Ok(Advance::Next {
                    opcode: op::PAKE_ROUND_4_REQUEST,
                    payload: tag.to_vec(),
                })
            }
            (Stage::Confirm, op::PAKE_ROUND_4_RESPONSE) => {
                let (Some(secret), Some(pump_nonce)) = (&self.secret, self.pump_nonce) else {
                    return Err(HandshakeFailure::Malformed("confirmation out of order".to_string()));
                };
                let parts = [Role::Pump.label(), &pump_nonce[..], &self.central_nonce[..]];
                if !verify_hmac(secret.as_bytes(), &parts, payload) {
                    return Err(self.reject("pump confirmation tag does not verify"));
                }

                self.stage = Stage::Done;
                let derived = match self.mode {
                    PakeMode::Bootstrap => self.secret.clone(),
                    PakeMode::Confirmation => None,
                };
                Ok(Advance::Finished(derived))
            }
            (stage, opcode) => Err(HandshakeFailure::Malformed(format!(
                "opcode 0x{:02x} in stage {:?}",
                opcode, stage
            ))),
        }
    }
}

impl std::fmt::Debug for PakeHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PakeHandshake")
            .field("mode", &self.mode)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

fn fixed<const N: usize>(payload: &[u8], what: &str) -> std::result::Result<[u8; N], HandshakeFailure> {
    payload.try_into().map_err(|_| {
        HandshakeFailure::Malformed(format!("{} of {} bytes, expected {}", what, payload.len(), N))
    })
}

/// Round 1b key confirmation over both SPAKE2 messages
pub(crate) fn commitment(
    pake_key: &[u8],
    role: Role,
    own_message: &[u8],
    peer_message: &[u8],
) -> [u8; TAG_LEN] {
    hmac_sha256(pake_key, &[role.label(), own_message, peer_message])
}

/// Round 2 payload: an X25519 key bound to the PAKE key
pub(crate) fn authenticated_share(pake_key: &[u8], role: Role, public: &[u8]) -> Vec<u8> {
    let tag = hmac_sha256(pake_key, &[role.label(), public]);
    [public, &tag[..]].concat()
}

/// Check a round 2 payload sent by `sender`; `None` if it does not verify
pub(crate) fn open_share(
    pake_key: &[u8],
    sender: Role,
    payload: &[u8],
) -> Option<[u8; PUBLIC_KEY_LEN]> {
    if payload.len() != AUTHENTICATED_SHARE_LEN {
        return None;
    }
    let (public, tag) = payload.split_at(PUBLIC_KEY_LEN);
    if !verify_hmac(pake_key, &[sender.label(), public], tag) {
        return None;
    }
    public.try_into().ok()
}

/// Long-lived secret from a completed bootstrap
pub(crate) fn derive_secret(
    central_nonce: &[u8],
    pump_nonce: &[u8],
    shared: &[u8],
    pake_key: &[u8],
) -> Result<DerivedSecret> {
    let salt = [central_nonce, pump_nonce].concat();
    let ikm = [shared, pake_key].concat();
    Ok(DerivedSecret::new(crypto::hkdf_sha256(&salt, &ikm, SECRET_INFO)?))
}

/// Round 4 key-confirmation tag
pub(crate) fn confirmation_tag(
    secret: &DerivedSecret,
    role: Role,
    own_nonce: &[u8],
    peer_nonce: &[u8],
) -> [u8; TAG_LEN] {
    hmac_sha256(secret.as_bytes(), &[role.label(), own_nonce, peer_nonce])
}
