//! Cryptographic primitives used by the handshakes.
//!
//! Thin wrappers over `ring` and `spake2` so the state machines deal in
//! fixed-size byte arrays and [`ProtocolError`] instead of each crate's
//! own error type.

use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{hkdf, hmac};
use spake2::{Ed25519Group, Identity, Password, Spake2};

use crate::{ProtocolError, Result};

/// Length of an X25519 public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an HMAC-SHA256 tag
pub const TAG_LEN: usize = 32;

/// Salt for stretching the pairing code into the SPAKE2 password
const PASSWORD_SALT: &[u8] = b"pumplink-pairing-v1";

/// Which side of the handshake produced a value.
///
/// Every MAC is domain-separated by role so a tag can never be reflected
/// back at its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Central,
    Pump,
}

impl Role {
    #[must_use]
    pub fn label(self) -> &'static [u8] {
        match self {
            Role::Central => b"central",
            Role::Pump => b"pump",
        }
    }
}

/// Fills a fixed-size array from the system RNG.
///
/// # Errors
///
/// Returns `ProtocolError::Crypto` if the RNG is unavailable.
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    SystemRandom::new()
        .fill(&mut out)
        .map_err(|_| ProtocolError::Crypto("system RNG unavailable".to_string()))?;
    Ok(out)
}

/// HMAC-SHA256 over the concatenation of `parts`.
#[must_use]
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; TAG_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let mut ctx = hmac::Context::with_key(&key);
    for part in parts {
        ctx.update(part);
    }
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(ctx.sign().as_ref());
    out
}

/// Constant-time check of an HMAC-SHA256 tag.
#[must_use]
pub fn verify_hmac(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let message = parts.concat();
    hmac::verify(&key, &message, tag).is_ok()
}

/// HKDF-SHA256 extract-and-expand to 32 bytes.
///
/// # Errors
///
/// Returns `ProtocolError::Crypto` if expansion fails.
pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(ikm);
    let info = [info];
    let okm = prk.expand(&info, hkdf::HKDF_SHA256)?;
    let mut out = [0u8; 32];
    okm.fill(&mut out)?;
    Ok(out)
}

/// Stretches a pairing code into the key that binds the exchange to it.
///
/// # Errors
///
/// Returns `ProtocolError::Crypto` if key derivation fails.
pub fn password_key(code: &str) -> Result<[u8; 32]> {
    hkdf_sha256(PASSWORD_SALT, code.as_bytes(), b"password key")
}

/// An ephemeral X25519 key pair, consumed by [`agree`].
pub struct KeyShare {
    pub private: EphemeralPrivateKey,
    pub public: [u8; PUBLIC_KEY_LEN],
}

impl std::fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyShare")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Generates a fresh X25519 key pair.
///
/// # Errors
///
/// Returns `ProtocolError::Crypto` if key generation fails.
pub fn generate_key_share() -> Result<KeyShare> {
    let rng = SystemRandom::new();
    let private = EphemeralPrivateKey::generate(&X25519, &rng)?;
    let public_key = private.compute_public_key()?;

    let mut public = [0u8; PUBLIC_KEY_LEN];
    public.copy_from_slice(public_key.as_ref());
    Ok(KeyShare { private, public })
}

/// X25519 Diffie-Hellman with the peer's public key.
///
/// # Errors
///
/// Returns `ProtocolError::Crypto` for an invalid peer key.
pub fn agree(private: EphemeralPrivateKey, peer_public: &[u8]) -> Result<[u8; 32]> {
    let peer = UnparsedPublicKey::new(&X25519, peer_public);
    agreement::agree_ephemeral(private, &peer, |material| {
        let mut out = [0u8; 32];
        out.copy_from_slice(material);
        out
    })
    .map_err(|_| ProtocolError::Crypto("key agreement failed".to_string()))
}

/// One side of a SPAKE2 exchange, consumed by [`finish_pake`].
pub struct PakeShare {
    state: Spake2<Ed25519Group>,
    /// Message for the peer
    pub message: Vec<u8>,
}

impl std::fmt::Debug for PakeShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PakeShare")
            .field("message", &hex::encode(&self.message))
            .finish_non_exhaustive()
    }
}

/// Starts SPAKE2 over Ed25519 keyed by the stretched pairing code.
///
/// The central plays side A and the pump side B; identities are the role
/// labels.
#[must_use]
pub fn start_pake(password_key: &[u8], role: Role) -> PakeShare {
    let password = Password::new(password_key);
    let central = Identity::new(Role::Central.label());
    let pump = Identity::new(Role::Pump.label());
    let (state, message) = match role {
        Role::Central => Spake2::<Ed25519Group>::start_a(&password, &central, &pump),
        Role::Pump => Spake2::<Ed25519Group>::start_b(&password, &central, &pump),
    };
    PakeShare { state, message }
}

/// Completes SPAKE2 with the peer's message.
///
/// Both sides get the same key only if they used the same pairing code; a
/// mismatch shows up later as a failed key confirmation.
///
/// # Errors
///
/// Returns `ProtocolError::Crypto` for a malformed peer message.
pub fn finish_pake(share: PakeShare, peer_message: &[u8]) -> Result<[u8; 32]> {
    let key = share
        .state
        .finish(peer_message)
        .map_err(|_| ProtocolError::Crypto("invalid PAKE message".to_string()))?;
    key.as_slice()
        .try_into()
        .map_err(|_| ProtocolError::Crypto(format!("PAKE key of {} bytes", key.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pake_agrees_only_on_same_code() {
        let k_pw = password_key("482913").unwrap();
        let central = start_pake(&k_pw, Role::Central);
        let pump = start_pake(&k_pw, Role::Pump);
        let (to_pump, to_central) = (central.message.clone(), pump.message.clone());
        assert_eq!(
            finish_pake(central, &to_central).unwrap(),
            finish_pake(pump, &to_pump).unwrap()
        );

        let central = start_pake(&k_pw, Role::Central);
        let pump = start_pake(&password_key("111111").unwrap(), Role::Pump);
        let (to_pump, to_central) = (central.message.clone(), pump.message.clone());
        assert_ne!(
            finish_pake(central, &to_central).unwrap(),
            finish_pake(pump, &to_pump).unwrap()
        );
    }

    #[test]
    fn test_pake_rejects_garbage_message() {
        let share = start_pake(&[1; 32], Role::Central);
        assert!(finish_pake(share, &[0; 5]).is_err());
    }

    #[test]
    fn test_hmac_verify() {
        let tag = hmac_sha256(b"key", &[b"a", b"bc"]);
        assert!(verify_hmac(b"key", &[b"abc"], &tag));
        assert!(!verify_hmac(b"other", &[b"abc"], &tag));
        assert!(!verify_hmac(b"key", &[b"abd"], &tag));
    }

    #[test]
    fn test_password_key_depends_on_code() {
        let a = password_key("482913").unwrap();
        let b = password_key("482914").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, password_key("482913").unwrap());
    }

    #[test]
    fn test_key_agreement_is_symmetric() {
        let central = generate_key_share().unwrap();
        let pump = generate_key_share().unwrap();
        let central_public = central.public;
        let pump_public = pump.public;

        let a = agree(central.private, &pump_public).unwrap();
        let b = agree(pump.private, &central_public).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_agreement_rejects_bad_key() {
        let central = generate_key_share().unwrap();
        assert!(agree(central.private, &[0u8; 5]).is_err());
    }

    #[test]
    fn test_random_bytes_differ() {
        let a: [u8; 16] = random_bytes().unwrap();
        let b: [u8; 16] = random_bytes().unwrap();
        assert_ne!(a, b);
    }
}
