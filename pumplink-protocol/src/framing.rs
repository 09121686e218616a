//! Frame Encoding and Chunk Reassembly
//!
//! A logical message travels as one frame split into transport-sized chunks.
//!
//! ## Frame Layout
//!
//! ```text
//! ┌────────┬───────┬───────────┬──────────────────┬─────────────┐
//! │ opcode │ tx id │ cargo len │ cargo (0..=253)  │ CRC-16 (BE) │
//! │  (1B)  │ (1B)  │   (1B)    │                  │    (2B)     │
//! └────────┴───────┴───────────┴──────────────────┴─────────────┘
//! ```
//!
//! The checksum is CRC-16/IBM-3740 (CCITT-FALSE) over every preceding byte.
//!
//! ## Chunk Layout
//!
//! ```text
//! ┌───────────┬───────┬───────────────────────────┐
//! │ remaining │ tx id │ fragment (chunk_size - 2) │
//! │   (1B)    │ (1B)  │                           │
//! └───────────┴───────┴───────────────────────────┘
//! ```
//!
//! `remaining` counts the chunks still to come, so the last chunk carries 0.
//! Chunks of different transactions may interleave on the wire; the caller
//! keeps one [`FrameAssembler`] per transaction id.

use crate::{ProtocolError, Result};
use crc::{Crc, CRC_16_IBM_3740};
use tracing::debug;

/// Maximum cargo bytes in one frame
pub const MAX_CARGO_LEN: usize = 253;

/// opcode + tx id + cargo length
pub const FRAME_HEADER_LEN: usize = 3;

/// Trailing CRC-16
pub const CHECKSUM_LEN: usize = 2;

/// remaining counter + tx id
pub const CHUNK_HEADER_LEN: usize = 2;

/// Smallest chunk that still carries two fragment bytes
pub const MIN_CHUNK_SIZE: usize = 4;

/// Largest raw frame the assembler will buffer
pub const MAX_RAW_FRAME_LEN: usize = FRAME_HEADER_LEN + MAX_CARGO_LEN + CHECKSUM_LEN;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-16 over a byte slice
pub fn checksum(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// One logical protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Semantic class of the message
    pub opcode: u8,
    /// Correlates a request with its response
    pub tx_id: u8,
    /// Opaque payload, interpreted only by decoders
    pub cargo: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: u8, tx_id: u8, cargo: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            tx_id,
            cargo: cargo.into(),
        }
    }

    /// Serialize to raw frame bytes including the checksum
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::CargoTooLarge` if the cargo exceeds
    /// [`MAX_CARGO_LEN`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.cargo.len() > MAX_CARGO_LEN {
            return Err(ProtocolError::CargoTooLarge(self.cargo.len(), MAX_CARGO_LEN));
        }

        let mut raw = Vec::with_capacity(FRAME_HEADER_LEN + self.cargo.len() + CHECKSUM_LEN);
        raw.push(self.opcode);
        raw.push(self.tx_id);
        raw.push(self.cargo.len() as u8);
        raw.extend_from_slice(&self.cargo);
        raw.extend_from_slice(&checksum(&raw).to_be_bytes());
        Ok(raw)
    }
}

/// Encode a message into an ordered list of chunks
///
/// # Errors
///
/// Returns `ProtocolError::CargoTooLarge` for oversized cargo and
/// `ProtocolError::Configuration` if `chunk_size` is below
/// [`MIN_CHUNK_SIZE`].
///
/// # Examples
///
/// ```rust
/// use pumplink_protocol::framing::{encode, parse_header, FrameAssembler};
///
/// let chunks = encode(0x40, 7, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 8).unwrap();
/// assert_eq!(chunks.len(), 3);
///
/// let mut assembler = FrameAssembler::new();
/// let done: Vec<bool> = chunks.iter().map(|c| assembler.feed(c)).collect();
/// assert_eq!(done, vec![false, false, true]);
///
/// let frame = parse_header(&assembler.assemble()).unwrap();
/// assert_eq!(frame.opcode, 0x40);
/// assert_eq!(frame.tx_id, 7);
/// ```
pub fn encode(opcode: u8, tx_id: u8, cargo: &[u8], chunk_size: usize) -> Result<Vec<Vec<u8>>> {
    if chunk_size < MIN_CHUNK_SIZE {
        return Err(ProtocolError::Configuration(format!(
            "chunk size {} below minimum {}",
            chunk_size, MIN_CHUNK_SIZE
        )));
    }

    let raw = Frame::new(opcode, tx_id, cargo).to_bytes()?;
    let fragments: Vec<&[u8]> = raw.chunks(chunk_size - CHUNK_HEADER_LEN).collect();
    let total = fragments.len();

    Ok(fragments
        .into_iter()
        .enumerate()
        .map(|(index, fragment)| {
            let mut chunk = Vec::with_capacity(CHUNK_HEADER_LEN + fragment.len());
            chunk.push((total - 1 - index) as u8);
            chunk.push(tx_id);
            chunk.extend_from_slice(fragment);
            chunk
        })
        .collect())
}

/// Transaction id embedded in a chunk, used to route it to an assembler
pub fn chunk_tx_id(chunk: &[u8]) -> Option<u8> {
    chunk.get(1).copied()
}

/// Validate raw frame bytes and split them into header and cargo
///
/// Returns `None` for short input, a length byte that disagrees with the
/// input size, or a checksum mismatch. Never panics.
pub fn parse_header(raw: &[u8]) -> Option<Frame> {
    if raw.len() < FRAME_HEADER_LEN + CHECKSUM_LEN {
        return None;
    }

    let cargo_len = raw[2] as usize;
    if raw.len() != FRAME_HEADER_LEN + cargo_len + CHECKSUM_LEN {
        return None;
    }

    let (body, crc_bytes) = raw.split_at(raw.len() - CHECKSUM_LEN);
    let received = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
    if checksum(body) != received {
        return None;
    }

    Some(Frame {
        opcode: body[0],
        tx_id: body[1],
        cargo: body[FRAME_HEADER_LEN..].to_vec(),
    })
}

/// Reassembles the chunks of one frame
///
/// Scoped to a single transaction id; the owner routes chunks using
/// [`chunk_tx_id`].
#[derive(Debug, Default)]
pub struct FrameAssembler {
    tx_id: Option<u8>,
    next_remaining: Option<u8>,
    buffer: Vec<u8>,
    complete: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns true once a complete frame is buffered
    ///
    /// A chunk that does not continue the sequence in progress discards the
    /// partial frame and starts a new one.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if chunk.len() < CHUNK_HEADER_LEN {
            debug!("Ignoring short chunk ({} bytes)", chunk.len());
            return false;
        }

        let remaining = chunk[0];
        let tx_id = chunk[1];
        let fragment = &chunk[CHUNK_HEADER_LEN..];

        let continues = !self.complete
            && self.tx_id == Some(tx_id)
            && self.next_remaining == Some(remaining);

        if !continues {
            if self.next_remaining.is_some() {
                debug!(
                    "Discarding partial frame for tx {:?} ({} bytes buffered)",
                    self.tx_id,
                    self.buffer.len()
                );
            }
            self.reset();
            self.tx_id = Some(tx_id);
        }

        if self.buffer.len() + fragment.len() > MAX_RAW_FRAME_LEN {
            debug!("Frame for tx {} exceeds {} bytes, dropping", tx_id, MAX_RAW_FRAME_LEN);
            self.reset();
            return false;
        }
        self.buffer.extend_from_slice(fragment);

        if remaining == 0 {
            self.next_remaining = None;
            self.complete = true;
        } else {
            self.next_remaining = Some(remaining - 1);
        }
        self.complete
    }

    /// Whether a complete frame is waiting to be taken
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Take the buffered raw frame and reset for the next message
    pub fn assemble(&mut self) -> Vec<u8> {
        let raw = std::mem::take(&mut self.buffer);
        self.reset();
        raw
    }

    fn reset(&mut self) {
        self.tx_id = None;
        self.next_remaining = None;
        self.buffer.clear();
        self.complete = false;
    }
}
