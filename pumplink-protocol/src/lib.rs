//! PumpLink Protocol Implementation
//!
//! This library provides a pure Rust implementation of the BLE link layer
//! spoken by insulin pumps, enabling a phone or computer to read pump
//! telemetry. The engine is read-only: it never issues therapy-changing
//! commands.
//!
//! Layers, bottom up:
//! - [`framing`]: frame encoding, chunking and reassembly
//! - [`transaction`]: request/response correlation by transaction id
//! - [`operation_queue`]: one BLE operation in flight at a time
//! - [`auth`]: challenge-response and PAKE handshakes
//! - [`reconnect`] and [`lifecycle`]: connection state machine and bond-loss
//!   detection
//! - [`stream_collector`]: multi-packet history log responses
//! - [`link`]: the [`PumpLink`] facade

pub mod auth;
pub mod config;
pub mod credentials;
pub mod decoder;
pub mod framing;
pub mod lifecycle;
pub mod link;
pub mod opcode;
pub mod operation_queue;
pub mod reconnect;
pub mod stream_collector;
pub mod transaction;
pub mod transport;

mod error;

pub use auth::{AuthProtocol, HandshakeFailure, PakeMode};
pub use config::LinkConfig;
pub use credentials::{
    CredentialStore, DerivedSecret, FileCredentialStore, MemoryCredentialStore,
};
pub use decoder::ResponseDecoder;
pub use error::{ProtocolError, Result};
pub use framing::Frame;
pub use lifecycle::ConnectionState;
pub use link::PumpLink;
pub use opcode::RequestOpcode;
pub use reconnect::{ReconnectPhase, ReconnectPolicy};
pub use transport::{
    event_channel, Channel, DisconnectReason, LinkHandle, PumpAddress, PumpTransport,
    TransportEvent,
};

#[cfg(test)]
pub mod test_utils;
