//! PumpLink Transport Layer
//!
//! The engine talks to the radio through [`PumpTransport`]. Platform
//! backends implement it and push notifications, disconnects and
//! advertisements into the event channel.

mod r#trait;

#[cfg(feature = "bluez")]
pub mod bluetooth;

pub use r#trait::*;

#[cfg(feature = "bluez")]
pub use bluetooth::BluezTransport;
