//! Transport Trait Abstraction
//!
//! The BLE radio is an external collaborator. The engine drives it through
//! [`PumpTransport`] and learns about notifications and disconnects through
//! [`TransportEvent`]s pushed into an unbounded channel, the way the
//! transport managers forward their events.

use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::fmt::{self, Debug};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Pump GATT service UUID
pub const PUMP_SERVICE_UUID: Uuid = uuid::uuid!("0000fdfb-0000-1000-8000-00805f9b34fb");

/// Notification/write channels exposed by the pump
///
/// There is deliberately no control channel: nothing in the engine can
/// address the characteristic that changes pump state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Handshake requests and responses
    Authorization,
    /// Status requests and their responses
    CurrentStatus,
    /// Unsolicited "something changed" notices
    QualifyingEvents,
    /// Burst delivery of history log packets
    HistoryLog,
}

impl Channel {
    /// Every channel the engine subscribes to, authorization first
    pub const ALL: [Channel; 4] = [
        Channel::Authorization,
        Channel::CurrentStatus,
        Channel::QualifyingEvents,
        Channel::HistoryLog,
    ];

    /// GATT characteristic UUID backing this channel
    pub fn uuid(self) -> Uuid {
        match self {
            Channel::Authorization => uuid::uuid!("7b83fff9-9f77-4e5c-8064-aae2c24838b9"),
            Channel::CurrentStatus => uuid::uuid!("7b83fff6-9f77-4e5c-8064-aae2c24838b9"),
            Channel::QualifyingEvents => uuid::uuid!("7b83fff7-9f77-4e5c-8064-aae2c24838b9"),
            Channel::HistoryLog => uuid::uuid!("7b83fff8-9f77-4e5c-8064-aae2c24838b9"),
        }
    }

    /// Reverse lookup from a characteristic UUID
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Authorization => write!(f, "authorization"),
            Channel::CurrentStatus => write!(f, "current-status"),
            Channel::QualifyingEvents => write!(f, "qualifying-events"),
            Channel::HistoryLog => write!(f, "history-log"),
        }
    }
}

/// Bluetooth address of a pump (e.g. "00:11:22:33:44:55")
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PumpAddress(String);

impl PumpAddress {
    /// Parse and normalise a colon-separated MAC address
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pumplink_protocol::PumpAddress;
    ///
    /// let address = PumpAddress::parse("aa:bb:cc:00:11:22").unwrap();
    /// assert_eq!(address.to_string(), "AA:BB:CC:00:11:22");
    /// assert!(PumpAddress::parse("invalid").is_err());
    /// ```
    pub fn parse(address: &str) -> Result<Self> {
        let octets: Vec<&str> = address.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(ProtocolError::Configuration(format!(
                "Invalid Bluetooth address '{}'",
                address
            )));
        }
        Ok(Self(address.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PumpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one physical link; events from older links are ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Why a link went down, from the HCI/GATT status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// 0x05: the pump rejected our bond
    InsufficientAuthentication,
    /// 0x0F: link encryption could not be established
    InsufficientEncryption,
    /// 0x13: the pump closed the link
    PeerTerminated,
    /// 0x08: supervision timeout (out of range)
    ConnectionTimeout,
    /// 0x16: we closed the link
    LocalHostTerminated,
    /// 0x3E: the link never came up
    FailedToEstablish,
    /// connect() itself returned an error
    ConnectFailed,
    /// The transport saw the link drop but cannot say why
    Unknown,
    /// Any other status code
    Other(u8),
}

impl DisconnectReason {
    pub fn from_status(status: u8) -> Self {
        match status {
            0x05 => DisconnectReason::InsufficientAuthentication,
            0x0F => DisconnectReason::InsufficientEncryption,
            0x13 => DisconnectReason::PeerTerminated,
            0x08 => DisconnectReason::ConnectionTimeout,
            0x16 => DisconnectReason::LocalHostTerminated,
            0x3E => DisconnectReason::FailedToEstablish,
            other => DisconnectReason::Other(other),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::InsufficientAuthentication => write!(f, "insufficient authentication"),
            DisconnectReason::InsufficientEncryption => write!(f, "insufficient encryption"),
            DisconnectReason::PeerTerminated => write!(f, "terminated by pump"),
            DisconnectReason::ConnectionTimeout => write!(f, "supervision timeout"),
            DisconnectReason::LocalHostTerminated => write!(f, "terminated locally"),
            DisconnectReason::FailedToEstablish => write!(f, "failed to establish"),
            DisconnectReason::ConnectFailed => write!(f, "connect failed"),
            DisconnectReason::Unknown => write!(f, "unknown reason"),
            DisconnectReason::Other(code) => write!(f, "status 0x{:02x}", code),
        }
    }
}

/// What service discovery found on the pump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service_uuid: Uuid,
    pub channels: Vec<Channel>,
}

impl ServiceDescriptor {
    /// Descriptor for a pump exposing every channel
    pub fn full() -> Self {
        Self {
            service_uuid: PUMP_SERVICE_UUID,
            channels: Channel::ALL.to_vec(),
        }
    }

    pub fn supports(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }
}

/// Asynchronous events raised by the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A notification arrived on a subscribed channel
    Data {
        handle: LinkHandle,
        channel: Channel,
        bytes: Vec<u8>,
    },

    /// The link went down
    Disconnected {
        handle: LinkHandle,
        reason: DisconnectReason,
    },

    /// A passive watch saw the pump advertising again
    DeviceInRange { address: PumpAddress },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the channel a transport uses to report events to the engine
pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// BLE central operations the engine needs from the platform
///
/// Only the connection lifecycle holds the transport directly; every write
/// goes through the operation queue.
#[async_trait]
pub trait PumpTransport: Send + Sync + Debug {
    /// Open a link to the pump
    async fn connect(&self, address: &PumpAddress) -> Result<LinkHandle>;

    /// Close a link
    async fn disconnect(&self, handle: LinkHandle) -> Result<()>;

    /// Request a maximum characteristic payload; returns what was granted
    async fn negotiate_max_payload(&self, handle: LinkHandle, size: usize) -> Result<usize>;

    /// Discover the pump's GATT service layout
    async fn discover_capabilities(&self, handle: LinkHandle) -> Result<ServiceDescriptor>;

    /// Enable notifications on a channel
    async fn subscribe(&self, handle: LinkHandle, channel: Channel) -> Result<()>;

    /// Write one chunk to a channel; resolves once the write completed
    async fn write(&self, handle: LinkHandle, channel: Channel, bytes: &[u8]) -> Result<()>;

    /// Forget the transport-level bond with the pump
    async fn remove_bond(&self, address: &PumpAddress) -> Result<()>;

    /// Keep a passive "connect when back in range" watch open
    ///
    /// The transport raises [`TransportEvent::DeviceInRange`] when it sees
    /// the pump again.
    async fn watch_for_device(&self, address: &PumpAddress) -> Result<()>;

    /// Cancel a passive watch
    async fn stop_watching(&self, _address: &PumpAddress) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_codes() {
        assert_eq!(
            DisconnectReason::from_status(0x05),
            DisconnectReason::InsufficientAuthentication
        );
        assert_eq!(
            DisconnectReason::from_status(0x13),
            DisconnectReason::PeerTerminated
        );
        assert_eq!(
            DisconnectReason::from_status(0x0F),
            DisconnectReason::InsufficientEncryption
        );
        assert_eq!(DisconnectReason::from_status(0x22), DisconnectReason::Other(0x22));
        assert_eq!(DisconnectReason::Other(0x22).to_string(), "status 0x22");
        assert_eq!(DisconnectReason::Unknown.to_string(), "unknown reason");
    }

    #[test]
    fn test_channel_uuid_lookup() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_uuid(channel.uuid()), Some(channel));
        }
        assert_eq!(Channel::from_uuid(PUMP_SERVICE_UUID), None);
    }

    #[test]
    fn test_address_parsing() {
        assert!(PumpAddress::parse("00:11:22:33:44:55").is_ok());
        assert!(PumpAddress::parse("00:11:22:33:44").is_err());
        assert!(PumpAddress::parse("00:11:22:33:44:zz").is_err());
    }

    #[test]
    fn test_service_descriptor() {
        let descriptor = ServiceDescriptor::full();
        assert!(descriptor.supports(Channel::HistoryLog));

        let partial = ServiceDescriptor {
            service_uuid: PUMP_SERVICE_UUID,
            channels: vec![Channel::Authorization],
        };
        assert!(!partial.supports(Channel::CurrentStatus));
    }
}
