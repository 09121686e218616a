//! Bluetooth Transport for PumpLink
//!
//! BLE GATT central backed by BlueZ through the bluer crate. Enabled with
//! the `bluez` feature.
//!
//! ## Connection Flow
//!
//! 1. The lifecycle asks for a link; BlueZ connects (and bonds) the device
//! 2. Service discovery maps the pump service characteristics to [`Channel`]s
//! 3. Subscriptions start a forwarding task per characteristic that turns
//!    notifications into [`TransportEvent::Data`]
//! 4. A device watcher reports `Connected = false` as a disconnect
//!
//! BlueZ does not surface HCI disconnect codes over D-Bus, so a link that
//! drops without a local request is reported as
//! [`DisconnectReason::Unknown`] and never counts towards bond loss.
//!
//! The device watcher stays up until stopped and reports every
//! advertisement it sees from the pump (discovery or an RSSI update), so a
//! pump that comes and goes can wake the lifecycle more than once.

use crate::transport::{
    Channel, DisconnectReason, LinkHandle, PumpAddress, PumpTransport, ServiceDescriptor,
    TransportEvent, TransportEventSender, PUMP_SERVICE_UUID,
};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Default timeout for Bluetooth operations
const BT_TIMEOUT: Duration = Duration::from_secs(15);

/// ATT header bytes subtracted from the MTU
const ATT_HEADER_LEN: usize = 3;

type DeviceEvents = Pin<Box<dyn Stream<Item = DeviceEvent> + Send>>;

enum Sighting {
    Pump,
    Nothing,
    DeviceGone,
    DiscoveryEnded,
}

struct Link {
    address: PumpAddress,
    device: Device,
    characteristics: HashMap<Channel, Characteristic>,
    tasks: Vec<JoinHandle<()>>,
    closing: Arc<AtomicBool>,
}

impl Link {
    fn characteristic(&self, channel: Channel) -> Result<&Characteristic> {
        self.characteristics.get(&channel).ok_or_else(|| {
            ProtocolError::transport(format!("{} characteristic not discovered", channel))
        })
    }
}

/// [`PumpTransport`] on the default BlueZ adapter
pub struct BluezTransport {
    adapter: Adapter,
    events: TransportEventSender,
    next_handle: AtomicU64,
    links: Mutex<HashMap<LinkHandle, Link>>,
    watchers: Mutex<HashMap<PumpAddress, JoinHandle<()>>>,
}

impl std::fmt::Debug for BluezTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluezTransport")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

fn bluez_error(e: bluer::Error) -> ProtocolError {
    ProtocolError::transport(e)
}

fn parse_address(address: &PumpAddress) -> Result<Address> {
    Address::from_str(address.as_str()).map_err(|e| {
        ProtocolError::Configuration(format!("Invalid Bluetooth address '{}': {}", address, e))
    })
}

impl BluezTransport {
    /// Open a BlueZ session and power on the default adapter
    pub async fn new(events: TransportEventSender) -> Result<Self> {
        let session = Session::new().await.map_err(bluez_error)?;
        let adapter = session.default_adapter().await.map_err(bluez_error)?;
        adapter.set_powered(true).await.map_err(bluez_error)?;
        info!("Using Bluetooth adapter {}", adapter.name());

        Ok(Self {
            adapter,
            events,
            next_handle: AtomicU64::new(1),
            links: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Forward `Connected = false` from BlueZ as a disconnect event
    async fn watch_connection(
        &self,
        handle: LinkHandle,
        device: &Device,
        closing: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let mut device_events = Box::pin(device.events().await.map_err(bluez_error)?);
        let events = self.events.clone();

        Ok(tokio::spawn(async move {
            while let Some(event) = device_events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    if !closing.load(Ordering::SeqCst) {
                        debug!("{} dropped by BlueZ", handle);
                        let _ = events.send(TransportEvent::Disconnected {
                            handle,
                            reason: DisconnectReason::Unknown,
                        });
                    }
                    break;
                }
            }
        }))
    }

    async fn discover(&self, handle: LinkHandle) -> Result<HashMap<Channel, Characteristic>> {
        let device = {
            let links = self.links.lock().await;
            let link = links.get(&handle).ok_or(ProtocolError::NotConnected)?;
            link.device.clone()
        };

        let mut found = HashMap::new();
        for service in device.services().await.map_err(bluez_error)? {
            if service.uuid().await.map_err(bluez_error)? != PUMP_SERVICE_UUID {
                continue;
            }
            for characteristic in service.characteristics().await.map_err(bluez_error)? {
                let uuid = characteristic.uuid().await.map_err(bluez_error)?;
                if let Some(channel) = Channel::from_uuid(uuid) {
                    found.insert(channel, characteristic);
                }
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl PumpTransport for BluezTransport {
    async fn connect(&self, address: &PumpAddress) -> Result<LinkHandle> {
        let device = self.adapter.device(parse_address(address)?).map_err(bluez_error)?;

        if !device.is_connected().await.map_err(bluez_error)? {
            debug!("Connecting to {}", address);
            timeout(BT_TIMEOUT, device.connect())
                .await
                .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", address)))?
                .map_err(bluez_error)?;
        }

        let handle = LinkHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let closing = Arc::new(AtomicBool::new(false));
        let watcher = self.watch_connection(handle, &device, closing.clone()).await?;

        self.links.lock().await.insert(
            handle,
            Link {
                address: address.clone(),
                device,
                characteristics: HashMap::new(),
                tasks: vec![watcher],
                closing,
            },
        );
        info!("Connected to {} as {}", address, handle);
        Ok(handle)
    }

    async fn disconnect(&self, handle: LinkHandle) -> Result<()> {
        let Some(link) = self.links.lock().await.remove(&handle) else {
            return Ok(());
        };
        link.closing.store(true, Ordering::SeqCst);
        for task in &link.tasks {
            task.abort();
        }
        if let Err(e) = link.device.disconnect().await {
            warn!("Failed to disconnect {}: {}", link.address, e);
        }
        let _ = self.events.send(TransportEvent::Disconnected {
            handle,
            reason: DisconnectReason::LocalHostTerminated,
        });
        Ok(())
    }

    async fn negotiate_max_payload(&self, handle: LinkHandle, size: usize) -> Result<usize> {
        // BlueZ exchanges the MTU on its own; report what it settled on.
        let characteristics = self.discover(handle).await?;
        let Some(characteristic) = characteristics.values().next() else {
            return Ok(size);
        };
        let mtu = characteristic.mtu().await.map_err(bluez_error)? as usize;
        Ok(size.min(mtu.saturating_sub(ATT_HEADER_LEN)))
    }

    async fn discover_capabilities(&self, handle: LinkHandle) -> Result<ServiceDescriptor> {
        let characteristics = self.discover(handle).await?;
        let mut channels: Vec<Channel> = characteristics.keys().copied().collect();
        channels.sort();

        let mut links = self.links.lock().await;
        let link = links.get_mut(&handle).ok_or(ProtocolError::NotConnected)?;
        link.characteristics = characteristics;

        Ok(ServiceDescriptor {
            service_uuid: PUMP_SERVICE_UUID,
            channels,
        })
    }

    async fn subscribe(&self, handle: LinkHandle, channel: Channel) -> Result<()> {
        let characteristic = {
            let links = self.links.lock().await;
            let link = links.get(&handle).ok_or(ProtocolError::NotConnected)?;
            link.characteristic(channel)?.clone()
        };

        let mut notifications = Box::pin(characteristic.notify().await.map_err(bluez_error)?);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Some(bytes) = notifications.next().await {
                if events
                    .send(TransportEvent::Data {
                        handle,
                        channel,
                        bytes,
                    })
                    .is_err()
                {
                    break;
                }
            }
            debug!("{} notifications on {} ended", channel, handle);
        });

        let mut links = self.links.lock().await;
        match links.get_mut(&handle) {
            Some(link) => link.tasks.push(task),
            None => {
                task.abort();
                return Err(ProtocolError::NotConnected);
            }
        }
        Ok(())
    }

    async fn write(&self, handle: LinkHandle, channel: Channel, bytes: &[u8]) -> Result<()> {
        let characteristic = {
            let links = self.links.lock().await;
            let link = links.get(&handle).ok_or(ProtocolError::NotConnected)?;
            link.characteristic(channel)?.clone()
        };
        timeout(BT_TIMEOUT, characteristic.write(bytes))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("write on {}", channel)))?
            .map_err(bluez_error)
    }

    async fn remove_bond(&self, address: &PumpAddress) -> Result<()> {
        info!("Removing bond with {}", address);
        self.adapter
            .remove_device(parse_address(address)?)
            .await
            .map_err(bluez_error)
    }

    async fn watch_for_device(&self, address: &PumpAddress) -> Result<()> {
        let target = parse_address(address)?;
        let mut discovered = Box::pin(self.adapter.discover_devices().await.map_err(bluez_error)?);
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let pump = address.clone();

        let task = tokio::spawn(async move {
            let mut advertisements: Option<DeviceEvents> = None;
            loop {
                let rssi = async {
                    match advertisements.as_mut() {
                        Some(stream) => stream.next().await,
                        None => std::future::pending().await,
                    }
                };
                let sighting = tokio::select! {
                    event = discovered.next() => match event {
                        Some(AdapterEvent::DeviceAdded(found)) if found == target => Sighting::Pump,
                        Some(_) => Sighting::Nothing,
                        None => Sighting::DiscoveryEnded,
                    },
                    event = rssi => match event {
                        Some(DeviceEvent::PropertyChanged(DeviceProperty::Rssi(_))) => Sighting::Pump,
                        Some(_) => Sighting::Nothing,
                        None => Sighting::DeviceGone,
                    },
                };
                match sighting {
                    Sighting::Pump => {}
                    Sighting::Nothing => continue,
                    Sighting::DeviceGone => {
                        advertisements = None;
                        continue;
                    }
                    Sighting::DiscoveryEnded => break,
                }

                debug!("{} advertising", pump);
                if events
                    .send(TransportEvent::DeviceInRange {
                        address: pump.clone(),
                    })
                    .is_err()
                {
                    break;
                }
                if advertisements.is_none() {
                    advertisements = match adapter.device(target) {
                        Ok(device) => device
                            .events()
                            .await
                            .ok()
                            .map(|stream| Box::pin(stream) as DeviceEvents),
                        Err(e) => {
                            warn!("Cannot follow {} advertisements: {}", pump, e);
                            None
                        }
                    };
                }
            }
            debug!("Stopped watching for {}", pump);
        });

        if let Some(previous) = self.watchers.lock().await.insert(address.clone(), task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_watching(&self, address: &PumpAddress) -> Result<()> {
        if let Some(task) = self.watchers.lock().await.remove(address) {
            task.abort();
        }
        Ok(())
    }
}
