//! Test doubles: a scripted BLE transport and a simulated pump.
//!
//! [`MockTransport`] records every operation, can inject failures and
//! delays, and, when a [`SimulatedPump`] is attached, reassembles written
//! chunks and feeds the pump's answers back as transport events.

use crate::auth::challenge::{challenge_proof, CHALLENGE_SIZE};
use crate::auth::crypto::{
    agree, finish_pake, generate_key_share, password_key, random_bytes, start_pake, verify_hmac,
    Role,
};
use crate::auth::pake::{
    authenticated_share, commitment, confirmation_tag, derive_secret, open_share, NONCE_SIZE,
};
use crate::auth::STATUS_OK;
use crate::credentials::DerivedSecret;
use crate::framing::{self, Frame, FrameAssembler};
use crate::opcode::{auth as op, session};
use crate::operation_queue::OperationKind;
use crate::transport::{
    event_channel, Channel, DisconnectReason, LinkHandle, PumpAddress, PumpTransport,
    ServiceDescriptor, TransportEvent, TransportEventReceiver, TransportEventSender,
};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const PUMP_ADDRESS: &str = "00:11:22:33:44:55";

/// Route engine logs to the test output, honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Opcode stamped on history log packets
pub const HISTORY_PACKET_OPCODE: u8 = 0x61;

const REJECTED: u8 = 1;

/// Pump side of both handshakes plus canned status answers
pub struct SimulatedPump {
    code: String,
    derived_secret: Option<DerivedSecret>,
    pending_secret: Option<DerivedSecret>,
    pump_challenge: [u8; CHALLENGE_SIZE],
    central_challenge: Vec<u8>,
    central_message: Vec<u8>,
    pump_message: Vec<u8>,
    pake_key: Option<[u8; 32]>,
    shared: Option<[u8; 32]>,
    central_nonce: Vec<u8>,
    pump_nonce: [u8; NONCE_SIZE],
    history: Vec<Vec<u8>>,
    history_interval: Duration,
    silent: bool,
    handshake_opcodes: Vec<u8>,
    transcript: Vec<(u8, Vec<u8>)>,
    ignored_opcode: Option<u8>,
    status_opcodes: Vec<u8>,
}

impl SimulatedPump {
    pub const API_VERSION: [u8; 4] = [2, 0, 5, 0];

    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            derived_secret: None,
            pending_secret: None,
            pump_challenge: [0x5a; CHALLENGE_SIZE],
            central_challenge: Vec::new(),
            central_message: Vec::new(),
            pump_message: Vec::new(),
            pake_key: None,
            shared: None,
            central_nonce: Vec::new(),
            pump_nonce: [0; NONCE_SIZE],
            history: Vec::new(),
            history_interval: Duration::from_millis(50),
            silent: false,
            handshake_opcodes: Vec::new(),
            transcript: Vec::new(),
            ignored_opcode: None,
            status_opcodes: Vec::new(),
        }
    }

    /// Packets streamed after a history log request
    pub fn with_history(mut self, packets: Vec<Vec<u8>>, interval: Duration) -> Self {
        self.history = packets;
        self.history_interval = interval;
        self
    }

    pub fn derived_secret(&self) -> Option<&DerivedSecret> {
        self.derived_secret.as_ref()
    }

    /// Handshake payloads of the current link as `(opcode, payload)`,
    /// requests and accepted answers alike
    pub fn handshake_transcript(&self) -> Vec<(u8, Vec<u8>)> {
        self.transcript.clone()
    }

    /// Forget per-link state, as the real pump does on a new connection
    pub fn new_link(&mut self) {
        self.pending_secret = None;
        self.pake_key = None;
        self.shared = None;
        self.handshake_opcodes.clear();
        self.transcript.clear();
        self.status_opcodes.clear();
    }

    /// Answer one handshake request; `None` for opcodes the pump ignores
    pub fn answer_handshake(&mut self, opcode: u8, cargo: &[u8]) -> Option<(u8, Vec<u8>)> {
        if cargo.len() < 2 {
            return None;
        }
        self.handshake_opcodes.push(opcode);
        if self.ignored_opcode == Some(opcode) {
            return None;
        }
        let (app_id, payload) = cargo.split_at(2);
        self.transcript.push((opcode, payload.to_vec()));

        let answer = match opcode {
            op::CENTRAL_CHALLENGE_REQUEST => {
                self.central_challenge = payload.to_vec();
                self.pump_challenge = random_bytes().ok()?;
                Ok(self.pump_challenge.to_vec())
            }
            op::PUMP_CHALLENGE_REQUEST => {
                let expected = challenge_proof(
                    self.code.as_bytes(),
                    &self.pump_challenge,
                    &self.central_challenge,
                );
                if payload == expected {
                    Ok(Vec::new())
                } else {
                    Err(())
                }
            }
            op::PAKE_ROUND_1A_REQUEST => {
                self.new_link();
                self.handshake_opcodes.push(opcode);
                self.transcript.push((opcode, payload.to_vec()));
                let share = start_pake(&password_key(&self.code).ok()?, Role::Pump);
                self.central_message = payload.to_vec();
                self.pump_message = share.message.clone();
                match finish_pake(share, payload) {
                    Ok(key) => {
                        self.pake_key = Some(key);
                        Ok(self.pump_message.clone())
                    }
                    Err(_) => Err(()),
                }
            }
            op::PAKE_ROUND_1B_REQUEST => {
                let key = self.pake_key?;
                let parts = [Role::Central.label(), &self.central_message[..], &self.pump_message[..]];
                if verify_hmac(&key, &parts, payload) {
                    Ok(commitment(&key, Role::Pump, &self.pump_message, &self.central_message).to_vec())
                } else {
                    Err(())
                }
            }
            op::PAKE_ROUND_2_REQUEST => {
                let key = self.pake_key?;
                match open_share(&key, Role::Central, payload) {
                    Some(central_public) => {
                        let share = generate_key_share().ok()?;
                        self.shared = agree(share.private, &central_public).ok();
                        Ok(authenticated_share(&key, Role::Pump, &share.public))
                    }
                    None => Err(()),
                }
            }
            op::PAKE_ROUND_3_REQUEST => {
                self.central_nonce = payload.to_vec();
                self.pump_nonce = random_bytes().ok()?;
                self.pending_secret = match (self.shared, self.pake_key) {
                    (Some(shared), Some(key)) => {
                        derive_secret(&self.central_nonce, &self.pump_nonce, &shared, &key).ok()
                    }
                    _ => self.derived_secret.clone(),
                };
                match self.pending_secret {
                    Some(_) => Ok(self.pump_nonce.to_vec()),
                    None => Err(()),
                }
            }
            op::PAKE_ROUND_4_REQUEST => match self.pending_secret.take() {
                Some(secret) => {
                    let expected = confirmation_tag(
                        &secret,
                        Role::Central,
                        &self.central_nonce,
                        &self.pump_nonce,
                    );
                    if payload == expected {
                        let tag = confirmation_tag(
                            &secret,
                            Role::Pump,
                            &self.pump_nonce,
                            &self.central_nonce,
                        );
                        self.derived_secret = Some(secret);
                        self.shared = None;
                        self.pake_key = None;
                        Ok(tag.to_vec())
                    } else {
                        Err(())
                    }
                }
                None => Err(()),
            },
            _ => return None,
        };

        let mut response = app_id.to_vec();
        match answer {
            Ok(body) => {
                self.transcript.push((opcode + 1, body.clone()));
                response.push(STATUS_OK);
                response.extend_from_slice(&body);
            }
            Err(()) => response.push(REJECTED),
        }
        Some((opcode + 1, response))
    }

    /// Answer one status request; `None` while silenced
    pub fn answer_status(&mut self, opcode: u8, _cargo: &[u8]) -> Option<Vec<u8>> {
        self.status_opcodes.push(opcode);
        if self.silent {
            return None;
        }
        Some(match opcode {
            session::API_VERSION_REQUEST => Self::API_VERSION.to_vec(),
            session::PUMP_VERSION_REQUEST => vec![7, 1, 0, 0, 0x2a, 0, 0, 0],
            session::TIME_SINCE_RESET_REQUEST => 86_400u32.to_le_bytes().to_vec(),
            session::HISTORY_LOG_REQUEST => vec![STATUS_OK],
            _ => vec![0; 4],
        })
    }
}

/// How the next `connect` call behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehaviour {
    Accept,
    Fail,
    /// Connect, then immediately report the link lost
    DropAfterConnect(DisconnectReason),
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    current: Option<LinkHandle>,
    connect_script: VecDeque<ConnectBehaviour>,
    connects: usize,
    max_payload: usize,
    descriptor: Option<ServiceDescriptor>,
    write_delay: Duration,
    fail_writes: usize,
    log: Vec<OperationKind>,
    active: usize,
    max_active: usize,
    bonds_removed: Vec<PumpAddress>,
    watching: Vec<PumpAddress>,
    pump: Option<SimulatedPump>,
    corrupt_next_status: bool,
    assemblers: HashMap<(Channel, u8), FrameAssembler>,
    stream_tx_id: u8,
}

/// Scripted [`PumpTransport`]
pub struct MockTransport {
    state: Mutex<MockState>,
    events: Option<TransportEventSender>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport").finish_non_exhaustive()
    }
}

impl MockTransport {
    /// A transport without an event channel or pump
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                max_payload: 20,
                ..MockState::default()
            }),
            events: None,
        })
    }

    /// A transport wired to a simulated pump
    pub fn with_pump(pump: SimulatedPump) -> (Arc<Self>, TransportEventReceiver) {
        let (events, receiver) = event_channel();
        let transport = Arc::new(Self {
            state: Mutex::new(MockState {
                max_payload: 20,
                pump: Some(pump),
                ..MockState::default()
            }),
            events: Some(events),
        });
        (transport, receiver)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.lock().write_delay = delay;
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.lock().fail_writes = count;
    }

    pub fn set_descriptor(&self, descriptor: ServiceDescriptor) {
        self.lock().descriptor = Some(descriptor);
    }

    pub fn push_connect(&self, behaviour: ConnectBehaviour) {
        self.lock().connect_script.push_back(behaviour);
    }

    pub fn silence_pump(&self, silent: bool) {
        if let Some(pump) = self.lock().pump.as_mut() {
            pump.silent = silent;
        }
    }

    /// Make the pump swallow every handshake request with this opcode
    pub fn ignore_handshake_opcode(&self, opcode: u8) {
        if let Some(pump) = self.lock().pump.as_mut() {
            pump.ignored_opcode = Some(opcode);
        }
    }

    /// Flip a bit in the last chunk of the next CurrentStatus answer
    pub fn corrupt_next_status_response(&self) {
        self.lock().corrupt_next_status = true;
    }

    pub fn operation_log(&self) -> Vec<OperationKind> {
        self.lock().log.clone()
    }

    pub fn max_concurrent_operations(&self) -> usize {
        self.lock().max_active
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn bonds_removed(&self) -> Vec<PumpAddress> {
        self.lock().bonds_removed.clone()
    }

    pub fn watch_requests(&self) -> Vec<PumpAddress> {
        self.lock().watching.clone()
    }

    pub fn pump_secret(&self) -> Option<DerivedSecret> {
        self.lock().pump.as_ref().and_then(|p| p.derived_secret.clone())
    }

    pub fn pump_handshake_opcodes(&self) -> Vec<u8> {
        self.lock()
            .pump
            .as_ref()
            .map(|p| p.handshake_opcodes.clone())
            .unwrap_or_default()
    }

    pub fn pump_status_opcodes(&self) -> Vec<u8> {
        self.lock()
            .pump
            .as_ref()
            .map(|p| p.status_opcodes.clone())
            .unwrap_or_default()
    }

    /// Report the current link as lost
    pub fn drop_link(&self, reason: DisconnectReason) {
        let handle = self.lock().current.take();
        if let Some(handle) = handle {
            self.emit(TransportEvent::Disconnected { handle, reason });
        }
    }

    /// Raise a "device in range" event
    pub fn announce_in_range(&self, address: &PumpAddress) {
        self.emit(TransportEvent::DeviceInRange {
            address: address.clone(),
        });
    }

    fn begin_operation(&self, kind: OperationKind) -> Duration {
        let mut state = self.lock();
        state.log.push(kind);
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        state.write_delay
    }

    fn end_operation(&self) {
        self.lock().active -= 1;
    }

    fn send_frame(&self, handle: LinkHandle, channel: Channel, frame: &Frame, corrupt: bool) {
        let mut chunks = framing::encode(frame.opcode, frame.tx_id, &frame.cargo, 20).unwrap();
        if corrupt {
            if let Some(byte) = chunks.last_mut().and_then(|chunk| chunk.last_mut()) {
                *byte ^= 0x01;
            }
        }
        for bytes in chunks {
            self.emit(TransportEvent::Data {
                handle,
                channel,
                bytes,
            });
        }
    }

    /// Feed a written chunk to the pump and deliver its answer
    fn deliver(&self, handle: LinkHandle, channel: Channel, bytes: &[u8]) {
        let mut state = self.lock();
        if state.current != Some(handle) || state.pump.is_none() {
            return;
        }
        let Some(tx_id) = framing::chunk_tx_id(bytes) else {
            return;
        };
        let assembler = state.assemblers.entry((channel, tx_id)).or_default();
        if !assembler.feed(bytes) {
            return;
        }
        let raw = assembler.assemble();
        state.assemblers.remove(&(channel, tx_id));
        let Some(request) = framing::parse_header(&raw) else {
            return;
        };

        let mut replies = Vec::new();
        let mut corrupt = false;
        let mut stream = Vec::new();
        let mut interval = Duration::ZERO;
        if let Some(pump) = state.pump.as_mut() {
            match channel {
                Channel::Authorization => {
                    if let Some((opcode, cargo)) = pump.answer_handshake(request.opcode, &request.cargo)
                    {
                        replies.push((channel, Frame::new(opcode, request.tx_id, cargo)));
                    }
                }
                Channel::CurrentStatus => {
                    if let Some(cargo) = pump.answer_status(request.opcode, &request.cargo) {
                        replies.push((channel, Frame::new(request.opcode + 1, request.tx_id, cargo)));
                        if request.opcode == session::HISTORY_LOG_REQUEST {
                            stream = pump.history.clone();
                            interval = pump.history_interval;
                        }
                    }
                }
                _ => {}
            }
        }

        if channel == Channel::CurrentStatus && !replies.is_empty() {
            corrupt = std::mem::take(&mut state.corrupt_next_status);
        }
        let first_stream_id = state.stream_tx_id;
        state.stream_tx_id = state.stream_tx_id.wrapping_add(stream.len() as u8);
        drop(state);

        for (channel, frame) in replies {
            self.send_frame(handle, channel, &frame, corrupt);
        }

        if !stream.is_empty() {
            let events = self.events.clone();
            tokio::spawn(async move {
                for (i, cargo) in stream.into_iter().enumerate() {
                    tokio::time::sleep(interval).await;
                    let tx_id = first_stream_id.wrapping_add(i as u8);
                    let chunks = framing::encode(HISTORY_PACKET_OPCODE, tx_id, &cargo, 20).unwrap();
                    for bytes in chunks {
                        if let Some(events) = &events {
                            let _ = events.send(TransportEvent::Data {
                                handle,
                                channel: Channel::HistoryLog,
                                bytes,
                            });
                        }
                    }
                }
            });
        }
    }
}

#[async_trait]
impl PumpTransport for MockTransport {
    async fn connect(&self, _address: &PumpAddress) -> Result<LinkHandle> {
        let behaviour = {
            let mut state = self.lock();
            state.connects += 1;
            state.connect_script.pop_front().unwrap_or(ConnectBehaviour::Accept)
        };
        if behaviour == ConnectBehaviour::Fail {
            return Err(ProtocolError::transport("pump not reachable"));
        }

        let handle = {
            let mut state = self.lock();
            state.next_handle += 1;
            let handle = LinkHandle(state.next_handle);
            state.current = Some(handle);
            state.assemblers.clear();
            if let Some(pump) = state.pump.as_mut() {
                pump.new_link();
            }
            handle
        };

        if let ConnectBehaviour::DropAfterConnect(reason) = behaviour {
            self.lock().current = None;
            self.emit(TransportEvent::Disconnected { handle, reason });
        }
        Ok(handle)
    }

    async fn disconnect(&self, handle: LinkHandle) -> Result<()> {
        let was_current = {
            let mut state = self.lock();
            let was_current = state.current == Some(handle);
            if was_current {
                state.current = None;
            }
            was_current
        };
        if was_current {
            self.emit(TransportEvent::Disconnected {
                handle,
                reason: DisconnectReason::LocalHostTerminated,
            });
        }
        Ok(())
    }

    async fn negotiate_max_payload(&self, _handle: LinkHandle, size: usize) -> Result<usize> {
        Ok(size.min(self.lock().max_payload))
    }

    async fn discover_capabilities(&self, _handle: LinkHandle) -> Result<ServiceDescriptor> {
        Ok(self
            .lock()
            .descriptor
            .clone()
            .unwrap_or_else(ServiceDescriptor::full))
    }

    async fn subscribe(&self, _handle: LinkHandle, channel: Channel) -> Result<()> {
        let delay = self.begin_operation(OperationKind::Subscribe { channel });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.end_operation();
        Ok(())
    }

    async fn write(&self, handle: LinkHandle, channel: Channel, bytes: &[u8]) -> Result<()> {
        let delay = self.begin_operation(OperationKind::Write {
            channel,
            bytes: bytes.to_vec(),
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.end_operation();

        {
            let mut state = self.lock();
            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                return Err(ProtocolError::transport("injected write failure"));
            }
        }

        self.deliver(handle, channel, bytes);
        Ok(())
    }

    async fn remove_bond(&self, address: &PumpAddress) -> Result<()> {
        self.lock().bonds_removed.push(address.clone());
        Ok(())
    }

    async fn watch_for_device(&self, address: &PumpAddress) -> Result<()> {
        self.lock().watching.push(address.clone());
        Ok(())
    }
}
