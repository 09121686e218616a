//! Connection Lifecycle
//!
//! A single task owns the session context (link handle, handshake, chunk
//! assemblers, reconnect counters) and is the only writer of
//! [`ConnectionState`]. Everything else reaches it by message passing:
//!
//! - [`LifecycleCommand`]s from the [`PumpLink`](crate::PumpLink) facade
//! - [`TransportEvent`]s from the transport
//! - timer events the task schedules for itself
//!
//! Every timer carries the epoch it was scheduled in. Teardown bumps the
//! epoch, so a timer or a session-init task belonging to a dead link can
//! never act on a newer one.
//!
//! ## Link Setup
//!
//! ```text
//! connect ─▶ negotiate payload ─▶ discover ─▶ subscribe Authorization
//!         ─▶ first handshake request ─▶ subscribe remaining channels
//!         ─▶ ...handshake rounds... ─▶ session init requests ─▶ settle
//!         ─▶ CONNECTED
//! ```
//!
//! The remaining subscriptions queue up behind the first handshake chunks
//! on the operation queue, so no explicit waiting is needed.

use crate::auth::{AuthOutcome, AuthRequest, AuthSession, AuthStep, HandshakeFailure};
use crate::config::{LinkConfig, SessionConfig};
use crate::credentials::CredentialStore;
use crate::framing::{self, Frame, FrameAssembler, MIN_CHUNK_SIZE};
use crate::opcode::RequestOpcode;
use crate::operation_queue::{OperationKind, OperationQueue};
use crate::reconnect::{DisconnectVerdict, ReconnectPhase, ReconnectPolicy, SessionSummary};
use crate::stream_collector::StreamCollector;
use crate::transaction::TransactionTable;
use crate::transport::{
    Channel, DisconnectReason, LinkHandle, PumpAddress, PumpTransport, TransportEvent,
    TransportEventReceiver,
};
use crate::{ProtocolError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Top-level session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    /// Terminal until the user connects or pairs again
    AuthFailed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Authenticating => write!(f, "AUTHENTICATING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Reconnecting => write!(f, "RECONNECTING"),
            ConnectionState::AuthFailed => write!(f, "AUTH_FAILED"),
        }
    }
}

/// Requests from the facade to the lifecycle task
#[derive(Debug)]
pub enum LifecycleCommand {
    Connect {
        address: PumpAddress,
        pairing_code: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Unpair {
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug)]
enum TimerEvent {
    ReconnectDue { epoch: u64 },
    AuthDeadline { epoch: u64 },
    SessionReady { epoch: u64, result: Result<()> },
}

/// The write/correlate path shared by the lifecycle task and callers
#[derive(Debug, Clone)]
pub(crate) struct Exchange {
    pub(crate) transactions: TransactionTable,
    pub(crate) queue: OperationQueue,
    pub(crate) stream: StreamCollector,
    chunk_size: Arc<AtomicUsize>,
}

impl Exchange {
    pub(crate) fn new(transport: Arc<dyn PumpTransport>, stream_idle: Duration) -> Self {
        Self {
            transactions: TransactionTable::new(),
            queue: OperationQueue::new(transport),
            stream: StreamCollector::new(stream_idle),
            chunk_size: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size.load(Ordering::Acquire)
    }

    fn set_chunk_size(&self, size: usize) {
        self.chunk_size.store(size, Ordering::Release);
    }

    /// Encode a frame and queue its chunks in order
    fn send_frame(
        &self,
        channel: Channel,
        opcode: u8,
        tx_id: u8,
        cargo: &[u8],
    ) -> Result<Vec<oneshot::Receiver<Result<()>>>> {
        let chunks = framing::encode(opcode, tx_id, cargo, self.chunk_size())?;
        Ok(chunks
            .into_iter()
            .map(|bytes| self.queue.enqueue(OperationKind::Write { channel, bytes }))
            .collect())
    }

    /// Send one status request and wait for its correlated response
    pub(crate) async fn transact(
        &self,
        opcode: RequestOpcode,
        cargo: &[u8],
        timeout: Duration,
    ) -> Result<Frame> {
        let deadline = Instant::now() + timeout;
        let (tx_id, pending) = self.transactions.create();

        for write in self.send_frame(Channel::CurrentStatus, opcode.get(), tx_id, cargo)? {
            match tokio::time::timeout_at(deadline, write).await {
                Ok(Ok(result)) => result?,
                Ok(Err(_)) => {
                    return Err(ProtocolError::Cancelled(format!(
                        "link torn down while writing request {}",
                        opcode
                    )))
                }
                Err(_) => {
                    return Err(ProtocolError::Timeout(format!(
                        "writing request {} did not complete",
                        opcode
                    )))
                }
            }
        }

        let frame = pending
            .wait(deadline.saturating_duration_since(Instant::now()))
            .await?;
        if frame.opcode != opcode.response_opcode() {
            return Err(ProtocolError::UnexpectedResponse {
                expected: opcode.response_opcode(),
                actual: frame.opcode,
            });
        }
        Ok(frame)
    }
}

/// Everything the lifecycle task owns about the current pairing
struct SessionContext {
    address: Option<PumpAddress>,
    pairing_code: Option<String>,
    first_pairing: bool,
    handle: Option<LinkHandle>,
    epoch: u64,
    auth: Option<AuthSession>,
    assemblers: HashMap<(Channel, u8), FrameAssembler>,
    auto_reconnect: bool,
    watching: bool,
    notifications: u64,
}

impl SessionContext {
    fn new() -> Self {
        Self {
            address: None,
            pairing_code: None,
            first_pairing: false,
            handle: None,
            epoch: 0,
            auth: None,
            assemblers: HashMap::new(),
            auto_reconnect: false,
            watching: false,
            notifications: 0,
        }
    }
}

pub(crate) struct Lifecycle {
    transport: Arc<dyn PumpTransport>,
    credentials: Arc<dyn CredentialStore>,
    config: Arc<LinkConfig>,
    exchange: Exchange,
    state: watch::Sender<ConnectionState>,
    timers: mpsc::UnboundedSender<TimerEvent>,
    policy: ReconnectPolicy,
    ctx: SessionContext,
}

impl Lifecycle {
    /// Start the lifecycle task
    pub(crate) fn spawn(
        transport: Arc<dyn PumpTransport>,
        credentials: Arc<dyn CredentialStore>,
        config: Arc<LinkConfig>,
        exchange: Exchange,
        state: watch::Sender<ConnectionState>,
        commands: mpsc::UnboundedReceiver<LifecycleCommand>,
        events: TransportEventReceiver,
    ) -> JoinHandle<()> {
        let (timers, timer_rx) = mpsc::unbounded_channel();
        let lifecycle = Self {
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            transport,
            credentials,
            config,
            exchange,
            state,
            timers,
            ctx: SessionContext::new(),
        };
        tokio::spawn(lifecycle.run(commands, events, timer_rx))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LifecycleCommand>,
        mut events: TransportEventReceiver,
        mut timers: mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        let mut events_open = true;
        info!("Pump link lifecycle started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Transport event channel closed");
                        events_open = false;
                    }
                },
                Some(timer) = timers.recv() => self.handle_timer(timer).await,
            }
        }

        info!("Pump link dropped, shutting down lifecycle");
        self.ctx.auto_reconnect = false;
        self.drop_link("link dropped").await;
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Connection state {} -> {}", previous, next);
        }
    }

    async fn handle_command(&mut self, command: LifecycleCommand) {
        match command {
            LifecycleCommand::Connect {
                address,
                pairing_code,
                reply,
            } => {
                let outcome = self.prepare_connect(address, pairing_code).await;
                let started = outcome.is_ok();
                let _ = reply.send(outcome);
                if started {
                    self.attempt().await;
                }
            }
            LifecycleCommand::Disconnect { reply } => {
                self.stop("disconnect requested").await;
                let _ = reply.send(Ok(()));
            }
            LifecycleCommand::Unpair { reply } => {
                let _ = reply.send(self.unpair().await);
            }
        }
    }

    async fn prepare_connect(
        &mut self,
        address: PumpAddress,
        pairing_code: Option<String>,
    ) -> Result<()> {
        let stored_code = self.credentials.pairing_code().await?;
        let code = match pairing_code.or_else(|| stored_code.clone()) {
            Some(code) if !code.is_empty() => code,
            _ => return Err(ProtocolError::NotPaired),
        };

        let paired_address = self.credentials.paired_address().await?;
        let first_pairing = !self.credentials.is_paired().await?
            || paired_address.as_ref() != Some(&address)
            || stored_code.as_deref() != Some(code.as_str());
        if first_pairing {
            info!("Pairing with {} using a new code", address);
            self.credentials.clear_derived_secret().await?;
        }

        if let Some(handle) = self.ctx.handle {
            debug!("Explicit connect replaces {}", handle);
        }
        self.drop_link("explicit connect").await;
        self.stop_watching().await;
        self.policy.reset();

        self.ctx.address = Some(address);
        self.ctx.pairing_code = Some(code);
        self.ctx.first_pairing = first_pairing;
        self.ctx.auto_reconnect = true;
        Ok(())
    }

    /// Open a link and start the handshake
    async fn attempt(&mut self) {
        let Some(address) = self.ctx.address.clone() else {
            warn!("Connection attempt without a pump address");
            return;
        };

        self.ctx.epoch += 1;
        self.set_state(ConnectionState::Connecting);
        debug!("Connecting to {} ({})", address, self.policy.status());

        let handle = match self.transport.connect(&address).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to connect to {}: {}", address, e);
                self.on_link_lost(DisconnectReason::ConnectFailed).await;
                return;
            }
        };

        self.ctx.handle = Some(handle);
        self.ctx.notifications = 0;
        if let Err(e) = self.setup_link(handle).await {
            warn!("Failed to set up {}: {}", handle, e);
            self.drop_link("link setup failed").await;
            self.schedule_reconnect().await;
        }
    }

    async fn setup_link(&mut self, handle: LinkHandle) -> Result<()> {
        let requested = self.config.framing.requested_payload;
        let granted = self.transport.negotiate_max_payload(handle, requested).await?;
        let chunk_size = granted.min(self.config.framing.max_chunk_size);
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(ProtocolError::transport(format!(
                "granted payload of {} bytes is too small",
                granted
            )));
        }
        self.exchange.set_chunk_size(chunk_size);
        debug!("Negotiated {} byte payload, chunking at {}", granted, chunk_size);

        let descriptor = self.transport.discover_capabilities(handle).await?;
        if let Some(missing) = Channel::ALL.into_iter().find(|c| !descriptor.supports(*c)) {
            return Err(ProtocolError::transport(format!(
                "pump does not expose the {} channel",
                missing
            )));
        }

        self.exchange.queue.attach(handle);
        let _ = self.exchange.queue.enqueue(OperationKind::Subscribe {
            channel: Channel::Authorization,
        });

        let code = self
            .ctx
            .pairing_code
            .clone()
            .ok_or(ProtocolError::NotPaired)?;
        let secret = match self.credentials.derived_secret().await {
            Ok(secret) => secret,
            Err(e) => {
                warn!("Failed to read derived secret, bootstrapping: {}", e);
                None
            }
        };

        let (session, request) = AuthSession::begin(
            &code,
            secret.as_ref(),
            self.config.auth.app_instance_id,
            self.config.auth.handshake_timeout(),
        )?;
        let deadline = session.deadline();
        self.ctx.auth = Some(session);
        self.set_state(ConnectionState::Authenticating);
        self.send_auth(request)?;

        for channel in [
            Channel::CurrentStatus,
            Channel::QualifyingEvents,
            Channel::HistoryLog,
        ] {
            let _ = self.exchange.queue.enqueue(OperationKind::Subscribe { channel });
        }

        let timers = self.timers.clone();
        let epoch = self.ctx.epoch;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = timers.send(TimerEvent::AuthDeadline { epoch });
        });
        Ok(())
    }

    fn send_auth(&self, request: AuthRequest) -> Result<()> {
        let tx_id = self.exchange.transactions.allocate_id();
        self.exchange
            .send_frame(Channel::Authorization, request.opcode, tx_id, &request.cargo)?;
        Ok(())
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data {
                handle,
                channel,
                bytes,
            } => self.on_data(handle, channel, &bytes).await,
            TransportEvent::Disconnected { handle, reason } => {
                if self.ctx.handle != Some(handle) {
                    debug!("Ignoring disconnect of stale {} ({})", handle, reason);
                    return;
                }
                info!("{} went down: {}", handle, reason);
                self.on_link_lost(reason).await;
            }
            TransportEvent::DeviceInRange { address } => {
                let ours = self.ctx.address.as_ref() == Some(&address);
                if ours && self.ctx.auto_reconnect && self.state() == ConnectionState::Reconnecting {
                    info!("{} is back in range, reconnecting now", address);
                    // consumed; the next slow-phase retry arms a fresh watch
                    self.ctx.watching = false;
                    self.attempt().await;
                }
            }
        }
    }

    async fn on_data(&mut self, handle: LinkHandle, channel: Channel, bytes: &[u8]) {
        if self.ctx.handle != Some(handle) {
            debug!("Ignoring {} bytes from stale {}", bytes.len(), handle);
            return;
        }
        let Some(tx_id) = framing::chunk_tx_id(bytes) else {
            warn!("Dropping short chunk on {}", channel);
            return;
        };

        let key = (channel, tx_id);
        let assembler = self.ctx.assemblers.entry(key).or_default();
        if !assembler.feed(bytes) {
            return;
        }
        let raw = assembler.assemble();
        self.ctx.assemblers.remove(&key);

        match framing::parse_header(&raw) {
            Some(frame) => self.on_frame(channel, frame).await,
            None => warn!(
                "Dropping invalid {} frame for transaction {} ({} bytes)",
                channel,
                tx_id,
                raw.len()
            ),
        }
    }

    async fn on_frame(&mut self, channel: Channel, frame: Frame) {
        match channel {
            Channel::Authorization => self.on_auth_frame(frame).await,
            Channel::CurrentStatus => {
                self.note_notification();
                self.exchange.transactions.resolve(frame.tx_id, frame);
            }
            Channel::HistoryLog => {
                self.note_notification();
                self.exchange.stream.push(frame.cargo);
            }
            Channel::QualifyingEvents => {
                self.note_notification();
                debug!(
                    "Qualifying event 0x{:02x} ({} bytes)",
                    frame.opcode,
                    frame.cargo.len()
                );
            }
        }
    }

    fn note_notification(&mut self) {
        if self.state() == ConnectionState::Connected {
            self.ctx.notifications += 1;
            self.policy.on_notification();
        }
    }

    async fn on_auth_frame(&mut self, frame: Frame) {
        let Some(session) = self.ctx.auth.as_mut() else {
            debug!("Handshake frame 0x{:02x} outside a handshake", frame.opcode);
            return;
        };

        match session.on_response(frame.opcode, &frame.cargo) {
            Ok(AuthStep::Send(request)) => {
                if let Err(e) = self.send_auth(request) {
                    warn!("Failed to send handshake round: {}", e);
                    self.drop_link("handshake write failed").await;
                    self.schedule_reconnect().await;
                }
            }
            Ok(AuthStep::Authenticated(outcome)) => self.on_authenticated(outcome).await,
            Err(failure) => self.on_handshake_failure(failure).await,
        }
    }

    async fn on_authenticated(&mut self, outcome: AuthOutcome) {
        self.ctx.auth = None;
        self.policy.on_authenticated();

        if let Some(secret) = &outcome.derived_secret {
            if let Err(e) = self.credentials.save_derived_secret(secret).await {
                warn!("Failed to persist derived secret: {}", e);
            }
        }
        if self.ctx.first_pairing {
            if let (Some(address), Some(code)) = (&self.ctx.address, &self.ctx.pairing_code) {
                match self.credentials.save_pairing(address, code).await {
                    Ok(()) => {
                        info!("Saved pairing with {}", address);
                        self.ctx.first_pairing = false;
                    }
                    Err(e) => warn!("Failed to persist pairing: {}", e),
                }
            }
        }

        let exchange = self.exchange.clone();
        let session = self.config.session.clone();
        let timers = self.timers.clone();
        let epoch = self.ctx.epoch;
        tokio::spawn(async move {
            let result = initialize_session(&exchange, &session).await;
            let _ = timers.send(TimerEvent::SessionReady { epoch, result });
        });
    }

    async fn on_handshake_failure(&mut self, failure: HandshakeFailure) {
        warn!("Handshake failed: {}", failure);
        self.ctx.auth = None;

        match failure {
            HandshakeFailure::Rejected {
                invalidate_secret: true,
                ..
            } => {
                if let Err(e) = self.credentials.clear_derived_secret().await {
                    warn!("Failed to clear rejected derived secret: {}", e);
                }
                self.drop_link("derived secret rejected").await;
                self.schedule_reconnect().await;
            }
            HandshakeFailure::Malformed(_) => {
                self.drop_link("malformed handshake").await;
                self.schedule_reconnect().await;
            }
            HandshakeFailure::Rejected { .. } | HandshakeFailure::TimedOut => {
                self.drop_link("handshake failed").await;
                self.fail_terminal().await;
            }
        }
    }

    async fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::ReconnectDue { epoch } => {
                if epoch == self.ctx.epoch
                    && self.ctx.auto_reconnect
                    && self.state() == ConnectionState::Reconnecting
                {
                    self.attempt().await;
                }
            }
            TimerEvent::AuthDeadline { epoch } => {
                if epoch == self.ctx.epoch && self.ctx.auth.is_some() {
                    self.on_handshake_failure(HandshakeFailure::TimedOut).await;
                }
            }
            TimerEvent::SessionReady { epoch, result } => {
                if epoch != self.ctx.epoch || self.state() != ConnectionState::Authenticating {
                    return;
                }
                match result {
                    Ok(()) => {
                        self.ctx.notifications = 0;
                        self.stop_watching().await;
                        self.set_state(ConnectionState::Connected);
                    }
                    Err(e) => {
                        warn!("Session initialization failed: {}", e);
                        self.drop_link("session initialization failed").await;
                        self.schedule_reconnect().await;
                    }
                }
            }
        }
    }

    async fn on_link_lost(&mut self, reason: DisconnectReason) {
        let summary = SessionSummary {
            reached_connected: self.state() == ConnectionState::Connected,
            notifications: self.ctx.notifications,
        };
        self.teardown(&format!("link lost: {}", reason));

        if !self.ctx.auto_reconnect {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        match self.policy.classify(reason, summary) {
            DisconnectVerdict::Transient => self.schedule_reconnect().await,
            DisconnectVerdict::BondLost(why) => self.on_bond_lost(&why).await,
        }
    }

    async fn on_bond_lost(&mut self, why: &str) {
        error!("Bond with pump lost: {}", why);
        if let Some(address) = self.ctx.address.clone() {
            if let Err(e) = self.transport.remove_bond(&address).await {
                warn!("Failed to remove bond with {}: {}", address, e);
            }
        }
        self.fail_terminal().await;
    }

    async fn fail_terminal(&mut self) {
        self.ctx.auto_reconnect = false;
        self.stop_watching().await;
        self.set_state(ConnectionState::AuthFailed);
    }

    async fn schedule_reconnect(&mut self) {
        if !self.ctx.auto_reconnect {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let delay = self.policy.next_delay();
        self.set_state(ConnectionState::Reconnecting);
        info!("Reconnecting in {:?} ({})", delay, self.policy.status());

        if self.policy.phase() == ReconnectPhase::Slow && !self.ctx.watching {
            if let Some(address) = self.ctx.address.clone() {
                match self.transport.watch_for_device(&address).await {
                    Ok(()) => {
                        debug!("Watching for {} to come back in range", address);
                        self.ctx.watching = true;
                    }
                    Err(e) => warn!("Failed to watch for {}: {}", address, e),
                }
            }
        }

        let timers = self.timers.clone();
        let epoch = self.ctx.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(TimerEvent::ReconnectDue { epoch });
        });
    }

    async fn stop_watching(&mut self) {
        if !self.ctx.watching {
            return;
        }
        self.ctx.watching = false;
        if let Some(address) = &self.ctx.address {
            if let Err(e) = self.transport.stop_watching(address).await {
                warn!("Failed to stop watching {}: {}", address, e);
            }
        }
    }

    /// Cancel everything tied to the current link
    fn teardown(&mut self, reason: &str) {
        let cancelled = self.exchange.transactions.cancel_all(reason);
        let stream = self.exchange.stream.cancel(reason);
        let dropped = self.exchange.queue.clear();
        if cancelled > 0 || stream || dropped > 0 {
            debug!(
                "Teardown ({}): {} transactions, stream {}, {} queued operations",
                reason,
                cancelled,
                if stream { "cancelled" } else { "idle" },
                dropped
            );
        }

        self.ctx.assemblers.clear();
        self.ctx.auth = None;
        self.ctx.handle = None;
        self.ctx.epoch += 1;
    }

    /// Tear down and close the current link, if any
    async fn drop_link(&mut self, reason: &str) {
        let handle = self.ctx.handle;
        self.teardown(reason);
        if let Some(handle) = handle {
            if let Err(e) = self.transport.disconnect(handle).await {
                warn!("Failed to disconnect {}: {}", handle, e);
            }
        }
    }

    async fn stop(&mut self, reason: &str) {
        self.ctx.auto_reconnect = false;
        self.drop_link(reason).await;
        self.stop_watching().await;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn unpair(&mut self) -> Result<()> {
        self.stop("unpair requested").await;

        let address = match self.ctx.address.take() {
            Some(address) => Some(address),
            None => self.credentials.paired_address().await?,
        };
        self.ctx.pairing_code = None;
        self.policy.reset();

        self.credentials.clear_pairing().await?;
        if let Some(address) = address {
            self.transport.remove_bond(&address).await?;
            info!("Unpaired {}", address);
        }
        Ok(())
    }
}

/// Send the requests the pump expects before it answers status reads, then
/// let the link settle
async fn initialize_session(exchange: &Exchange, session: &SessionConfig) -> Result<()> {
    for opcode in session.init_requests()? {
        let frame = exchange
            .transact(opcode, &[], session.init_timeout())
            .await?;
        debug!(
            "Session init {} answered with {} bytes",
            opcode,
            frame.cargo.len()
        );
    }
    tokio::time::sleep(session.settle()).await;
    Ok(())
}
