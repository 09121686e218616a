//! Pump Link
//!
//! [`PumpLink`] is the upward interface of the engine. It forwards connect,
//! disconnect and unpair to the lifecycle task and runs status requests on
//! the caller's own task, correlating responses through the transaction
//! table.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pumplink_protocol::{
//!     transport::event_channel, LinkConfig, MemoryCredentialStore, PumpAddress, PumpLink,
//!     RequestOpcode,
//! };
//! # use pumplink_protocol::transport::PumpTransport;
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # async fn example(transport: Arc<dyn PumpTransport>) -> pumplink_protocol::Result<()> {
//! let (_events_tx, events) = event_channel();
//! let credentials = Arc::new(MemoryCredentialStore::new());
//! let link = PumpLink::new(transport, events, credentials, LinkConfig::default())?;
//!
//! link.connect(PumpAddress::parse("00:11:22:33:44:55")?, Some("482913".into()))
//!     .await?;
//! let cargo = link
//!     .send_request(RequestOpcode::new(0x6c)?, &[], Duration::from_secs(5))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::LinkConfig;
use crate::credentials::CredentialStore;
use crate::decoder::ResponseDecoder;
use crate::lifecycle::{ConnectionState, Exchange, Lifecycle, LifecycleCommand};
use crate::opcode::RequestOpcode;
use crate::transport::{PumpAddress, PumpTransport, TransportEventReceiver};
use crate::{ProtocolError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

/// Read-only session with one insulin pump
#[derive(Debug)]
pub struct PumpLink {
    commands: mpsc::UnboundedSender<LifecycleCommand>,
    state: watch::Receiver<ConnectionState>,
    exchange: Exchange,
    config: Arc<LinkConfig>,
}

impl PumpLink {
    /// Create the engine and start its lifecycle task
    ///
    /// Must be called inside a tokio runtime. The link starts DISCONNECTED.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Configuration` if `config` fails validation.
    pub fn new(
        transport: Arc<dyn PumpTransport>,
        events: TransportEventReceiver,
        credentials: Arc<dyn CredentialStore>,
        config: LinkConfig,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let exchange = Exchange::new(transport.clone(), config.stream.idle());
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (commands, command_rx) = mpsc::unbounded_channel();

        // the task exits once every handle on the command channel is gone
        Lifecycle::spawn(
            transport,
            credentials,
            config.clone(),
            exchange.clone(),
            state_tx,
            command_rx,
            events,
        );

        Ok(Self {
            commands,
            state,
            exchange,
            config,
        })
    }

    async fn command(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> LifecycleCommand,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ProtocolError::invalid_state("lifecycle task has stopped"))?;
        response
            .await
            .map_err(|_| ProtocolError::invalid_state("lifecycle task has stopped"))?
    }

    /// Start connecting to a pump
    ///
    /// Resets every failure counter. Without a pairing code the stored one
    /// is used. Returns once the attempt has started; watch
    /// [`subscribe_state`](Self::subscribe_state) for progress.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::NotPaired` if no pairing code is available.
    pub async fn connect(&self, address: PumpAddress, pairing_code: Option<String>) -> Result<()> {
        self.command(|reply| LifecycleCommand::Connect {
            address,
            pairing_code,
            reply,
        })
        .await
    }

    /// Close the link and stop reconnecting
    pub async fn disconnect(&self) -> Result<()> {
        self.command(|reply| LifecycleCommand::Disconnect { reply })
            .await
    }

    /// Disconnect and forget the pairing and the transport bond
    pub async fn unpair(&self) -> Result<()> {
        self.command(|reply| LifecycleCommand::Unpair { reply }).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the link reaches `target`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Timeout` if the state was not reached in time.
    pub async fn wait_for_state(
        &self,
        target: ConnectionState,
        timeout: Duration,
    ) -> Result<ConnectionState> {
        let mut state = self.state.clone();
        let reached = async { state.wait_for(|s| *s == target).await.map(|s| *s) };
        let outcome = match tokio::time::timeout(timeout, reached).await {
            Ok(Ok(reached)) => Ok(reached),
            Ok(Err(_)) => Err(ProtocolError::invalid_state("lifecycle task has stopped")),
            Err(_) => Err(ProtocolError::Timeout(format!(
                "state {} not reached, still {}",
                target,
                self.state()
            ))),
        };
        outcome
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(ProtocolError::NotConnected),
        }
    }

    /// Send one status request and return the response cargo
    ///
    /// # Errors
    ///
    /// - `ProtocolError::NotConnected` before the session is CONNECTED
    /// - `ProtocolError::Timeout` if no response arrived in time
    /// - `ProtocolError::Cancelled` if the link went down meanwhile
    /// - `ProtocolError::UnexpectedResponse` for a mismatching opcode
    pub async fn send_request(
        &self,
        opcode: RequestOpcode,
        cargo: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        let frame = self.exchange.transact(opcode, cargo, timeout).await?;
        Ok(frame.cargo)
    }

    /// [`send_request`](Self::send_request) with the configured default timeout
    pub async fn request(&self, opcode: RequestOpcode, cargo: &[u8]) -> Result<Vec<u8>> {
        self.send_request(opcode, cargo, self.config.session.request_timeout())
            .await
    }

    /// Send a request whose data arrives as a burst on the history log
    /// channel, returning every packet cargo in arrival order
    ///
    /// A new stream request supersedes one still in progress.
    pub async fn request_stream(
        &self,
        opcode: RequestOpcode,
        cargo: &[u8],
        timeout: Duration,
    ) -> Result<Vec<Vec<u8>>> {
        self.ensure_connected()?;
        let deadline = Instant::now() + timeout;

        let pending = self.exchange.stream.start();
        let ack = self.exchange.transact(opcode, cargo, timeout).await?;
        debug!("Stream request {} acknowledged ({} bytes)", opcode, ack.cargo.len());

        pending
            .wait(deadline.saturating_duration_since(Instant::now()))
            .await
    }

    /// Send a request and decode its response
    ///
    /// # Errors
    ///
    /// Besides the [`send_request`](Self::send_request) errors, decoder
    /// failures surface as `ProtocolError::Decode`.
    pub async fn request_decoded<D: ResponseDecoder>(
        &self,
        decoder: &D,
        cargo: &[u8],
        timeout: Duration,
    ) -> Result<D::Output> {
        let response = self
            .send_request(decoder.request_opcode(), cargo, timeout)
            .await?;
        decoder.decode(&response).map_err(|e| match e {
            ProtocolError::Decode(msg) => ProtocolError::Decode(msg),
            other => ProtocolError::Decode(other.to_string()),
        })
    }

    /// Chunk size negotiated for the current link (0 before the first link)
    pub fn chunk_size(&self) -> usize {
        self.exchange.chunk_size()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }
}
