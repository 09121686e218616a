//! Stream Collector
//!
//! Some responses arrive as an unsolicited burst of independently framed
//! packets on the history log channel after the request was merely
//! acknowledged. The collector gathers their cargos in arrival order and
//! delivers the list once no packet has arrived for the idle window.
//!
//! The idle timer only runs once the first packet is in; until then the
//! caller's own timeout applies. Each [`StreamCollector::start`] bumps a
//! generation counter so a timer or packet belonging to an abandoned stream
//! can never complete a newer one.

use crate::{ProtocolError, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type StreamResult = Result<Vec<Vec<u8>>>;

struct ActiveStream {
    generation: u64,
    cargos: Vec<Vec<u8>>,
    sender: oneshot::Sender<StreamResult>,
    idle_timer: Option<JoinHandle<()>>,
}

impl ActiveStream {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct CollectorState {
    generation: u64,
    active: Option<ActiveStream>,
}

/// Accumulates one in-flight multi-packet response
#[derive(Clone)]
pub struct StreamCollector {
    inner: Arc<Mutex<CollectorState>>,
    idle: Duration,
}

impl StreamCollector {
    pub fn new(idle: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CollectorState::default())),
            idle,
        }
    }

    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin collecting, replacing any stream still in progress
    pub fn start(&self) -> PendingStream {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.state();

        if let Some(mut previous) = state.active.take() {
            previous.stop_timer();
            debug!(
                "Replacing stream {} after {} packets",
                previous.generation,
                previous.cargos.len()
            );
            let _ = previous
                .sender
                .send(Err(ProtocolError::Cancelled("superseded by a new stream".to_string())));
        }

        state.generation += 1;
        let generation = state.generation;
        state.active = Some(ActiveStream {
            generation,
            cargos: Vec::new(),
            sender,
            idle_timer: None,
        });

        PendingStream {
            generation,
            receiver,
            collector: self.clone(),
        }
    }

    /// Append one validated packet cargo and restart the idle timer
    ///
    /// Returns false if no stream is active (the packet is dropped).
    pub fn push(&self, cargo: Vec<u8>) -> bool {
        let mut state = self.state();
        let Some(active) = state.active.as_mut() else {
            debug!("Dropping stray stream packet ({} bytes)", cargo.len());
            return false;
        };

        active.cargos.push(cargo);
        active.stop_timer();

        let collector = self.clone();
        let generation = active.generation;
        let idle = self.idle;
        active.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            collector.complete(generation);
        }));
        true
    }

    /// Abort the active stream, failing its waiter
    pub fn cancel(&self, reason: &str) -> bool {
        let active = self.state().active.take();
        match active {
            Some(mut active) => {
                active.stop_timer();
                let _ = active
                    .sender
                    .send(Err(ProtocolError::Cancelled(reason.to_string())));
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state().active.is_some()
    }

    fn complete(&self, generation: u64) {
        let mut state = self.state();
        if state.active.as_ref().map(|a| a.generation) != Some(generation) {
            return;
        }
        if let Some(active) = state.active.take() {
            info!(
                "Stream {} complete with {} packets",
                generation,
                active.cargos.len()
            );
            let _ = active.sender.send(Ok(active.cargos));
        }
    }

    fn abandon(&self, generation: u64) {
        let mut state = self.state();
        if state.active.as_ref().map(|a| a.generation) == Some(generation) {
            if let Some(mut active) = state.active.take() {
                active.stop_timer();
                debug!("Stream {} abandoned by its caller", generation);
            }
        }
    }
}

impl std::fmt::Debug for StreamCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCollector")
            .field("idle", &self.idle)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A caller's handle on an in-flight stream
#[derive(Debug)]
pub struct PendingStream {
    generation: u64,
    receiver: oneshot::Receiver<StreamResult>,
    collector: StreamCollector,
}

impl PendingStream {
    /// Wait for the burst to finish
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Timeout` if the stream did not finish in `timeout`
    /// - `ProtocolError::Cancelled` on teardown or when superseded
    pub async fn wait(mut self, timeout: Duration) -> StreamResult {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::Cancelled("stream dropped".to_string())),
            Err(_) => Err(ProtocolError::Timeout(format!(
                "stream {} did not finish within {:?}",
                self.generation, timeout
            ))),
        }
    }
}

impl Drop for PendingStream {
    fn drop(&mut self) {
        self.collector.abandon(self.generation);
    }
}
