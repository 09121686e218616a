//! Operation Queue
//!
//! Serializes every outgoing transport operation so at most one write or
//! subscription is in flight on the link. Handshake chunks, status request
//! chunks and channel subscriptions all funnel through here, and execute
//! strictly in enqueue order.
//!
//! Draining is event-driven: enqueueing into an idle queue spawns a drain
//! task, and each completed operation (success or failure) starts the next
//! one. Clearing the queue on disconnect drops everything still waiting;
//! re-issuing that work is up to the connection lifecycle. An operation
//! already handed to the transport cannot be recalled, so a drain started
//! after a clear waits for it to finish before issuing its own.

use crate::transport::{Channel, LinkHandle, PumpTransport};
use crate::{ProtocolError, Result};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

/// A unit of work for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Write one chunk
    Write { channel: Channel, bytes: Vec<u8> },
    /// Enable notifications
    Subscribe { channel: Channel },
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Write { channel, bytes } => {
                write!(f, "write of {} bytes to {}", bytes.len(), channel)
            }
            OperationKind::Subscribe { channel } => write!(f, "subscribe to {}", channel),
        }
    }
}

struct Operation {
    kind: OperationKind,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Operation>,
    in_flight: bool,
    link: Option<LinkHandle>,
    generation: u64,
}

/// Single-writer queue in front of the transport
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<Mutex<QueueState>>,
    /// Held by a drain for the whole of each transport call
    slot: Arc<AsyncMutex<()>>,
    transport: Arc<dyn PumpTransport>,
}

impl OperationQueue {
    pub fn new(transport: Arc<dyn PumpTransport>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueState::default())),
            slot: Arc::new(AsyncMutex::new(())),
            transport,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Direct subsequent operations at a freshly connected link
    pub fn attach(&self, handle: LinkHandle) {
        let mut state = self.state();
        state.link = Some(handle);
        debug!("Operation queue attached to {}", handle);
    }

    /// Append an operation
    ///
    /// The returned receiver resolves when the operation has completed;
    /// callers that do not care may drop it. If the queue is cleared first,
    /// the receiver observes a closed channel.
    pub fn enqueue(&self, kind: OperationKind) -> oneshot::Receiver<Result<()>> {
        let (done, receiver) = oneshot::channel();
        let mut state = self.state();
        state.pending.push_back(Operation { kind, done });

        if !state.in_flight {
            state.in_flight = true;
            let generation = state.generation;
            drop(state);
            tokio::spawn(self.clone().drain(generation));
        }
        receiver
    }

    /// Drop all queued operations and forget the link
    ///
    /// Returns the number of operations discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let dropped = state.pending.len();
        state.pending.clear();
        state.in_flight = false;
        state.link = None;
        state.generation += 1;
        if dropped > 0 {
            debug!("Cleared {} queued operations", dropped);
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self) -> bool {
        self.state().in_flight
    }

    async fn drain(self, generation: u64) {
        loop {
            let _slot = self.slot.lock().await;
            let (operation, link) = {
                let mut state = self.state();
                if state.generation != generation {
                    return;
                }
                match state.pending.pop_front() {
                    Some(operation) => (operation, state.link),
                    None => {
                        state.in_flight = false;
                        return;
                    }
                }
            };

            let result = match link {
                Some(handle) => self.execute(handle, &operation.kind).await,
                None => Err(ProtocolError::NotConnected),
            };

            if let Err(e) = &result {
                warn!("Queued {} failed: {}", operation.kind, e);
            }
            let _ = operation.done.send(result);
        }
    }

    async fn execute(&self, handle: LinkHandle, kind: &OperationKind) -> Result<()> {
        match kind {
            OperationKind::Write { channel, bytes } => {
                self.transport.write(handle, *channel, bytes).await
            }
            OperationKind::Subscribe { channel } => self.transport.subscribe(handle, *channel).await,
        }
    }
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("OperationQueue")
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight)
            .field("link", &state.link)
            .finish()
    }
}
