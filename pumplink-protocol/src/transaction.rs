//! Transaction Table
//!
//! Correlates requests with responses by their one-byte transaction id.
//!
//! Ids come from a wrapping counter, so after 256 requests an id is reused.
//! A new transaction that collides with one still pending evicts it: the old
//! waiter observes `Cancelled` instead of hanging forever. Every
//! [`PendingTransaction`] removes its own entry when dropped, whether it was
//! resolved, timed out or abandoned.

use crate::framing::Frame;
use crate::{ProtocolError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct PendingEntry {
    serial: u64,
    sender: oneshot::Sender<Result<Frame>>,
}

#[derive(Default)]
struct TableState {
    next_id: u8,
    next_serial: u64,
    pending: HashMap<u8, PendingEntry>,
}

impl TableState {
    fn evict(&mut self, tx_id: u8) {
        if let Some(old) = self.pending.remove(&tx_id) {
            warn!("Evicting stale transaction {} on id reuse", tx_id);
            let _ = old.sender.send(Err(ProtocolError::Cancelled(format!(
                "transaction {} evicted by id reuse",
                tx_id
            ))));
        }
    }

    fn allocate(&mut self) -> u8 {
        let tx_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.evict(tx_id);
        tx_id
    }
}

/// Map from transaction id to a waiting caller
#[derive(Clone, Default)]
pub struct TransactionTable {
    inner: Arc<Mutex<TableState>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the next id without registering a waiter
    ///
    /// Used for handshake frames, whose responses are routed by opcode.
    pub fn allocate_id(&self) -> u8 {
        self.state().allocate()
    }

    /// Register a new transaction
    pub fn create(&self) -> (u8, PendingTransaction) {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.state();
        let tx_id = state.allocate();
        let serial = state.next_serial;
        state.next_serial += 1;
        state.pending.insert(tx_id, PendingEntry { serial, sender });
        drop(state);

        (
            tx_id,
            PendingTransaction {
                tx_id,
                serial,
                receiver,
                table: self.clone(),
            },
        )
    }

    /// Complete a transaction; unknown ids are logged and ignored
    pub fn resolve(&self, tx_id: u8, frame: Frame) -> bool {
        let entry = self.state().pending.remove(&tx_id);
        match entry {
            Some(entry) => {
                if entry.sender.send(Ok(frame)).is_err() {
                    debug!("Waiter for transaction {} already gone", tx_id);
                }
                true
            }
            None => {
                warn!(
                    "Unsolicited response for transaction {} (opcode 0x{:02x})",
                    tx_id, frame.opcode
                );
                false
            }
        }
    }

    /// Cancel every pending transaction; returns how many were cancelled
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(u8, PendingEntry)> = self.state().pending.drain().collect();
        let count = drained.len();
        for (tx_id, entry) in drained {
            debug!("Cancelling transaction {}: {}", tx_id, reason);
            let _ = entry.sender.send(Err(ProtocolError::Cancelled(reason.to_string())));
        }
        count
    }

    /// Drop a transaction without notifying its waiter
    pub fn remove(&self, tx_id: u8) -> bool {
        self.state().pending.remove(&tx_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, tx_id: u8) -> bool {
        self.state().pending.contains_key(&tx_id)
    }

    fn remove_if_current(&self, tx_id: u8, serial: u64) {
        let mut state = self.state();
        if state.pending.get(&tx_id).is_some_and(|e| e.serial == serial) {
            state.pending.remove(&tx_id);
        }
    }
}

impl std::fmt::Debug for TransactionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTable")
            .field("pending", &self.len())
            .finish()
    }
}

/// A caller's handle on an outstanding transaction
///
/// Dropping it removes the table entry, so a waiter that gives up never
/// leaves a slot behind.
#[derive(Debug)]
pub struct PendingTransaction {
    tx_id: u8,
    serial: u64,
    receiver: oneshot::Receiver<Result<Frame>>,
    table: TransactionTable,
}

impl PendingTransaction {
    pub fn tx_id(&self) -> u8 {
        self.tx_id
    }

    /// Wait for the response frame
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Timeout` if nothing arrived within `timeout`
    /// - `ProtocolError::Cancelled` on teardown or id eviction
    pub async fn wait(mut self, timeout: Duration) -> Result<Frame> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::Cancelled(format!(
                "transaction {} dropped",
                self.tx_id
            ))),
            Err(_) => Err(ProtocolError::Timeout(format!(
                "no response for transaction {} within {:?}",
                self.tx_id, timeout
            ))),
        }
    }
}

impl Drop for PendingTransaction {
    fn drop(&mut self) {
        self.table.remove_if_current(self.tx_id, self.serial);
    }
}
