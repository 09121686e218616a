//! Reconnection Policy
//!
//! Decides how long to wait before the next connection attempt and whether
//! a disconnect means the transport bond is gone.
//!
//! ## Phases
//!
//! - **Fast**: exponential backoff from the initial delay, doubling up to a
//!   cap, for a bounded number of attempts
//! - **Slow**: a fixed interval, forever; the pump is a medical device so
//!   the link is never given up unless the user unpairs
//!
//! ## Bond-Loss Classification
//!
//! Each rule has its own counter and threshold. The counters persist across
//! attempts within one run and are reset on an explicit connect and on
//! handshake success, except the silent-session counter, which only a
//! notification received on a connected session clears.

use crate::config::ReconnectConfig;
use crate::transport::DisconnectReason;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which schedule the next delay comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Fast,
    Slow,
}

impl fmt::Display for ReconnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectPhase::Fast => write!(f, "fast"),
            ReconnectPhase::Slow => write!(f, "slow"),
        }
    }
}

/// Attempt and failure counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBudget {
    pub attempt: u32,
    pub phase: ReconnectPhase,
    pub current_delay: Duration,
    /// Consecutive peer-terminated disconnects before CONNECTED
    pub peer_terminated: u32,
    /// Consecutive sessions that reached CONNECTED and heard nothing
    pub silent_sessions: u32,
    /// Consecutive insufficient-encryption disconnects
    pub encryption_failures: u32,
}

impl ReconnectBudget {
    fn new(initial_delay: Duration) -> Self {
        Self {
            attempt: 0,
            phase: ReconnectPhase::Fast,
            current_delay: initial_delay,
            peer_terminated: 0,
            silent_sessions: 0,
            encryption_failures: 0,
        }
    }
}

/// What one session looked like when it ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSummary {
    /// The session got as far as CONNECTED
    pub reached_connected: bool,
    /// Notifications received while CONNECTED
    pub notifications: u64,
}

/// Outcome of classifying a disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectVerdict {
    /// Keep reconnecting
    Transient,
    /// Clear the bond and stop
    BondLost(String),
}

/// Tiered reconnection schedule plus bond-loss heuristics
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    budget: ReconnectBudget,
    had_success: bool,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        let budget = ReconnectBudget::new(config.fast_initial_delay());
        Self {
            config,
            budget,
            had_success: false,
        }
    }

    pub fn budget(&self) -> &ReconnectBudget {
        &self.budget
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.budget.phase
    }

    /// A session has authenticated at least once this run
    pub fn had_success(&self) -> bool {
        self.had_success
    }

    /// Explicit user connect: everything starts over
    pub fn reset(&mut self) {
        self.budget = ReconnectBudget::new(self.config.fast_initial_delay());
    }

    /// Handshake succeeded
    pub fn on_authenticated(&mut self) {
        self.had_success = true;
        let silent_sessions = self.budget.silent_sessions;
        self.budget = ReconnectBudget::new(self.config.fast_initial_delay());
        self.budget.silent_sessions = silent_sessions;
    }

    /// The pump answered on a connected session
    pub fn on_notification(&mut self) {
        if self.budget.silent_sessions > 0 {
            debug!("Pump is talking again, clearing silent-session count");
            self.budget.silent_sessions = 0;
        }
    }

    /// Classify a disconnect into transient or bond-lost
    pub fn classify(&mut self, reason: DisconnectReason, session: SessionSummary) -> DisconnectVerdict {
        if reason != DisconnectReason::InsufficientEncryption {
            self.budget.encryption_failures = 0;
        }
        if reason != DisconnectReason::PeerTerminated && self.budget.peer_terminated > 0 {
            debug!("Peer-terminated streak broken by {}", reason);
            self.budget.peer_terminated = 0;
        }

        match reason {
            DisconnectReason::InsufficientAuthentication if !session.reached_connected => {
                return DisconnectVerdict::BondLost(
                    "pump rejected the bond before the session was established".to_string(),
                );
            }
            DisconnectReason::InsufficientEncryption => {
                if !self.had_success {
                    return DisconnectVerdict::BondLost(
                        "link encryption failed with no prior session".to_string(),
                    );
                }
                self.budget.encryption_failures += 1;
                debug!(
                    "Encryption failure {} (threshold {})",
                    self.budget.encryption_failures, self.config.encryption_failure_threshold
                );
                if self.budget.encryption_failures > self.config.encryption_failure_threshold {
                    return DisconnectVerdict::BondLost(format!(
                        "{} consecutive encryption failures",
                        self.budget.encryption_failures
                    ));
                }
                return DisconnectVerdict::Transient;
            }
            _ => {}
        }

        if session.reached_connected {
            if session.notifications == 0 {
                self.budget.silent_sessions += 1;
                warn!(
                    "Session ended without a single notification ({}/{})",
                    self.budget.silent_sessions, self.config.silent_session_threshold
                );
                if self.budget.silent_sessions >= self.config.silent_session_threshold {
                    return DisconnectVerdict::BondLost(format!(
                        "pump ignored {} consecutive sessions",
                        self.budget.silent_sessions
                    ));
                }
            }
            return DisconnectVerdict::Transient;
        }

        if reason == DisconnectReason::PeerTerminated {
            if self.had_success {
                debug!("Pump closed the link before CONNECTED; treating as idle timeout");
                return DisconnectVerdict::Transient;
            }
            self.budget.peer_terminated += 1;
            warn!(
                "Pump closed the link before CONNECTED ({}/{})",
                self.budget.peer_terminated, self.config.peer_terminated_threshold
            );
            if self.budget.peer_terminated >= self.config.peer_terminated_threshold {
                return DisconnectVerdict::BondLost(format!(
                    "pump closed {} links before a session was established",
                    self.budget.peer_terminated
                ));
            }
        }

        DisconnectVerdict::Transient
    }

    /// Delay before the next attempt; moves to the slow phase when the fast
    /// attempts are used up
    pub fn next_delay(&mut self) -> Duration {
        if self.budget.phase == ReconnectPhase::Fast
            && self.budget.attempt >= self.config.fast_max_attempts
        {
            info!(
                "Fast reconnection exhausted after {} attempts, switching to every {:?}",
                self.budget.attempt,
                self.config.slow_interval()
            );
            self.budget.phase = ReconnectPhase::Slow;
        }

        self.budget.attempt += 1;
        match self.budget.phase {
            ReconnectPhase::Fast => {
                let delay = self.budget.current_delay;
                self.budget.current_delay =
                    std::cmp::min(self.budget.current_delay * 2, self.config.fast_max_delay());
                delay
            }
            ReconnectPhase::Slow => self.config.slow_interval(),
        }
    }

    /// Human-readable status
    pub fn status(&self) -> String {
        format!(
            "Attempt {} ({} phase), next fast delay: {:?}",
            self.budget.attempt, self.budget.phase, self.budget.current_delay
        )
    }
}
