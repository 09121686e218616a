//! Link Configuration
//!
//! Tunables for the protocol engine, loadable from TOML. Durations are
//! stored as whole seconds or milliseconds with [`Duration`] accessors.
//!
//! The bond-loss thresholds encode observed pump behaviour rather than a
//! protocol rule, so they all live here instead of in the policy code.
//!
//! ```toml
//! [framing]
//! max_chunk_size = 18
//!
//! [reconnect]
//! fast_max_attempts = 10
//! slow_interval_secs = 60
//! peer_terminated_threshold = 3
//! ```

use crate::framing::MIN_CHUNK_SIZE;
use crate::opcode::{session, RequestOpcode};
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub framing: FramingConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub stream: StreamConfig,
}

/// Chunking parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramingConfig {
    /// Payload size requested during negotiation
    #[serde(default = "default_requested_payload")]
    pub requested_payload: usize,

    /// Upper bound on chunk size regardless of what was granted
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

/// Handshake parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Deadline for the whole handshake, all rounds included
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Identifier echoed by the pump in every handshake response
    #[serde(default = "default_app_instance_id")]
    pub app_instance_id: u16,
}

/// Post-handshake session setup and request defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Requests the pump expects before it answers status reads
    #[serde(default = "default_init_opcodes")]
    pub init_opcodes: Vec<u8>,

    /// Timeout for each initialization request
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,

    /// Pause after initialization before declaring the session connected
    #[serde(default = "default_settle")]
    pub settle_ms: u64,

    /// Default timeout for caller requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Reconnection schedule and bond-loss thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// First fast-phase delay; doubles on every attempt
    #[serde(default = "default_fast_initial_delay")]
    pub fast_initial_delay_secs: u64,

    /// Cap on the fast-phase delay
    #[serde(default = "default_fast_max_delay")]
    pub fast_max_delay_secs: u64,

    /// Fast-phase attempts before switching to the slow phase
    #[serde(default = "default_fast_max_attempts")]
    pub fast_max_attempts: u32,

    /// Fixed slow-phase interval
    #[serde(default = "default_slow_interval")]
    pub slow_interval_secs: u64,

    /// Peer-terminated disconnects before CONNECTED that mean a stale bond
    #[serde(default = "default_threshold")]
    pub peer_terminated_threshold: u32,

    /// Consecutive encryption failures tolerated after a successful session
    #[serde(default = "default_threshold")]
    pub encryption_failure_threshold: u32,

    /// Consecutive sessions without a single notification
    #[serde(default = "default_threshold")]
    pub silent_session_threshold: u32,
}

/// Stream collection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Quiet period after the last packet that ends a stream
    #[serde(default = "default_stream_idle")]
    pub idle_ms: u64,
}

fn default_requested_payload() -> usize {
    185
}

fn default_max_chunk_size() -> usize {
    18
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_app_instance_id() -> u16 {
    1
}

fn default_init_opcodes() -> Vec<u8> {
    vec![
        session::API_VERSION_REQUEST,
        session::PUMP_VERSION_REQUEST,
        session::TIME_SINCE_RESET_REQUEST,
    ]
}

fn default_init_timeout() -> u64 {
    5
}

fn default_settle() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    10
}

fn default_fast_initial_delay() -> u64 {
    1
}

fn default_fast_max_delay() -> u64 {
    60
}

fn default_fast_max_attempts() -> u32 {
    10
}

fn default_slow_interval() -> u64 {
    60
}

fn default_threshold() -> u32 {
    3
}

fn default_stream_idle() -> u64 {
    500
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            requested_payload: default_requested_payload(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            app_instance_id: default_app_instance_id(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_opcodes: default_init_opcodes(),
            init_timeout_secs: default_init_timeout(),
            settle_ms: default_settle(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            fast_initial_delay_secs: default_fast_initial_delay(),
            fast_max_delay_secs: default_fast_max_delay(),
            fast_max_attempts: default_fast_max_attempts(),
            slow_interval_secs: default_slow_interval(),
            peer_terminated_threshold: default_threshold(),
            encryption_failure_threshold: default_threshold(),
            silent_session_threshold: default_threshold(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_ms: default_stream_idle(),
        }
    }
}

impl AuthConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl SessionConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Initialization requests as validated opcodes
    pub fn init_requests(&self) -> Result<Vec<RequestOpcode>> {
        self.init_opcodes.iter().map(|&op| RequestOpcode::new(op)).collect()
    }
}

impl ReconnectConfig {
    pub fn fast_initial_delay(&self) -> Duration {
        Duration::from_secs(self.fast_initial_delay_secs)
    }

    pub fn fast_max_delay(&self) -> Duration {
        Duration::from_secs(self.fast_max_delay_secs)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_secs(self.slow_interval_secs)
    }
}

impl StreamConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

impl LinkConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: LinkConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, falling back to defaults if it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No link config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        info!("Loaded link config from {}", path.display());
        Ok(config)
    }

    /// Default location under the user's config directory
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("pumplink")
            .join("link.toml")
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.framing.max_chunk_size < MIN_CHUNK_SIZE {
            return Err(ProtocolError::Configuration(format!(
                "max_chunk_size {} is below the minimum of {}",
                self.framing.max_chunk_size, MIN_CHUNK_SIZE
            )));
        }
        if self.framing.requested_payload < MIN_CHUNK_SIZE {
            return Err(ProtocolError::Configuration(format!(
                "requested_payload {} is below the minimum of {}",
                self.framing.requested_payload, MIN_CHUNK_SIZE
            )));
        }
        if self.auth.handshake_timeout_secs == 0 {
            return Err(ProtocolError::Configuration(
                "handshake_timeout_secs must be positive".to_string(),
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.fast_initial_delay_secs == 0 || reconnect.slow_interval_secs == 0 {
            return Err(ProtocolError::Configuration(
                "reconnect delays must be positive".to_string(),
            ));
        }
        if reconnect.fast_max_delay_secs < reconnect.fast_initial_delay_secs {
            return Err(ProtocolError::Configuration(
                "fast_max_delay_secs must not be below fast_initial_delay_secs".to_string(),
            ));
        }
        if reconnect.peer_terminated_threshold == 0
            || reconnect.encryption_failure_threshold == 0
            || reconnect.silent_session_threshold == 0
        {
            return Err(ProtocolError::Configuration(
                "bond-loss thresholds must be at least 1".to_string(),
            ));
        }

        if self.stream.idle_ms == 0 {
            return Err(ProtocolError::Configuration(
                "stream idle_ms must be positive".to_string(),
            ));
        }

        self.session.init_requests()?;
        Ok(())
    }
}
