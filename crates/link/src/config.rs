//! Link configuration

use protocol::HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default scratch buffer capacity per direction (1 MiB)
pub const DEFAULT_SCRATCH_CAPACITY: usize = 1024 * 1024;

/// Default granularity at which blocking drivers check for cancellation
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Construction-time settings of a [`UsbDataLink`](crate::UsbDataLink)
///
/// # Example Configuration
/// ```toml
/// scratch_capacity = 1048576
/// transfer_timeout_ms = 5000   # omit for no timeout
/// handshake_timeout_ms = 10000 # omit to wait forever
/// poll_interval_ms = 100
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Size of each physical transfer buffer; bounds how much output can be
    /// in flight in one transfer
    #[serde(default = "LinkConfig::default_scratch_capacity")]
    pub scratch_capacity: usize,
    /// Per-transfer timeout in milliseconds (None = wait forever)
    #[serde(default)]
    pub transfer_timeout_ms: Option<u64>,
    /// How long `connect` waits for the peer's answer (None = wait forever)
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
    /// Cancellation polling granularity for blocking drivers
    #[serde(default = "LinkConfig::default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scratch_capacity: Self::default_scratch_capacity(),
            transfer_timeout_ms: None,
            handshake_timeout_ms: None,
            poll_interval_ms: Self::default_poll_interval(),
        }
    }
}

impl LinkConfig {
    fn default_scratch_capacity() -> usize {
        DEFAULT_SCRATCH_CAPACITY
    }

    fn default_poll_interval() -> u64 {
        DEFAULT_POLL_INTERVAL_MS
    }

    pub fn with_scratch_capacity(mut self, capacity: usize) -> Self {
        self.scratch_capacity = capacity;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfer_timeout_ms.map(Duration::from_millis)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Largest payload that fits in one frame of one transfer
    pub fn max_frame_payload(&self) -> usize {
        self.scratch_capacity.saturating_sub(HEADER_SIZE)
    }

    /// Validate configuration values
    pub fn validate(&self) -> common::Result<()> {
        if self.scratch_capacity <= HEADER_SIZE {
            return Err(common::Error::Config(format!(
                "scratch_capacity must exceed the {}-byte frame header, got {}",
                HEADER_SIZE, self.scratch_capacity
            )));
        }
        if self.scratch_capacity > u32::MAX as usize {
            return Err(common::Error::Config(format!(
                "scratch_capacity {} does not fit a 32-bit frame length",
                self.scratch_capacity
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(common::Error::Config(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.transfer_timeout_ms == Some(0) {
            return Err(common::Error::Config(
                "transfer_timeout_ms must be greater than 0 when set".to_string(),
            ));
        }
        if self.handshake_timeout_ms == Some(0) {
            return Err(common::Error::Config(
                "handshake_timeout_ms must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}
