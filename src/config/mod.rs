//! Transporter configuration
//!
//! Every tunable lives here and is passed into the session explicitly;
//! there is no process-wide mutable state. The struct round-trips through
//! TOML so automation rigs can keep a config file next to their test data.

use crate::core::codec::ByteOrder;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Transporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransporterConfig {
    /// Serial baud rate (the Test Driver runs at 921600)
    pub baud_rate: u32,
    /// Serial read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Line reader chunk size in bytes
    pub line_chunk_size: usize,
    /// Upload payload block size in bytes
    pub upload_block_size: usize,
    /// Raw read chunk size while capturing a compressed block
    pub capture_chunk_size: usize,
    /// Compress the test-data file before upload when it crosses the threshold
    pub auto_compression: bool,
    /// Auto-compression threshold in bytes
    pub compress_threshold_bytes: u64,
    /// Hard upper bound on the test-data file size in bytes
    pub max_payload_bytes: u64,
    /// Byte order of compressed artifact headers
    pub byte_order: ByteOrder,
    /// Aliveness check retry limit
    pub alive_max_retries: u32,
    /// Pause between protocol commands in milliseconds
    pub command_delay_ms: u64,
    /// Consecutive empty reads tolerated mid-protocol before giving up
    pub max_idle_reads: u32,
}

impl Default for TransporterConfig {
    fn default() -> Self {
        Self {
            baud_rate: 921_600,
            read_timeout_ms: 1_000,
            line_chunk_size: 256,
            upload_block_size: 8 * 1024,
            capture_chunk_size: 8 * 1024,
            auto_compression: true,
            compress_threshold_bytes: 100 * 1024,
            max_payload_bytes: 100 * 1024 * 1024,
            byte_order: ByteOrder::Big,
            alive_max_retries: 30,
            command_delay_ms: 1_000,
            max_idle_reads: 60,
        }
    }
}

impl TransporterConfig {
    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save the configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Serial read timeout as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Inter-command pause as a [`Duration`].
    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }
}
