//! Transport layer for the Test Driver link
//!
//! The engine only needs a thin byte-stream capability: bounded reads with a
//! timeout, plus writes and a flush. Keeping it behind a trait lets the
//! protocol code run against a scripted stream in tests and against a real
//! serial port in production.

mod serial;

pub use serial::{open_serial, SerialConfig, SerialFlowControl, SerialParity, SerialStream};

use std::io;
use thiserror::Error;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Stream closed by the peer
    #[error("Disconnected")]
    Disconnected,
}

/// Minimal byte-stream capability required by the protocol engine.
///
/// `read` fills at most `buf.len()` bytes and returns the count; a read
/// timeout is reported as `Ok(0)`, never as an error, so callers can poll
/// a quiet link without special-casing. The timeout itself is fixed when
/// the stream is opened.
pub trait ByteStream: Send {
    /// Read up to `buf.len()` bytes, returning 0 on timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write the entire buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Flush any buffered output to the device.
    fn flush(&mut self) -> Result<(), TransportError>;
}
