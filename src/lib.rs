//! # Tdlink
//!
//! A serial transporter for the hardware Test Driver. It verifies the
//! device is responsive over its serial link, uploads firmware images and
//! the test-data payload through a length-verified handshake, triggers
//! execution, and reassembles the device's interleaved text / compressed
//! trace output into an ordered, decompressed log stream in real time.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tdlink::{run_test_file, SessionOptions, TransporterConfig};
//!
//! fn main() -> Result<(), tdlink::SessionError> {
//!     let options = SessionOptions {
//!         debug_mode: false,
//!         timestamps_off: true,
//!     };
//!     run_test_file(
//!         "/dev/ttyUSB0",
//!         std::path::Path::new("TC_1025.txt"),
//!         options,
//!         TransporterConfig::default(),
//!         None, // captured output to stdout
//!     )?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{exit_code_for, ExitCodes};
pub use crate::config::TransporterConfig;
pub use crate::core::capture::{ArtifactPaths, CaptureDemux, CaptureSummary};
pub use crate::core::codec::{BlockHeader, ByteOrder, DecodeError, MAGIC_WORD};
pub use crate::core::line_reader::LineReader;
pub use crate::core::manifest::{FirmwareManifest, ManifestError};
pub use crate::core::pipeline::{shared_sink, DecompressionWorker, SharedSink, TextEmitter};
pub use crate::core::session::{
    run_session, run_test_file, run_test_str, Session, SessionError, SessionOptions,
};
pub use crate::core::transport::{
    open_serial, ByteStream, SerialConfig, SerialFlowControl, SerialParity, TransportError,
};
pub use crate::core::upload::{UploadError, Uploader};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
