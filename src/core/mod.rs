//! Core module containing the transporter engine
//!
//! This module provides:
//! - Transport layer (serial byte stream behind a minimal trait)
//! - Buffered chunked line reading with carry-over
//! - Compressed artifact codec (gzip + "Musc" framing + CRC-32)
//! - Firmware manifest extraction from test-data directives
//! - Length-verified upload handshake (firmware + test data)
//! - Capture demultiplexer for interleaved text / compressed trace output
//! - Decompression and ordered-emission pipeline workers
//! - Session lifecycle orchestration

pub mod capture;
pub mod codec;
pub mod line_reader;
pub mod manifest;
pub mod pipeline;
pub mod session;
pub mod transport;
pub mod upload;
