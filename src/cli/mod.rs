//! CLI support
//!
//! Exit codes for automation rigs that shell out to the transporter.

use crate::core::capture::CaptureError;
use crate::core::session::SessionError;
use crate::core::upload::UploadError;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Serial port could not be opened
    pub const CONNECTION_FAILED: u8 = 3;

    /// Device did not answer the aliveness check
    pub const DEVICE_UNRESPONSIVE: u8 = 4;

    /// Input file missing, empty or oversized
    pub const PRECONDITION_FAILED: u8 = 5;

    /// Device echo disagreed with what was sent
    pub const HANDSHAKE_MISMATCH: u8 = 6;

    /// Firmware manifest sparse or malformed
    pub const MANIFEST_ERROR: u8 = 7;

    /// Capture protocol error
    pub const PROTOCOL_ERROR: u8 = 8;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// Map a session error onto its exit code.
pub fn exit_code_for(err: &SessionError) -> u8 {
    match err {
        SessionError::Unresponsive { .. } => ExitCodes::DEVICE_UNRESPONSIVE,
        SessionError::Manifest(_) => ExitCodes::MANIFEST_ERROR,
        SessionError::Transport(_) => ExitCodes::CONNECTION_FAILED,
        SessionError::Upload(upload) => match upload {
            UploadError::SequenceMismatch { .. } | UploadError::LengthMismatch { .. } => {
                ExitCodes::HANDSHAKE_MISMATCH
            }
            UploadError::FileMissing(_)
            | UploadError::ZeroLength(_)
            | UploadError::FileTooBig { .. } => ExitCodes::PRECONDITION_FAILED,
            UploadError::Timeout(_) => ExitCodes::DEVICE_UNRESPONSIVE,
            UploadError::Transport(_) => ExitCodes::CONNECTION_FAILED,
            UploadError::Io(_) => ExitCodes::ERROR,
        },
        SessionError::Capture(capture) => match capture {
            CaptureError::Protocol(_) => ExitCodes::PROTOCOL_ERROR,
            CaptureError::Timeout(_) => ExitCodes::DEVICE_UNRESPONSIVE,
            CaptureError::Transport(_) => ExitCodes::CONNECTION_FAILED,
            CaptureError::Io(_) => ExitCodes::ERROR,
        },
        SessionError::Io(_) => ExitCodes::ERROR,
        SessionError::Worker(_) => ExitCodes::INTERNAL_ERROR,
    }
}
