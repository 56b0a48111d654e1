//! Length-verified file upload handshake
//!
//! Both firmware images and the test-data payload travel over the same
//! handshake: announce the upload kind, announce the byte count, wait for
//! the device to echo what it expects, verify the echo, stream the payload
//! in fixed blocks, and wait for the load confirmation. An echo that
//! disagrees with what was sent means the device and the test build are out
//! of step, so the session aborts rather than retries.

use crate::config::TransporterConfig;
use crate::core::codec;
use crate::core::line_reader::LineReader;
use crate::core::transport::{ByteStream, TransportError};
use regex::Regex;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Device confirmation that a transfer landed.
const FILE_LOADED: &str = "File Loaded successfully";

fn firmware_ready_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r".*Transfer Firmware (\d+) in Binary \((\d+) bytes.*").expect("valid pattern")
    })
}

fn test_data_ready_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r".*Transfer Test Data File in Binary \((\d+) bytes.*").expect("valid pattern")
    })
}

/// Upload error types
#[derive(Error, Debug)]
pub enum UploadError {
    /// Source file does not exist
    #[error("file does not exist: {0}")]
    FileMissing(PathBuf),

    /// Source file is empty
    #[error("file has zero length: {0}")]
    ZeroLength(PathBuf),

    /// Source file exceeds the hard size bound
    #[error("file too big: {size} bytes, max allowed {max} bytes ({path})")]
    FileTooBig {
        /// Offending file
        path: PathBuf,
        /// Actual size in bytes
        size: u64,
        /// Configured maximum
        max: u64,
    },

    /// Device echoed a different firmware sequence number
    #[error("expected firmware number {expected}, device announced {got}; try resetting the Test Driver")]
    SequenceMismatch {
        /// Number we are uploading
        expected: u32,
        /// Number the device echoed
        got: u32,
    },

    /// Device echoed a different byte count
    #[error("expected transfer length {expected}, device announced {got}")]
    LengthMismatch {
        /// Bytes we announced
        expected: u64,
        /// Bytes the device echoed
        got: u64,
    },

    /// Device stopped answering mid-handshake
    #[error("device went quiet after {0} empty reads")]
    Timeout(u32),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Local file I/O failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Handshake driver for firmware and test-data uploads.
pub struct Uploader<'a, S: ByteStream> {
    reader: &'a mut LineReader<S>,
    cfg: &'a TransporterConfig,
}

impl<'a, S: ByteStream> Uploader<'a, S> {
    /// Create an uploader borrowing the session's line reader.
    pub fn new(reader: &'a mut LineReader<S>, cfg: &'a TransporterConfig) -> Self {
        Self { reader, cfg }
    }

    /// Upload one firmware image as sequence number `number`.
    ///
    /// The device announces which firmware slot and byte count it expects;
    /// either disagreeing with what was sent aborts before any payload
    /// bytes go out.
    pub fn upload_firmware(&mut self, number: u32, path: &Path) -> Result<(), UploadError> {
        if !path.is_file() {
            return Err(UploadError::FileMissing(path.to_path_buf()));
        }
        let length = file_length(path)?;
        if length == 0 {
            return Err(UploadError::ZeroLength(path.to_path_buf()));
        }

        info!("uploading firmware {} from {}", number, path.display());
        self.announce("upload firmware", length, true)?;

        let mut idle = 0u32;
        loop {
            let line = self.read_device_line(&mut idle)?;
            if let Some(caps) = firmware_ready_re().captures(&line) {
                let got_number: u32 = parse_capture(&caps[1]);
                let got_length: u64 = parse_capture(&caps[2]);
                if got_number != number {
                    return Err(UploadError::SequenceMismatch {
                        expected: number,
                        got: got_number,
                    });
                }
                if got_length != length {
                    return Err(UploadError::LengthMismatch {
                        expected: length,
                        got: got_length,
                    });
                }
                self.send_payload(path)?;
            }
            if line.contains(FILE_LOADED) {
                return Ok(());
            }
        }
    }

    /// Upload the test-data payload, auto-compressing above the threshold.
    ///
    /// Returns the path actually transferred (the `.gzip` sibling when
    /// compression kicked in; it is removed again after a successful
    /// transfer).
    pub fn upload_test_data(&mut self, path: &Path) -> Result<PathBuf, UploadError> {
        let length = file_length(path)?;
        if length == 0 {
            return Err(UploadError::ZeroLength(path.to_path_buf()));
        }
        if length > self.cfg.max_payload_bytes {
            return Err(UploadError::FileTooBig {
                path: path.to_path_buf(),
                size: length,
                max: self.cfg.max_payload_bytes,
            });
        }

        let mut upload_path = path.to_path_buf();
        let mut compressed = false;
        if self.cfg.auto_compression && length > self.cfg.compress_threshold_bytes {
            let mut gz = path.as_os_str().to_owned();
            gz.push(".gzip");
            let gz = PathBuf::from(gz);
            codec::compress_file(path, &gz, self.cfg.byte_order)?;
            upload_path = gz;
            compressed = true;
        }

        let length = file_length(&upload_path)?;
        info!("uploading test data file {}", upload_path.display());
        self.announce("upload testdata", length, false)?;

        let mut idle = 0u32;
        loop {
            let line = self.read_device_line(&mut idle)?;
            if let Some(caps) = test_data_ready_re().captures(&line) {
                let got_length: u64 = parse_capture(&caps[1]);
                if got_length != length {
                    return Err(UploadError::LengthMismatch {
                        expected: length,
                        got: got_length,
                    });
                }
                self.send_payload(&upload_path)?;
            }
            if line.contains(FILE_LOADED) {
                if compressed {
                    // The temporary .gzip sibling is only needed for the wire.
                    if let Err(e) = std::fs::remove_file(&upload_path) {
                        warn!("could not remove {}: {}", upload_path.display(), e);
                    }
                }
                return Ok(upload_path);
            }
        }
    }

    /// Send the upload command and the decimal length line.
    ///
    /// Only the firmware command is acknowledged with a prompt line before
    /// the device accepts the length; test-data uploads send the length
    /// immediately.
    fn announce(&mut self, command: &str, length: u64, echoed: bool) -> Result<(), UploadError> {
        self.send_line(&format!("{command}\n"))?;
        std::thread::sleep(self.cfg.command_delay());
        if echoed {
            let _ = self.reader.read_line(None, b'\n')?;
        }
        self.send_line(&format!("{length}\n"))?;
        std::thread::sleep(self.cfg.command_delay());
        Ok(())
    }

    /// Stream the payload in fixed-size blocks until exhausted.
    fn send_payload(&mut self, path: &Path) -> Result<(), UploadError> {
        let mut file = File::open(path)?;
        let mut block = vec![0u8; self.cfg.upload_block_size];
        loop {
            let n = file.read(&mut block)?;
            if n == 0 {
                break;
            }
            let stream = self.reader.stream_mut();
            stream.write_all(&block[..n])?;
            stream.flush()?;
        }
        debug!("payload {} streamed", path.display());
        Ok(())
    }

    /// Read the next non-empty device line, bounding consecutive timeouts.
    fn read_device_line(&mut self, idle: &mut u32) -> Result<String, UploadError> {
        loop {
            let line = self.reader.read_line(None, b'\n')?;
            if line.is_empty() {
                *idle += 1;
                if *idle > self.cfg.max_idle_reads {
                    return Err(UploadError::Timeout(*idle));
                }
                continue;
            }
            *idle = 0;
            let line = String::from_utf8_lossy(&line).into_owned();
            debug!(device = %line.trim_end(), "device line");
            return Ok(line);
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let stream = self.reader.stream_mut();
        stream.write_all(line.as_bytes())?;
        stream.flush()
    }
}

/// Regex `\d+` captures always parse; keep the call sites readable.
fn parse_capture<T: std::str::FromStr + Default>(s: &str) -> T {
    s.parse().unwrap_or_default()
}

/// Length of a file in bytes.
pub fn file_length(path: &Path) -> io::Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::{BlockHeader, HEADER_LEN};
    use std::collections::VecDeque;
    use std::io::Write;

    /// Scripted device: serves canned response lines, records every write.
    struct ScriptedDevice {
        responses: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ScriptedDevice {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: responses.iter().map(|r| r.as_bytes().to_vec()).collect(),
                written: Vec::new(),
            }
        }
    }

    impl ByteStream for ScriptedDevice {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            match self.responses.front_mut() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.responses.pop_front();
                    }
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn quick_cfg() -> TransporterConfig {
        TransporterConfig {
            command_delay_ms: 0,
            max_idle_reads: 3,
            ..TransporterConfig::default()
        }
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_firmware_upload_completes_on_correct_echo() {
        let dir = tempfile::tempdir().unwrap();
        let fw = write_file(&dir, "boot.bin", &[0xAA; 300]);

        let device = ScriptedDevice::new(&[
            "td>\n",
            "Transfer Firmware 1 in Binary (300 bytes)\n",
            "File Loaded successfully\n",
        ]);
        let mut reader = LineReader::with_chunk_size(device, 64);
        let cfg = quick_cfg();
        let mut uploader = Uploader::new(&mut reader, &cfg);
        uploader.upload_firmware(1, &fw).unwrap();

        let written = &reader.into_inner().written;
        let text = String::from_utf8_lossy(written);
        assert!(text.starts_with("upload firmware\n300\n"));
        // All 300 payload bytes followed the handshake.
        let payload_at = written.len() - 300;
        assert!(written[payload_at..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_firmware_sequence_mismatch_aborts_without_payload() {
        let dir = tempfile::tempdir().unwrap();
        let fw = write_file(&dir, "boot.bin", &[0xAA; 64]);

        let device = ScriptedDevice::new(&[
            "td>\n",
            "Transfer Firmware 2 in Binary (64 bytes)\n",
        ]);
        let mut reader = LineReader::with_chunk_size(device, 64);
        let cfg = quick_cfg();
        let mut uploader = Uploader::new(&mut reader, &cfg);
        let err = uploader.upload_firmware(1, &fw).unwrap_err();
        assert!(matches!(
            err,
            UploadError::SequenceMismatch { expected: 1, got: 2 }
        ));

        let written = reader.into_inner().written;
        assert_eq!(
            String::from_utf8_lossy(&written),
            "upload firmware\n64\n",
            "no payload bytes may be sent after a mismatch"
        );
    }

    #[test]
    fn test_firmware_length_mismatch_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let fw = write_file(&dir, "boot.bin", &[0xAA; 64]);

        let device = ScriptedDevice::new(&[
            "td>\n",
            "Transfer Firmware 1 in Binary (65 bytes)\n",
        ]);
        let mut reader = LineReader::with_chunk_size(device, 64);
        let cfg = quick_cfg();
        let mut uploader = Uploader::new(&mut reader, &cfg);
        let err = uploader.upload_firmware(1, &fw).unwrap_err();
        assert!(matches!(
            err,
            UploadError::LengthMismatch { expected: 64, got: 65 }
        ));
    }

    #[test]
    fn test_small_test_data_uploaded_uncompressed() {
        let dir = tempfile::tempdir().unwrap();
        let size = 50 * 1024;
        let td = write_file(&dir, "tc.txt", &vec![b'x'; size]);

        // No prompt between command and length: the test-data handshake
        // sends the byte count immediately.
        let device = ScriptedDevice::new(&[
            &format!("Transfer Test Data File in Binary ({size} bytes)\n"),
            "File Loaded successfully\n",
        ]);
        let mut reader = LineReader::with_chunk_size(device, 64);
        let cfg = quick_cfg();
        let mut uploader = Uploader::new(&mut reader, &cfg);
        let sent = uploader.upload_test_data(&td).unwrap();
        assert_eq!(sent, td, "below threshold stays uncompressed");

        let written = reader.into_inner().written;
        assert_eq!(written.len(), format!("upload testdata\n{size}\n").len() + size);
    }

    #[test]
    fn test_large_test_data_auto_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let size = 200 * 1024;
        let td = write_file(&dir, "tc.txt", &vec![b'y'; size]);

        // Compressed length is only known after framing; learn it the same
        // way the session does, then script the device echo around it.
        let gz_probe = codec::compress(&vec![b'y'; size], crate::core::codec::ByteOrder::Big).unwrap();
        let device = ScriptedDevice::new(&[
            &format!(
                "Transfer Test Data File in Binary ({} bytes)\n",
                gz_probe.len()
            ),
            "File Loaded successfully\n",
        ]);
        let mut reader = LineReader::with_chunk_size(device, 64);
        let cfg = quick_cfg();
        let mut uploader = Uploader::new(&mut reader, &cfg);
        let sent = uploader.upload_test_data(&td).unwrap();
        assert_ne!(sent, td);
        assert!(sent.to_string_lossy().ends_with(".gzip"));
        assert!(!sent.exists(), "temporary artifact removed after transfer");

        // The framed payload went over the wire; its header records the
        // original size.
        let written = reader.into_inner().written;
        let header_at = written.iter().position(|&b| b == b'M').unwrap();
        let header =
            BlockHeader::decode(&written[header_at..header_at + HEADER_LEN], cfg.byte_order)
                .unwrap();
        assert_eq!(header.uncompressed_size as usize, 200 * 1024);
    }

    #[test]
    fn test_oversized_test_data_rejected_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let td = write_file(&dir, "tc.txt", &[b'z'; 128]);

        let device = ScriptedDevice::new(&[]);
        let mut reader = LineReader::new(device);
        let cfg = TransporterConfig {
            max_payload_bytes: 100,
            command_delay_ms: 0,
            ..TransporterConfig::default()
        };
        let mut uploader = Uploader::new(&mut reader, &cfg);
        let err = uploader.upload_test_data(&td).unwrap_err();
        assert!(matches!(err, UploadError::FileTooBig { size: 128, .. }));
        assert!(reader.into_inner().written.is_empty());
    }

    #[test]
    fn test_zero_length_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let td = write_file(&dir, "tc.txt", b"");
        let device = ScriptedDevice::new(&[]);
        let mut reader = LineReader::new(device);
        let cfg = quick_cfg();
        let mut uploader = Uploader::new(&mut reader, &cfg);
        assert!(matches!(
            uploader.upload_test_data(&td),
            Err(UploadError::ZeroLength(_))
        ));
    }

    #[test]
    fn test_quiet_device_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let fw = write_file(&dir, "boot.bin", &[1u8; 8]);
        let device = ScriptedDevice::new(&["td>\n"]);
        let mut reader = LineReader::new(device);
        let cfg = quick_cfg();
        let mut uploader = Uploader::new(&mut reader, &cfg);
        assert!(matches!(
            uploader.upload_firmware(1, &fw),
            Err(UploadError::Timeout(_))
        ));
    }
}
