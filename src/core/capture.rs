//! Capture demultiplexer
//!
//! While a test executes, the Test Driver interleaves plain trace text with
//! framed compressed blocks on the same serial stream. The demux walks the
//! line stream, assigns every capture block a monotonically increasing
//! index, routes compressed payloads to the decompression queue and text
//! blocks straight to the emitter, and stops on the terminal line.

use crate::core::line_reader::LineReader;
use crate::core::pipeline::CompressedJob;
use crate::core::transport::{ByteStream, TransportError};
use crossbeam_channel::Sender;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Sentinel announcing a framed compressed block.
pub const COMPRESSED_MODE_BEGIN: &str = "***_ENTER_COMPRESSED_TRACE_LOG_MODE_***";
/// Matching exit sentinel. The device closes blocks by byte count, so this
/// never arrives as a standalone line; it is recognized for completeness.
pub const COMPRESSED_MODE_END: &str = "***_EXIT_COMPRESSED_TRACE_LOG_MODE_***";
/// Terminal line ending the capture.
pub const EXECUTION_FINISHED: &str = "Execution Finished";

/// Capture error types
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Transport failure mid-capture
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Artifact I/O failure
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Device sent a malformed block header line
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Device stopped answering before the capture finished
    #[error("device went quiet after {0} empty reads mid-capture")]
    Timeout(u32),
}

/// Per-index artifact naming, shared by the demux and the workers.
///
/// A compressed block index `i` passes through three on-disk forms:
/// `<prefix>.temp<i>.txt.gz` (raw capture), `<prefix>.<i>.txt.gz`
/// (calibrated) and `<prefix>.<i>.txt` (decompressed text). Text blocks
/// only ever exist in the third form.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    prefix: String,
}

impl ArtifactPaths {
    /// Create a naming scheme rooted at `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Raw captured payload for block `index`.
    pub fn temp(&self, index: u64) -> PathBuf {
        PathBuf::from(format!("{}.temp{}.txt.gz", self.prefix, index))
    }

    /// Calibrated (CR-stripped) payload for block `index`.
    pub fn calibrated(&self, index: u64) -> PathBuf {
        PathBuf::from(format!("{}.{}.txt.gz", self.prefix, index))
    }

    /// Decompressed or native text for block `index`.
    pub fn text(&self, index: u64) -> PathBuf {
        PathBuf::from(format!("{}.{}.txt", self.prefix, index))
    }

    /// Per-session capture metadata log.
    pub fn info_log(&self) -> PathBuf {
        PathBuf::from(format!("{}.info.log", self.prefix))
    }
}

/// Result of a completed capture run.
#[derive(Debug)]
pub struct CaptureSummary {
    /// Total number of capture blocks allocated (text and compressed)
    pub blocks: u64,
    /// The terminal device line, for the output sink
    pub final_line: String,
}

/// State machine reading device output during execution.
pub struct CaptureDemux<'a, S: ByteStream> {
    reader: &'a mut LineReader<S>,
    paths: &'a ArtifactPaths,
    jobs: Sender<CompressedJob>,
    ready: Sender<u64>,
    chunk_size: usize,
    max_idle_reads: u32,
}

impl<'a, S: ByteStream> CaptureDemux<'a, S> {
    /// Create a demux publishing compressed jobs and ready text indices.
    pub fn new(
        reader: &'a mut LineReader<S>,
        paths: &'a ArtifactPaths,
        jobs: Sender<CompressedJob>,
        ready: Sender<u64>,
        chunk_size: usize,
        max_idle_reads: u32,
    ) -> Self {
        Self {
            reader,
            paths,
            jobs,
            ready,
            chunk_size,
            max_idle_reads,
        }
    }

    /// Run the capture loop until the device reports execution finished.
    ///
    /// Dropping `self` afterwards closes both channels, which is the
    /// pipeline's shutdown signal.
    pub fn run(mut self) -> Result<CaptureSummary, CaptureError> {
        let mut info = BufWriter::new(File::create(self.paths.info_log())?);
        let mut index: u64 = 0;
        // Lazily opened on the first text line after a state transition.
        let mut text: Option<(u64, BufWriter<File>)> = None;
        let mut idle = 0u32;

        loop {
            let line = self.reader.read_line(None, b'\n')?;
            if line.is_empty() {
                idle += 1;
                if idle > self.max_idle_reads {
                    return Err(CaptureError::Timeout(idle));
                }
                continue;
            }
            idle = 0;
            let text_line = String::from_utf8_lossy(&line).into_owned();

            if text_line.contains(COMPRESSED_MODE_BEGIN) {
                self.close_text_block(&mut text)?;
                writeln!(info, "idx = {}, mark = {}", index, text_line.trim_end())?;
                self.capture_compressed_block(index, &mut info)?;
                index += 1;
            } else if text_line.contains(EXECUTION_FINISHED) {
                self.close_text_block(&mut text)?;
                writeln!(info, "get {}", text_line.trim_end())?;
                info.flush()?;
                return Ok(CaptureSummary {
                    blocks: index,
                    final_line: text_line,
                });
            } else if text_line.contains(COMPRESSED_MODE_END) {
                // Counted payloads already ended the block; log and move on.
                writeln!(info, "stray exit mark = {}", text_line.trim_end())?;
            } else {
                if text.is_none() {
                    let file = BufWriter::new(File::create(self.paths.text(index))?);
                    text = Some((index, file));
                    index += 1;
                }
                if let Some((_, file)) = text.as_mut() {
                    file.write_all(&line)?;
                }
            }
        }
    }

    /// Close the open text artifact, if any, and hand its index to the
    /// emitter.
    fn close_text_block(
        &mut self,
        text: &mut Option<(u64, BufWriter<File>)>,
    ) -> Result<(), CaptureError> {
        if let Some((index, mut file)) = text.take() {
            file.flush()?;
            drop(file);
            debug!("text block {} closed", index);
            let _ = self.ready.send(index);
        }
        Ok(())
    }

    /// Read one compressed block: CRC line, decimal length line, then
    /// exactly `length` payload bytes.
    fn capture_compressed_block(
        &mut self,
        index: u64,
        info: &mut BufWriter<File>,
    ) -> Result<(), CaptureError> {
        let crc_line = self.read_metadata_line()?;
        writeln!(info, "crc = {}", crc_line.trim_end())?;
        let declared_crc = parse_crc_line(&crc_line);

        let size_line = self.read_metadata_line()?;
        writeln!(info, "len = {}", size_line.trim_end())?;
        let length: usize = size_line
            .trim()
            .parse()
            .map_err(|_| CaptureError::Protocol(format!("bad block length line: {size_line:?}")))?;

        // Drain bytes the line reader already buffered past the header,
        // then read the remainder in bounded chunks.
        let mut payload = self.reader.take_pending(length);
        let mut idle = 0u32;
        while payload.len() < length {
            let want = (length - payload.len()).min(self.chunk_size);
            let mut buf = vec![0u8; want];
            let n = self.reader.stream_mut().read(&mut buf)?;
            if n == 0 {
                idle += 1;
                if idle > self.max_idle_reads {
                    return Err(CaptureError::Timeout(idle));
                }
                continue;
            }
            idle = 0;
            payload.extend_from_slice(&buf[..n]);
        }
        if payload.len() > length {
            // Unreachable with exact-sized reads, kept as a protocol guard.
            warn!(
                "block {}: {} surplus bytes past declared length, discarded",
                index,
                payload.len() - length
            );
            writeln!(
                info,
                "extra data = {:?}",
                &payload[length..payload.len().min(length + 64)]
            )?;
            payload.truncate(length);
        }

        std::fs::write(self.paths.temp(index), &payload)?;
        info.flush()?;
        let _ = self.jobs.send(CompressedJob {
            index,
            declared_crc,
        });
        Ok(())
    }

    /// Block metadata lines follow the sentinel immediately, but the link
    /// may still be mid-flight; tolerate a bounded number of timeouts.
    fn read_metadata_line(&mut self) -> Result<String, CaptureError> {
        let mut idle = 0u32;
        loop {
            let line = self.reader.read_line(None, b'\n')?;
            if line.is_empty() {
                idle += 1;
                if idle > self.max_idle_reads {
                    return Err(CaptureError::Timeout(idle));
                }
                continue;
            }
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
    }
}

/// Best-effort parse of the device's CRC metadata line (hex with or
/// without `0x`, or decimal). The value is advisory; see the worker.
pub fn parse_crc_line(line: &str) -> Option<u32> {
    let token = line.trim().split_whitespace().last()?;
    let hex = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X"));
    if let Some(hex) = hex {
        return u32::from_str_radix(hex, 16).ok();
    }
    token
        .parse::<u32>()
        .ok()
        .or_else(|| u32::from_str_radix(token, 16).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_paths_follow_prefix_scheme() {
        let paths = ArtifactPaths::new("/tmp/run/TC_1025");
        assert_eq!(
            paths.temp(3),
            PathBuf::from("/tmp/run/TC_1025.temp3.txt.gz")
        );
        assert_eq!(paths.calibrated(3), PathBuf::from("/tmp/run/TC_1025.3.txt.gz"));
        assert_eq!(paths.text(3), PathBuf::from("/tmp/run/TC_1025.3.txt"));
        assert_eq!(paths.info_log(), PathBuf::from("/tmp/run/TC_1025.info.log"));
    }

    #[test]
    fn test_parse_crc_line_formats() {
        assert_eq!(parse_crc_line("0xDEADBEEF\n"), Some(0xDEAD_BEEF));
        assert_eq!(parse_crc_line("crc = 0x0000ABCD\n"), Some(0xABCD));
        assert_eq!(parse_crc_line("12345\n"), Some(12_345));
        assert_eq!(parse_crc_line("FFFF\n"), Some(0xFFFF));
        assert_eq!(parse_crc_line("not a number\n"), None);
        assert_eq!(parse_crc_line("\n"), None);
    }
}
