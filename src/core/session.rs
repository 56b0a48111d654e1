//! Session lifecycle against the Test Driver
//!
//! A session owns the serial line for one test run: it proves the device is
//! alive, configures trace modes, uploads firmware and test data, triggers
//! execution and drains the capture pipeline. Every step is fatal on
//! failure except the aliveness check, which reports an unresponsive device
//! as an ordinary error result.

use crate::config::TransporterConfig;
use crate::core::capture::{ArtifactPaths, CaptureDemux, CaptureError};
use crate::core::line_reader::LineReader;
use crate::core::manifest::{FirmwareManifest, ManifestError};
use crate::core::pipeline::{shared_sink, DecompressionWorker, SharedSink, TextEmitter};
use crate::core::transport::{open_serial, ByteStream, SerialConfig, TransportError};
use crate::core::upload::{file_length, UploadError, Uploader};
use chrono::Local;
use crossbeam_channel::unbounded;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// The device's ready prompt marker.
const READY_PROMPT: &str = "td>";

/// Session error types
#[derive(Error, Debug)]
pub enum SessionError {
    /// Aliveness check exhausted its retries
    #[error("Test Driver is not responding after {retries} attempts")]
    Unresponsive {
        /// Number of blank-line pokes sent
        retries: u32,
    },

    /// Upload precondition or handshake failure
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Firmware manifest was sparse or malformed
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Capture loop failure
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Local file I/O failure
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A pipeline worker thread panicked
    #[error("pipeline worker failed: {0}")]
    Worker(String),
}

/// Optional device toggles for a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Put the Test Driver in debug mode (extra internals in the trace)
    pub debug_mode: bool,
    /// Turn trace timestamps off (useful when diffing two runs)
    pub timestamps_off: bool,
}

/// An active transporter session over one byte stream.
pub struct Session<S: ByteStream> {
    reader: LineReader<S>,
    cfg: TransporterConfig,
    paths: ArtifactPaths,
    test_data_path: PathBuf,
    manifest: FirmwareManifest,
    sink: SharedSink,
}

impl<S: ByteStream> Session<S> {
    /// Create a session over an already-open stream.
    ///
    /// Reads the test-data file, extracts the firmware manifest (failing
    /// here on a sparse sequence) and derives the artifact prefix from the
    /// test-data file name.
    pub fn new(
        stream: S,
        test_data_path: &Path,
        cfg: TransporterConfig,
        sink: SharedSink,
    ) -> Result<Self, SessionError> {
        let content = String::from_utf8_lossy(&fs::read(test_data_path)?).into_owned();
        let manifest = FirmwareManifest::parse(&content)?;

        let prefix = test_data_path
            .to_string_lossy()
            .trim_end_matches(".txt")
            .trim_end_matches(".gzip")
            .to_string();

        let reader = LineReader::with_chunk_size(stream, cfg.line_chunk_size);
        Ok(Self {
            reader,
            cfg,
            paths: ArtifactPaths::new(prefix),
            test_data_path: test_data_path.to_path_buf(),
            manifest,
            sink,
        })
    }

    /// Run the full lifecycle: aliveness, toggles, compressed-trace mode,
    /// uploads, execution, drain.
    pub fn run(&mut self, options: SessionOptions) -> Result<(), SessionError> {
        self.verify_alive()?;
        if options.debug_mode {
            self.set_debug_mode()?;
        }
        if options.timestamps_off {
            self.set_timestamps_off()?;
        }
        self.set_compressed_mode(true)?;
        self.upload_all()?;
        self.execute()
    }

    /// Prove the device is listening: poke with blank lines until the ready
    /// prompt shows, up to the configured retry bound at roughly one-second
    /// intervals (the read timeout paces the loop).
    pub fn verify_alive(&mut self) -> Result<(), SessionError> {
        std::thread::sleep(self.cfg.command_delay());
        for _ in 0..self.cfg.alive_max_retries {
            self.send_line("\n\n")?;
            let line = self.reader.read_line(None, b'\n')?;
            if !line.is_empty() {
                let line = String::from_utf8_lossy(&line);
                debug!(device = %line.trim_end(), "aliveness probe");
                if line.contains(READY_PROMPT) {
                    info!("Test Driver is alive");
                    return Ok(());
                }
            }
        }
        Err(SessionError::Unresponsive {
            retries: self.cfg.alive_max_retries,
        })
    }

    /// Turn on the Test Driver's debug mode. Debug mode adds internal data
    /// structures of the device-side parser to the trace; it does not touch
    /// the UUT.
    pub fn set_debug_mode(&mut self) -> Result<(), SessionError> {
        self.toggle_command("td debugmode")
    }

    /// Turn trace timestamps off on the device.
    pub fn set_timestamps_off(&mut self) -> Result<(), SessionError> {
        self.toggle_command("td timestamps")
    }

    /// Enable or disable compressed-trace mode.
    ///
    /// Any bytes buffered ahead of the command are stale prompt output;
    /// they are dropped so the prompt match below cannot trip on them.
    pub fn set_compressed_mode(&mut self, on: bool) -> Result<(), SessionError> {
        let stale = self.reader.clear_pending();
        if !stale.is_empty() {
            debug!("dropped {} stale bytes before mode toggle", stale.len());
        }

        let flag = if on { 1 } else { 0 };
        self.send_line(&format!("T>TLSCFG {flag}\n"))?;
        std::thread::sleep(self.cfg.command_delay());

        let mut idle = 0u32;
        loop {
            let line = self.reader.read_line(None, b'\n')?;
            if line.is_empty() {
                idle += 1;
                if idle > self.cfg.max_idle_reads {
                    return Err(SessionError::Unresponsive { retries: idle });
                }
                // Poke the prompt awake and try again.
                std::thread::sleep(self.cfg.command_delay());
                self.send_line("\n")?;
                continue;
            }
            if String::from_utf8_lossy(&line).contains(READY_PROMPT) {
                info!("compressed trace mode {}", if on { "on" } else { "off" });
                return Ok(());
            }
        }
    }

    /// Upload every firmware file in sequence order, then the test data.
    pub fn upload_all(&mut self) -> Result<(), SessionError> {
        let firmware: Vec<(u32, PathBuf)> = self
            .manifest
            .in_order()
            .map(|(n, p)| (n, p.to_path_buf()))
            .collect();
        let test_data = self.test_data_path.clone();
        let mut uploader = Uploader::new(&mut self.reader, &self.cfg);
        for (number, path) in &firmware {
            info!("uploading firmware {} - {}", number, path.display());
            uploader.upload_firmware(*number, path)?;
        }
        uploader.upload_test_data(&test_data)?;
        Ok(())
    }

    /// Trigger execution, capture the interleaved output and drain the
    /// pipeline so every allocated block reaches the sink in order.
    pub fn execute(&mut self) -> Result<(), SessionError> {
        let (jobs_tx, jobs_rx) = unbounded();
        let (ready_tx, ready_rx) = unbounded();

        let worker =
            DecompressionWorker::new(self.paths.clone(), jobs_rx, ready_tx.clone()).spawn();
        let emitter =
            TextEmitter::new(self.paths.clone(), ready_rx, self.sink.clone()).spawn();

        self.send_line("run\n")?;
        let result = CaptureDemux::new(
            &mut self.reader,
            &self.paths,
            jobs_tx,
            ready_tx,
            self.cfg.capture_chunk_size,
            self.cfg.max_idle_reads,
        )
        .run();
        // The demux dropped its channel ends either way; the workers drain
        // and exit, which is the pipeline's shutdown handshake.

        worker
            .join()
            .map_err(|_| SessionError::Worker("decompression worker panicked".into()))?;
        let emitted = emitter
            .join()
            .map_err(|_| SessionError::Worker("text emitter panicked".into()))?;

        let summary = result?;
        if emitted != summary.blocks {
            warn!(
                "emitted {} blocks but {} were captured",
                emitted, summary.blocks
            );
        }
        debug!("drained {} capture blocks", emitted);

        {
            let mut sink = self.sink.lock();
            sink.write_all(summary.final_line.as_bytes())?;
            sink.flush()?;
        }

        // The capture metadata file is per-session scratch.
        let info_log = self.paths.info_log();
        if info_log.exists() {
            let _ = fs::remove_file(info_log);
        }
        Ok(())
    }

    /// Send a toggle command followed by its "1" argument and wait for the
    /// prompt.
    fn toggle_command(&mut self, command: &str) -> Result<(), SessionError> {
        self.send_line(&format!("{command}\n"))?;
        std::thread::sleep(self.cfg.command_delay());
        self.send_line("1\n\n")?;
        std::thread::sleep(self.cfg.command_delay());

        let mut idle = 0u32;
        loop {
            let line = self.reader.read_line(None, b'\n')?;
            if line.is_empty() {
                idle += 1;
                if idle > self.cfg.max_idle_reads {
                    return Err(SessionError::Unresponsive { retries: idle });
                }
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            debug!(device = %line.trim_end(), "toggle response");
            if line.contains(READY_PROMPT) {
                return Ok(());
            }
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let stream = self.reader.stream_mut();
        stream.write_all(line.as_bytes())?;
        stream.flush()
    }
}

/// Run a test-data file against the Test Driver on `port`.
///
/// Opens the serial endpoint with the device's fixed line parameters,
/// writes captured output to `sink` (stdout when `None`) and returns when
/// the capture pipeline has fully drained.
pub fn run_test_file(
    port: &str,
    test_data_path: &Path,
    options: SessionOptions,
    cfg: TransporterConfig,
    sink: Option<Box<dyn Write + Send>>,
) -> Result<(), SessionError> {
    // Hard size bound is a precondition: checked before the port opens.
    let length = file_length(test_data_path).map_err(UploadError::Io)?;
    if length > cfg.max_payload_bytes {
        return Err(SessionError::Upload(UploadError::FileTooBig {
            path: test_data_path.to_path_buf(),
            size: length,
            max: cfg.max_payload_bytes,
        }));
    }

    let serial = SerialConfig::new(port, cfg.baud_rate).read_timeout(cfg.read_timeout());
    let stream = open_serial(&serial)?;

    let sink = shared_sink(sink.unwrap_or_else(|| Box::new(io::stdout())));
    run_session(stream, test_data_path, options, cfg, sink)
}

/// Run a session over an already-open byte stream. Split out from
/// [`run_test_file`] so tests can drive the full lifecycle over a scripted
/// stream.
pub fn run_session<S: ByteStream>(
    stream: S,
    test_data_path: &Path,
    options: SessionOptions,
    cfg: TransporterConfig,
    sink: SharedSink,
) -> Result<(), SessionError> {
    banner(&sink, "PC-TO-TestDriver-Start");
    let mut session = Session::new(stream, test_data_path, cfg, sink.clone())?;
    let result = session.run(options);
    banner(&sink, "PC-TO-TestDriver-End");
    result
}

/// Run a test payload given as a string buffer.
///
/// The buffer is written to `txt_file` (or `temp.txt`) first; when
/// `log_file` is given the captured output goes there instead of stdout.
pub fn run_test_str(
    payload: &str,
    port: &str,
    options: SessionOptions,
    cfg: TransporterConfig,
    txt_file: Option<&Path>,
    log_file: Option<&Path>,
) -> Result<(), SessionError> {
    let path = txt_file.unwrap_or_else(|| Path::new("temp.txt"));
    fs::write(path, payload)?;

    let sink: Option<Box<dyn Write + Send>> = match log_file {
        Some(log) => Some(Box::new(fs::File::create(log)?)),
        None => None,
    };
    run_test_file(port, path, options, cfg, sink)
}

/// Write the original transporter's session banner line.
fn banner(sink: &SharedSink, label: &str) {
    let mut sink = sink.lock();
    let _ = writeln!(
        sink,
        "======== {} {} ========",
        label,
        Local::now().format("%a %b %e %H:%M:%S %Y")
    );
    let _ = sink.flush();
}
