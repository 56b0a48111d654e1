//! Capture pipeline workers
//!
//! Two background threads sit behind the capture demux. The decompression
//! worker turns raw captured payloads into text artifacts; the emitter
//! streams text artifacts to the output sink in strict capture order, no
//! matter in which order they become available. Both run until their input
//! channel closes and its backlog is drained, so no buffered block is ever
//! dropped on shutdown.

use crate::core::capture::ArtifactPaths;
use crate::core::codec::{self, DecodeError};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Output sink shared between the emitter and the session banners.
pub type SharedSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Wrap a writer as a shared output sink.
pub fn shared_sink(writer: Box<dyn Write + Send>) -> SharedSink {
    Arc::new(Mutex::new(writer))
}

/// One queued compressed block awaiting decompression.
#[derive(Debug, Clone, Copy)]
pub struct CompressedJob {
    /// Capture block index
    pub index: u64,
    /// CRC announced by the device for this block, when it parsed
    pub declared_crc: Option<u32>,
}

/// Strip transport-introduced CR bytes: every `\r` immediately followed by
/// `\n` is dropped, everything else passes through unchanged.
pub fn calibrate(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for (i, &b) in data.iter().enumerate() {
        if b == b'\r' && data.get(i + 1) == Some(&b'\n') {
            continue;
        }
        out.push(b);
    }
    out
}

/// Background worker turning captured compressed blocks into text.
pub struct DecompressionWorker {
    paths: ArtifactPaths,
    jobs: Receiver<CompressedJob>,
    ready: Sender<u64>,
}

impl DecompressionWorker {
    /// Create a worker consuming `jobs` and reporting finished indices on
    /// `ready`.
    pub fn new(paths: ArtifactPaths, jobs: Receiver<CompressedJob>, ready: Sender<u64>) -> Self {
        Self { paths, jobs, ready }
    }

    /// Spawn the worker thread. It exits when the job channel closes and
    /// all queued blocks are processed.
    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("td-decompress".into())
            .spawn(move || self.run())
            .expect("spawn decompression worker")
    }

    fn run(self) {
        while let Ok(job) = self.jobs.recv() {
            self.process(job);
            let _ = self.ready.send(job.index);
        }
        debug!("decompression worker drained, exiting");
    }

    /// Calibrate, CRC-check and decompress one block.
    ///
    /// Every failure path still leaves a text artifact behind: a corrupt
    /// block must stall neither the emitter nor the blocks after it.
    fn process(&self, job: CompressedJob) {
        let index = job.index;
        let temp = self.paths.temp(index);
        let calibrated = self.paths.calibrated(index);
        let text = self.paths.text(index);

        let outcome: Result<(), DecodeError> = (|| {
            let raw = fs::read(&temp)?;
            let cal = calibrate(&raw);
            fs::write(&calibrated, &cal)?;

            let crc = codec::crc32(&cal);
            if let Some(declared) = job.declared_crc {
                if declared != crc {
                    // Advisory only: the device's CRC line format is loose
                    // and a mismatch here has never been fatal.
                    warn!(
                        "block {}: calibrated CRC {:#010x} != announced {:#010x}",
                        index, crc, declared
                    );
                }
            }

            let plain = codec::decompress(&cal)?;
            fs::write(&text, plain)?;
            Ok(())
        })();

        if let Err(e) = outcome {
            warn!("block {}: decode failed: {}", index, e);
            let placeholder = format!(
                "\nERROR: compressed log file crashed ({}).\n\n",
                temp.display()
            );
            if let Err(e) = fs::write(&text, placeholder) {
                warn!("block {}: could not write placeholder: {}", index, e);
            }
        }

        // The temp and calibrated forms are dead once the text exists.
        for stale in [&temp, &calibrated] {
            if stale.exists() {
                let _ = fs::remove_file(stale);
            }
        }
    }
}

/// Background worker emitting text artifacts in capture order.
pub struct TextEmitter {
    paths: ArtifactPaths,
    ready: Receiver<u64>,
    sink: SharedSink,
}

impl TextEmitter {
    /// Create an emitter consuming readiness notifications on `ready`.
    pub fn new(paths: ArtifactPaths, ready: Receiver<u64>, sink: SharedSink) -> Self {
        Self { paths, ready, sink }
    }

    /// Spawn the emitter thread. Returns the number of blocks emitted once
    /// the ready channel closes and the backlog is flushed.
    pub fn spawn(self) -> JoinHandle<u64> {
        thread::Builder::new()
            .name("td-emit".into())
            .spawn(move || self.run())
            .expect("spawn text emitter")
    }

    fn run(self) -> u64 {
        let mut cursor: u64 = 0;
        // Indices that finished ahead of the cursor wait here.
        let mut parked: BinaryHeap<Reverse<u64>> = BinaryHeap::new();

        loop {
            while parked.peek() == Some(&Reverse(cursor)) {
                parked.pop();
                self.emit(cursor);
                cursor += 1;
            }
            match self.ready.recv() {
                Ok(index) => parked.push(Reverse(index)),
                Err(_) => break,
            }
        }

        // Channel closed: everything left is ready by construction.
        while let Some(Reverse(index)) = parked.pop() {
            if index != cursor {
                warn!("emit gap: expected block {}, found {}", cursor, index);
            }
            self.emit(index);
            cursor = index + 1;
        }
        cursor
    }

    /// Stream one text artifact to the sink and delete it.
    fn emit(&self, index: u64) {
        let path = self.paths.text(index);
        match fs::read(&path) {
            Ok(contents) => {
                let mut sink = self.sink.lock();
                if let Err(e) = sink.write_all(&contents).and_then(|()| sink.flush()) {
                    warn!("block {}: sink write failed: {}", index, e);
                }
            }
            Err(e) => warn!("block {}: missing text artifact {}: {}", index, path.display(), e),
        }
        if path.exists() {
            let _ = fs::remove_file(&path);
        }
        debug!("block {} emitted", index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::ByteOrder;
    use crossbeam_channel::unbounded;

    fn capture_sink() -> (SharedSink, Arc<Mutex<Vec<u8>>>) {
        struct VecWriter(Arc<Mutex<Vec<u8>>>);
        impl Write for VecWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let buffer = Arc::new(Mutex::new(Vec::new()));
        (shared_sink(Box::new(VecWriter(buffer.clone()))), buffer)
    }

    #[test]
    fn test_calibrate_strips_cr_before_lf_only() {
        assert_eq!(calibrate(b"a\r\nb"), b"a\nb");
        assert_eq!(calibrate(b"a\rb"), b"a\rb");
        assert_eq!(calibrate(b"\r\r\n"), b"\r\n");
        assert_eq!(calibrate(b"\r\n\r\n"), b"\n\n");
        assert_eq!(calibrate(b""), b"");
        assert_eq!(calibrate(b"\r"), b"\r");
    }

    #[test]
    fn test_calibrate_inverts_crlf_expansion() {
        // The device expands every LF to CRLF on the wire; calibration must
        // restore arbitrary binary payloads exactly.
        let original: Vec<u8> = (0..2048u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut wire = Vec::new();
        for &b in &original {
            if b == b'\n' {
                wire.push(b'\r');
            }
            wire.push(b);
        }
        assert_eq!(calibrate(&wire), original);
    }

    #[test]
    fn test_worker_produces_text_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path().join("run").to_string_lossy());

        let plain = b"trace line 1\ntrace line 2\n";
        let framed = codec::compress(plain, ByteOrder::Big).unwrap();
        fs::write(paths.temp(0), &framed).unwrap();

        let (jobs_tx, jobs_rx) = unbounded();
        let (ready_tx, ready_rx) = unbounded();
        let worker = DecompressionWorker::new(paths.clone(), jobs_rx, ready_tx);
        jobs_tx
            .send(CompressedJob {
                index: 0,
                declared_crc: None,
            })
            .unwrap();
        drop(jobs_tx);
        worker.spawn().join().unwrap();

        assert_eq!(ready_rx.recv().unwrap(), 0);
        assert_eq!(fs::read(paths.text(0)).unwrap(), plain);
        assert!(!paths.temp(0).exists());
        assert!(!paths.calibrated(0).exists());
    }

    #[test]
    fn test_worker_substitutes_placeholder_on_corrupt_block() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path().join("run").to_string_lossy());

        fs::write(paths.temp(4), b"definitely not gzip").unwrap();

        let (jobs_tx, jobs_rx) = unbounded();
        let (ready_tx, ready_rx) = unbounded();
        let worker = DecompressionWorker::new(paths.clone(), jobs_rx, ready_tx);
        jobs_tx
            .send(CompressedJob {
                index: 4,
                declared_crc: Some(0x1234),
            })
            .unwrap();
        drop(jobs_tx);
        worker.spawn().join().unwrap();

        // The pipeline still advances: index 4 is ready, with error text.
        assert_eq!(ready_rx.recv().unwrap(), 4);
        let text = fs::read_to_string(paths.text(4)).unwrap();
        assert!(text.contains("ERROR: compressed log file crashed"));
    }

    #[test]
    fn test_emitter_orders_out_of_order_arrivals() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path().join("run").to_string_lossy());

        for index in 0..4u64 {
            fs::write(paths.text(index), format!("block {index}\n")).unwrap();
        }

        let (ready_tx, ready_rx) = unbounded();
        let (sink, buffer) = capture_sink();
        let emitter = TextEmitter::new(paths.clone(), ready_rx, sink);
        let handle = emitter.spawn();

        // Completion order scrambled relative to capture order.
        for index in [2u64, 0, 3, 1] {
            ready_tx.send(index).unwrap();
        }
        drop(ready_tx);

        assert_eq!(handle.join().unwrap(), 4);
        let output = String::from_utf8(buffer.lock().clone()).unwrap();
        assert_eq!(output, "block 0\nblock 1\nblock 2\nblock 3\n");
        for index in 0..4u64 {
            assert!(!paths.text(index).exists(), "artifact {index} deleted");
        }
    }
}
