//! Buffered line reader over a raw byte stream
//!
//! The device pushes trace output fast enough that reading one byte at a
//! time loses data to overruns. This reader pulls bounded chunks instead
//! and carries any unconsumed remainder over to the next call, so no byte
//! between calls is ever dropped. The remainder is also exposed directly:
//! the capture demux steals payload bytes that arrived ahead of a framed
//! compressed block header.

use crate::core::transport::{ByteStream, TransportError};

/// Default read chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 16;

/// Chunked, buffered line reader wrapping any [`ByteStream`].
pub struct LineReader<S> {
    stream: S,
    pending: Vec<u8>,
    chunk_size: usize,
}

impl<S: ByteStream> LineReader<S> {
    /// Wrap a stream with the default chunk size.
    pub fn new(stream: S) -> Self {
        Self::with_chunk_size(stream, DEFAULT_CHUNK_SIZE)
    }

    /// Wrap a stream, reading up to `chunk_size` bytes per underlying read.
    pub fn with_chunk_size(stream: S, chunk_size: usize) -> Self {
        Self {
            stream,
            pending: Vec::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Direct access to the wrapped stream (raw reads during block capture).
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the reader, returning the wrapped stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// The unconsumed remainder buffered past the last returned line.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Take up to `n` bytes from the buffered remainder.
    pub fn take_pending(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.pending.len());
        self.pending.drain(..n).collect()
    }

    /// Discard the buffered remainder, returning what was dropped.
    pub fn clear_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Read the next line, terminator included.
    ///
    /// Pulls from the carry-over buffer first, then issues chunked reads
    /// until `eol` is seen, `max` bytes have accumulated, or the stream
    /// reports no data (timeout). On timeout an empty vector is returned
    /// and any partial line stays buffered for the next call.
    pub fn read_line(&mut self, max: Option<usize>, eol: u8) -> Result<Vec<u8>, TransportError> {
        if let Some(line) = self.split_pending(max, eol) {
            return Ok(line);
        }

        loop {
            let want = match max {
                Some(m) => m.saturating_sub(self.pending.len()).min(self.chunk_size).max(1),
                None => self.chunk_size,
            };
            let mut buf = vec![0u8; want];
            let n = self.stream.read(&mut buf)?;
            if n == 0 {
                // Timeout: partial data stays pending.
                return Ok(Vec::new());
            }
            self.pending.extend_from_slice(&buf[..n]);

            if let Some(line) = self.split_pending(max, eol) {
                return Ok(line);
            }
        }
    }

    /// Split a complete line (or a `max`-capped prefix) off the pending
    /// buffer, if one is available.
    fn split_pending(&mut self, max: Option<usize>, eol: u8) -> Option<Vec<u8>> {
        if let Some(pos) = self.pending.iter().position(|&b| b == eol) {
            let mut end = pos + 1;
            if let Some(m) = max {
                end = end.min(m);
            }
            return Some(self.pending.drain(..end).collect());
        }
        if let Some(m) = max {
            if m > 0 && self.pending.len() >= m {
                return Some(self.pending.drain(..m).collect());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Stream that serves a fixed byte sequence in scripted chunk sizes,
    /// then reports timeouts forever.
    struct ChunkedStream {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkedStream {
        fn new(data: &[u8], chunk_sizes: &[usize]) -> Self {
            let mut chunks = VecDeque::new();
            let mut rest = data;
            let mut i = 0;
            while !rest.is_empty() {
                let n = chunk_sizes[i % chunk_sizes.len()].clamp(1, rest.len());
                chunks.push_back(rest[..n].to_vec());
                rest = &rest[n..];
                i += 1;
            }
            Self { chunks }
        }
    }

    impl ByteStream for ChunkedStream {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            match self.chunks.front_mut() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.chunks.pop_front();
                    }
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn write_all(&mut self, _data: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn collect_lines(reader: &mut LineReader<ChunkedStream>) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        loop {
            let line = reader.read_line(None, b'\n').unwrap();
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_lines_preserved_across_chunk_boundaries() {
        let data = b"first line\nsecond\n\nlast one\n";
        for chunk_sizes in [&[1usize][..], &[2, 3][..], &[7][..], &[64][..]] {
            let stream = ChunkedStream::new(data, chunk_sizes);
            let mut reader = LineReader::with_chunk_size(stream, 4);
            let lines = collect_lines(&mut reader);
            assert_eq!(
                lines,
                vec![
                    b"first line\n".to_vec(),
                    b"second\n".to_vec(),
                    b"\n".to_vec(),
                    b"last one\n".to_vec(),
                ],
                "chunk sizes {chunk_sizes:?}"
            );
        }
    }

    #[test]
    fn test_partial_line_stays_pending_on_timeout() {
        let stream = ChunkedStream::new(b"no terminator", &[5]);
        let mut reader = LineReader::new(stream);
        assert!(reader.read_line(None, b'\n').unwrap().is_empty());
        assert_eq!(reader.pending(), b"no terminator");
    }

    #[test]
    fn test_max_size_caps_line_length() {
        let stream = ChunkedStream::new(b"abcdefghij\nrest\n", &[3]);
        let mut reader = LineReader::new(stream);
        let line = reader.read_line(Some(4), b'\n').unwrap();
        assert_eq!(line, b"abcd");
        // The remainder of the first line is still there for the next call.
        let line = reader.read_line(None, b'\n').unwrap();
        assert_eq!(line, b"efghij\n");
        let line = reader.read_line(None, b'\n').unwrap();
        assert_eq!(line, b"rest\n");
    }

    #[test]
    fn test_take_pending_steals_buffered_bytes() {
        let stream = ChunkedStream::new(b"header\nBINARYPAYLOAD", &[64]);
        let mut reader = LineReader::with_chunk_size(stream, 64);
        assert_eq!(reader.read_line(None, b'\n').unwrap(), b"header\n");
        // One big chunked read pulled payload bytes past the header.
        assert!(reader.read_line(None, b'\n').unwrap().is_empty());
        let stolen = reader.take_pending(6);
        assert_eq!(stolen, b"BINARY");
        assert_eq!(reader.pending(), b"PAYLOAD");
    }
}
