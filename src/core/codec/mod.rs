//! Compressed artifact codec
//!
//! Artifacts exchanged with the Test Driver are gzip streams wrapped in a
//! fixed 20-byte header:
//!
//! ```text
//! Magic (4 bytes, ASCII "Musc")
//! Compressed Size (4 bytes)
//! Compressed Data CRC (4 bytes)
//! Uncompressed Size (4 bytes)
//! Uncompressed Data CRC (4 bytes)
//! Data
//! ```
//!
//! All header integers use one byte order per artifact, selectable at
//! encode time. CRCs are standard CRC-32 over the raw bytes.

use bytes::{Buf, BufMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression, Crc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Header magic word: "Musc" packed MSB-first.
pub const MAGIC_WORD: u32 = u32::from_be_bytes(*b"Musc");

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 20;

/// Byte order of the header integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Big-endian (network order, the device default)
    #[default]
    Big,
    /// Little-endian
    Little,
}

/// Decode failure for a compressed artifact
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Header magic word does not match
    #[error("bad magic word {0:#010x}, expected {MAGIC_WORD:#010x}")]
    BadMagic(u32),

    /// Buffer too short to hold a header
    #[error("framed block truncated: {0} bytes, header needs {HEADER_LEN}")]
    Truncated(usize),

    /// Underlying gzip stream failed to decode
    #[error("compressed stream corrupt: {0}")]
    Corrupt(String),

    /// Artifact could not be read or written
    #[error("artifact I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Fixed binary header written immediately before a compressed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Size of the compressed payload in bytes
    pub compressed_size: u32,
    /// CRC-32 of the compressed payload
    pub compressed_crc: u32,
    /// Size of the original data in bytes
    pub uncompressed_size: u32,
    /// CRC-32 of the original data
    pub uncompressed_crc: u32,
}

impl BlockHeader {
    /// Encode the header (magic first) in the requested byte order.
    pub fn encode(&self, order: ByteOrder) -> [u8; HEADER_LEN] {
        let words = [
            MAGIC_WORD,
            self.compressed_size,
            self.compressed_crc,
            self.uncompressed_size,
            self.uncompressed_crc,
        ];
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        for word in words {
            match order {
                ByteOrder::Big => buf.put_u32(word),
                ByteOrder::Little => buf.put_u32_le(word),
            }
        }
        out
    }

    /// Decode a header from the front of `data`, rejecting a bad magic word.
    pub fn decode(data: &[u8], order: ByteOrder) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::Truncated(data.len()));
        }
        let mut buf = &data[..HEADER_LEN];
        let mut next = || match order {
            ByteOrder::Big => buf.get_u32(),
            ByteOrder::Little => buf.get_u32_le(),
        };
        let magic = next();
        if magic != MAGIC_WORD {
            return Err(DecodeError::BadMagic(magic));
        }
        Ok(Self {
            compressed_size: next(),
            compressed_crc: next(),
            uncompressed_size: next(),
            uncompressed_crc: next(),
        })
    }

    /// Try decoding in either byte order, returning the order that matched.
    pub fn detect(data: &[u8]) -> Option<(Self, ByteOrder)> {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            if let Ok(header) = Self::decode(data, order) {
                return Some((header, order));
            }
        }
        None
    }
}

/// CRC-32 of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

/// CRC-32 of a file's contents.
pub fn crc32_file(path: &Path) -> io::Result<u32> {
    Ok(crc32(&fs::read(path)?))
}

/// Compress `input` with gzip and prefix the framed header.
pub fn compress(input: &[u8], order: ByteOrder) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input)?;
    let compressed = encoder.finish()?;

    let header = BlockHeader {
        compressed_size: compressed.len() as u32,
        compressed_crc: crc32(&compressed),
        uncompressed_size: input.len() as u32,
        uncompressed_crc: crc32(input),
    };

    let mut framed = Vec::with_capacity(HEADER_LEN + compressed.len());
    framed.extend_from_slice(&header.encode(order));
    framed.extend_from_slice(&compressed);

    info!(
        "gzip: compressed {} bytes into {} bytes",
        input.len(),
        compressed.len()
    );
    Ok(framed)
}

/// Decompress a framed or raw gzip block.
///
/// A leading "Musc" header (either byte order) is stripped before the gzip
/// stream is decoded. Decode failures surface as [`DecodeError::Corrupt`]
/// rather than a low-level stream error.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let payload = match BlockHeader::detect(data) {
        Some(_) => &data[HEADER_LEN..],
        None => data,
    };
    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
    Ok(out)
}

/// Compress a file into a framed artifact at `output`.
pub fn compress_file(input: &Path, output: &Path, order: ByteOrder) -> io::Result<()> {
    let data = fs::read(input)?;
    let framed = compress(&data, order)?;
    fs::write(output, framed)?;
    Ok(())
}

/// Decompress a framed or raw gzip artifact into `output`.
pub fn decompress_file(input: &Path, output: &Path) -> Result<(), DecodeError> {
    let data = fs::read(input)?;
    let out = decompress(&data)?;
    fs::write(output, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_word_spells_musc() {
        assert_eq!(MAGIC_WORD, 0x4D75_7363);
        assert_eq!(&MAGIC_WORD.to_be_bytes(), b"Musc");
    }

    #[test]
    fn test_header_round_trip_both_orders() {
        let header = BlockHeader {
            compressed_size: 0x0102_0304,
            compressed_crc: 0xDEAD_BEEF,
            uncompressed_size: 0x0A0B_0C0D,
            uncompressed_crc: 0xCAFE_F00D,
        };
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let encoded = header.encode(order);
            let decoded = BlockHeader::decode(&encoded, order).unwrap();
            assert_eq!(decoded, header);
        }

        // Exact bytes: magic leads, big-endian spells the word out.
        let encoded = header.encode(ByteOrder::Big);
        assert_eq!(&encoded[..4], b"Musc");
        assert_eq!(&encoded[4..8], &[0x01, 0x02, 0x03, 0x04]);
        let encoded = header.encode(ByteOrder::Little);
        assert_eq!(&encoded[..4], b"csuM");
        assert_eq!(&encoded[4..8], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut encoded = BlockHeader {
            compressed_size: 1,
            compressed_crc: 2,
            uncompressed_size: 3,
            uncompressed_crc: 4,
        }
        .encode(ByteOrder::Big);
        encoded[0] = b'X';
        assert!(matches!(
            BlockHeader::decode(&encoded, ByteOrder::Big),
            Err(DecodeError::BadMagic(_))
        ));
        assert!(matches!(
            BlockHeader::decode(&[0u8; 10], ByteOrder::Big),
            Err(DecodeError::Truncated(10))
        ));
    }

    #[test]
    fn test_compress_decompress_round_trip() {
        let input: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let framed = compress(&input, order).unwrap();
            let (header, detected) = BlockHeader::detect(&framed).unwrap();
            assert_eq!(detected, order);
            assert_eq!(header.uncompressed_size as usize, input.len());
            assert_eq!(header.uncompressed_crc, crc32(&input));
            assert_eq!(header.compressed_size as usize, framed.len() - HEADER_LEN);
            assert_eq!(header.compressed_crc, crc32(&framed[HEADER_LEN..]));
            assert_eq!(decompress(&framed).unwrap(), input);
        }
    }

    #[test]
    fn test_decompress_accepts_raw_gzip() {
        let framed = compress(b"raw payload", ByteOrder::Big).unwrap();
        assert_eq!(decompress(&framed[HEADER_LEN..]).unwrap(), b"raw payload");
    }

    #[test]
    fn test_decompress_corrupt_stream_is_decode_error() {
        let mut framed = compress(b"soon to be damaged", ByteOrder::Big).unwrap();
        let last = framed.len() - 5;
        framed.truncate(last);
        assert!(matches!(
            decompress(&framed),
            Err(DecodeError::Corrupt(_))
        ));
    }
}
