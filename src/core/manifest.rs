//! Firmware manifest extraction
//!
//! Test-data files reference the firmware images the Test Driver needs via
//! `# DownloadFirmware` directives. The manifest maps each 1-based sequence
//! number to a file on the PC and must be dense: the device requests the
//! images strictly in order 1..N.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Directive marker inside a test-data file.
const DIRECTIVE: &str = "# DownloadFirmware";

fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#".*FileOnPC="(.*)"\s+FirmwareFileNumber=(\d+)"#).expect("valid pattern")
    })
}

/// Manifest error types
#[derive(Error, Debug)]
pub enum ManifestError {
    /// A `# DownloadFirmware` directive did not match the expected shape
    #[error("malformed firmware directive: {0}")]
    MalformedDirective(String),

    /// Sequence numbers are not dense 1..N
    #[error("firmware sequence not dense: missing number {0}")]
    MissingNumber(u32),

    /// The same sequence number appeared twice
    #[error("duplicate firmware number {0}")]
    DuplicateNumber(u32),
}

/// Mapping from 1-based firmware sequence number to file path.
#[derive(Debug, Clone, Default)]
pub struct FirmwareManifest {
    files: BTreeMap<u32, PathBuf>,
}

impl FirmwareManifest {
    /// Extract the manifest from test-data content.
    ///
    /// An empty manifest (no directives) is valid; a sparse or duplicated
    /// sequence is not, and fails here before any upload begins.
    pub fn parse(test_data: &str) -> Result<Self, ManifestError> {
        let mut files = BTreeMap::new();
        for line in test_data.lines() {
            if !line.contains(DIRECTIVE) {
                continue;
            }
            let caps = directive_re()
                .captures(line.trim())
                .ok_or_else(|| ManifestError::MalformedDirective(line.trim().to_string()))?;
            let number: u32 = caps[2]
                .parse()
                .map_err(|_| ManifestError::MalformedDirective(line.trim().to_string()))?;
            if files.insert(number, PathBuf::from(&caps[1])).is_some() {
                return Err(ManifestError::DuplicateNumber(number));
            }
        }

        // Dense 1..N or nothing.
        for (expected, &actual) in (1..).zip(files.keys()) {
            if actual != expected {
                return Err(ManifestError::MissingNumber(expected));
            }
        }

        Ok(Self { files })
    }

    /// Firmware files in ascending sequence order.
    pub fn in_order(&self) -> impl Iterator<Item = (u32, &Path)> {
        self.files.iter().map(|(&n, p)| (n, p.as_path()))
    }

    /// Number of firmware files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when no firmware is referenced.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
