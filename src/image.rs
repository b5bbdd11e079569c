//! Firmware image and init descriptor loading.
//!
//! Images come either as a raw `.bin` or as an Intel HEX `.hex` file, which
//! is flattened into a contiguous binary starting at its lowest address.
//! Gaps between records are filled with `0xFF` (erased flash).

use std::path::Path;

use ihex::Record;
use tracing::{debug, info};

use crate::error::{DfuError, Result};

const GAP_FILL: u8 = 0xFF;

/// Application image, flattened to the bytes sent over the data characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
}

impl FirmwareImage {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let bytes = match ext {
            "bin" => read(path)?,
            "hex" => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| DfuError::InvalidInput(format!("{}: {}", path.display(), e)))?;
                flatten_hex(&text)?
            }
            _ => {
                return Err(DfuError::InvalidInput(format!(
                    "{}: expected a .bin or .hex image",
                    path.display()
                )))
            }
        };
        info!(path = %path.display(), size = bytes.len(), "Loaded firmware image");
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Init packet (`.dat`) content, sent verbatim after INITIALIZE_DFU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitDescriptor {
    bytes: Vec<u8>,
}

impl InitDescriptor {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = read(path)?;
        info!(path = %path.display(), size = bytes.len(), "Loaded init descriptor");
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| DfuError::InvalidInput(format!("{}: {}", path.display(), e)))
}

fn flatten_hex(text: &str) -> Result<Vec<u8>> {
    let mut base: u32 = 0;
    let mut segments: Vec<(u32, Vec<u8>)> = Vec::new();

    for record in ihex::Reader::new(text) {
        let record = record.map_err(|e| DfuError::InvalidInput(format!("intel hex: {}", e)))?;
        match record {
            Record::Data { offset, value } => segments.push((base + offset as u32, value)),
            Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
            Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
            Record::EndOfFile => break,
            Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
        }
    }

    segments.sort_by_key(|(addr, _)| *addr);
    let start = match segments.first() {
        Some((addr, _)) => *addr,
        None => return Ok(Vec::new()),
    };
    debug!("Flattening {} intel hex records from {:#010x}", segments.len(), start);

    let mut image = Vec::new();
    for (addr, data) in segments {
        let pos = (addr - start) as usize;
        if pos < image.len() {
            return Err(DfuError::InvalidInput(format!(
                "intel hex: overlapping data at {:#010x}",
                addr
            )));
        }
        image.resize(pos, GAP_FILL);
        image.extend_from_slice(&data);
    }
    Ok(image)
}
