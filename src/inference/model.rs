//! Model file checks
//!
//! Cheap header validation performed on the caller's thread before a model
//! path is handed to the engine.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const GGUF_HEADER_LEN: u64 = 24;

/// Errors that can occur while inspecting a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Fields of the fixed GGUF header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

fn read_u32(file: &mut File) -> Result<u32, ModelError> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(file: &mut File) -> Result<u64, ModelError> {
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Reads and checks the GGUF header. Versions 2 and 3 are accepted.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let mut file = File::open(path)?;

    if file.seek(SeekFrom::End(0))? < GGUF_HEADER_LEN {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = read_u32(&mut file)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = read_u32(&mut file)?;
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: read_u64(&mut file)?,
        metadata_kv_count: read_u64(&mut file)?,
    })
}

/// `.gguf` extension plus a valid header
pub fn is_gguf_file<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    let has_extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false);

    has_extension && validate_gguf(path).is_ok()
}
