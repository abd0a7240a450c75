//! GGUF model files
//!
//! Cheap header validation run before handing a file to llama.cpp, so a
//! truncated download or wrong file type fails with a clear message.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

/// "GGUF" read as a little-endian u32
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Highest GGUF version llama.cpp currently writes
const MAX_SUPPORTED_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to read model file: {0}")]
    Io(#[from] io::Error),

    #[error("Not a GGUF file (magic {0:#010x})")]
    BadMagic(u32),

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("GGUF header is truncated")]
    Truncated,
}

/// Header fields of a GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Check the GGUF header of `path`
pub fn validate_gguf(path: &Path) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    let magic = read_u32(&mut file)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::BadMagic(magic));
    }

    let version = read_u32(&mut file)?;
    let (tensor_count, metadata_kv_count) = match version {
        // v1 stored both counts as u32
        1 => (read_u32(&mut file)? as u64, read_u32(&mut file)? as u64),
        2..=MAX_SUPPORTED_VERSION => (read_u64(&mut file)?, read_u64(&mut file)?),
        other => return Err(ModelError::UnsupportedVersion(other)),
    };

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

fn read_u32(reader: &mut impl Read) -> Result<u32, ModelError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, ModelError> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), ModelError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ModelError::Truncated,
        _ => ModelError::Io(e),
    })
}
