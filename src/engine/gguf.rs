//! GGUF header validation
//!
//! Sanity-checks a model file before handing it to llama.cpp, so a corrupt
//! or mistyped path fails fast with a readable error instead of deep inside
//! the loader.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Minimum header size: magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const MIN_HEADER_BYTES: u64 = 24;

/// Errors from GGUF header validation
#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone)]
pub struct GgufHeader {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Validates that a file starts with a well-formed GGUF header.
pub fn validate<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let mut file = File::open(path)?;

    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < MIN_HEADER_BYTES {
        return Err(GgufError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = read_u32(&mut file)?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidMagic(magic));
    }

    let version = read_u32(&mut file)?;
    // GGUF v2 and v3 are supported
    if !(2..=3).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(&mut file)?;
    let metadata_kv_count = read_u64(&mut file)?;

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

fn read_u32(file: &mut File) -> Result<u32, GgufError> {
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(file: &mut File) -> Result<u64, GgufError> {
    let mut bytes = [0u8; 8];
    file.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_header(magic: u32, version: u32) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&magic.to_le_bytes()).unwrap();
        file.write_all(&version.to_le_bytes()).unwrap();
        file.write_all(&12u64.to_le_bytes()).unwrap(); // tensor_count
        file.write_all(&7u64.to_le_bytes()).unwrap(); // metadata_kv_count
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_valid_header() {
        let file = write_header(GGUF_MAGIC, 3);
        let header = validate(file.path()).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 12);
        assert_eq!(header.metadata_kv_count, 7);
    }

    #[test]
    fn test_invalid_magic() {
        let file = write_header(0xDEADBEEF, 3);
        let result = validate(file.path());
        assert!(matches!(result, Err(GgufError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_unsupported_version() {
        let file = write_header(GGUF_MAGIC, 9);
        let result = validate(file.path());
        assert!(matches!(result, Err(GgufError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_file_too_small() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();

        let result = validate(file.path());
        assert!(matches!(result, Err(GgufError::FileTooSmall)));
    }

    #[test]
    fn test_missing_file() {
        let result = validate("/nonexistent/model.gguf");
        assert!(matches!(result, Err(GgufError::FileOpen(_))));
    }
}
