//! Binary dump file format.
//!
//! Layout (big-endian):
//!
//! ```text
//! offset  field              size
//! ------  -----------------  -----------
//! 0       magic "MNTN"       4 bytes
//! 4       version (u16)      2 bytes
//! 6       memory_size (u64)  8 bytes   (uncompressed length)
//! 14      metadata_size(u32) 4 bytes
//! 18      metadata           metadata_size bytes (MessagePack)
//! 18+m    compressed_memory  remainder (zlib)
//! ```
//!
//! Metadata is the MessagePack encoding of every dump field except `memory`.
//! Encoding is a pure function of dump contents; a round trip reproduces
//! every field exactly, and the memory block decompresses to the original
//! bytes. The `.mntn` file extension is advisory; the codec only looks at
//! the bytes.

use crate::dump::ForensicDump;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

pub const DUMP_MAGIC: [u8; 4] = *b"MNTN";
pub const DUMP_VERSION: u16 = 1;

const HEADER_LEN: usize = 18;

/// Dump encoding and decoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input does not start with the dump magic.
    #[error("invalid dump format")]
    InvalidFormat,

    /// The dump was written by a newer encoder.
    #[error("unsupported dump version {0}")]
    UnsupportedVersion(u16),

    /// The input ends before the declared metadata block.
    #[error("dump truncated")]
    Truncated,

    #[error("dump metadata: {0}")]
    Metadata(String),

    /// The memory block failed to decompress, or decompressed to a length
    /// other than the declared `memory_size`.
    #[error("dump memory block: {0}")]
    Memory(String),
}

/// Serialize a dump to the binary file format.
pub fn encode(dump: &ForensicDump) -> Result<Vec<u8>, CodecError> {
    let metadata = rmp_serde::to_vec_named(dump).map_err(|e| CodecError::Metadata(e.to_string()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + metadata.len() + dump.memory.len() / 4);
    out.extend_from_slice(&DUMP_MAGIC);
    out.extend_from_slice(&DUMP_VERSION.to_be_bytes());
    out.extend_from_slice(&(dump.memory.len() as u64).to_be_bytes());
    out.extend_from_slice(&(metadata.len() as u32).to_be_bytes());
    out.extend_from_slice(&metadata);

    if !dump.memory.is_empty() {
        let mut encoder = ZlibEncoder::new(out, Compression::default());
        encoder
            .write_all(&dump.memory)
            .map_err(|e| CodecError::Memory(e.to_string()))?;
        out = encoder
            .finish()
            .map_err(|e| CodecError::Memory(e.to_string()))?;
    }

    Ok(out)
}

/// Deserialize a dump from the binary file format.
pub fn decode(bytes: &[u8]) -> Result<ForensicDump, CodecError> {
    if bytes.len() < 4 || bytes[0..4] != DUMP_MAGIC {
        return Err(CodecError::InvalidFormat);
    }
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated);
    }

    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version > DUMP_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let memory_size = u64::from_be_bytes(
        bytes[6..14]
            .try_into()
            .map_err(|_| CodecError::Truncated)?,
    ) as usize;
    let metadata_size = u32::from_be_bytes(
        bytes[14..18]
            .try_into()
            .map_err(|_| CodecError::Truncated)?,
    ) as usize;

    let metadata_end = HEADER_LEN
        .checked_add(metadata_size)
        .ok_or(CodecError::Truncated)?;
    if bytes.len() < metadata_end {
        return Err(CodecError::Truncated);
    }

    let mut dump: ForensicDump = rmp_serde::from_slice(&bytes[HEADER_LEN..metadata_end])
        .map_err(|e| CodecError::Metadata(e.to_string()))?;

    let compressed = &bytes[metadata_end..];
    if memory_size > 0 && !compressed.is_empty() {
        let mut memory = Vec::with_capacity(memory_size);
        ZlibDecoder::new(compressed)
            .read_to_end(&mut memory)
            .map_err(|e| CodecError::Memory(e.to_string()))?;
        if memory.len() != memory_size {
            return Err(CodecError::Memory(format!(
                "decompressed to {} bytes, expected {memory_size}",
                memory.len()
            )));
        }
        dump.memory = memory;
    }

    Ok(dump)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::{FailureReason, PAGE_SIZE};
    use chrono::Utc;
    use montane_types::runtime::{StackFrame, TrapKind};

    fn sample_dump(memory: Vec<u8>) -> ForensicDump {
        ForensicDump {
            id: "00112233445566778899aabbccddeeff".to_string(),
            timestamp: Utc::now(),
            reason: FailureReason::Trap {
                kind: TrapKind::OutOfBounds,
                detail: "wasm trap: out of bounds memory access".to_string(),
            },
            memory,
            fuel_remaining: 777,
            fuel_allocated: 10_000,
            function_called: "crash_after_n".to_string(),
            args_hash: [42u8; 32],
            execution_time_us: 9_001,
            stack_trace: Some(vec![
                StackFrame {
                    function_index: 3,
                    function_name: Some("crash_after_n".to_string()),
                    module_offset: Some(0x120),
                },
                StackFrame {
                    function_index: 0,
                    function_name: None,
                    module_offset: None,
                },
            ]),
        }
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let mut memory = vec![0u8; PAGE_SIZE];
        memory[100..108].copy_from_slice(b"needle!!");
        let dump = sample_dump(memory);
        let decoded = decode(&encode(&dump).unwrap()).unwrap();
        assert_eq!(decoded, dump);
    }

    #[test]
    fn test_round_trip_empty_memory() {
        let dump = sample_dump(Vec::new());
        let bytes = encode(&dump).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, dump);
        assert!(decoded.memory.is_empty());
    }

    #[test]
    fn test_encoding_is_pure() {
        let dump = sample_dump(vec![5u8; PAGE_SIZE]);
        assert_eq!(encode(&dump).unwrap(), encode(&dump).unwrap());
    }

    #[test]
    fn test_header_layout() {
        let dump = sample_dump(vec![1u8; PAGE_SIZE]);
        let bytes = encode(&dump).unwrap();
        assert_eq!(&bytes[0..4], b"MNTN");
        assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), DUMP_VERSION);
        assert_eq!(
            u64::from_be_bytes(bytes[6..14].try_into().unwrap()),
            PAGE_SIZE as u64
        );
    }

    #[test]
    fn test_compression_shrinks_uniform_memory() {
        let dump = sample_dump(vec![0u8; 4 * PAGE_SIZE]);
        let bytes = encode(&dump).unwrap();
        assert!(bytes.len() < PAGE_SIZE);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dump = sample_dump(Vec::new());
        let mut bytes = encode(&dump).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(CodecError::InvalidFormat)));
    }

    #[test]
    fn test_future_version_rejected() {
        let dump = sample_dump(Vec::new());
        let mut bytes = encode(&dump).unwrap();
        bytes[4..6].copy_from_slice(&2u16.to_be_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_truncated_metadata_rejected() {
        let dump = sample_dump(Vec::new());
        let bytes = encode(&dump).unwrap();
        assert!(matches!(
            decode(&bytes[..HEADER_LEN + 4]),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn test_short_input_rejected() {
        assert!(matches!(decode(b"MN"), Err(CodecError::InvalidFormat)));
        assert!(matches!(decode(b"MNTN\x00\x01"), Err(CodecError::Truncated)));
    }

    #[test]
    fn test_memory_length_mismatch_rejected() {
        let dump = sample_dump(vec![9u8; PAGE_SIZE]);
        let mut bytes = encode(&dump).unwrap();
        // Declare one byte more than the block decompresses to.
        bytes[6..14].copy_from_slice(&((PAGE_SIZE + 1) as u64).to_be_bytes());
        assert!(matches!(decode(&bytes), Err(CodecError::Memory(_))));
    }
}
