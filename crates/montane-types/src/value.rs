//! Engine-agnostic guest values and argument hashing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A WASM core value crossing the host/guest boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

/// The type of a [`Value`], used in host function signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }
}

/// SHA-256 over the canonical encoding of an argument list.
///
/// Dumps carry this hash instead of the raw arguments so failures can be
/// correlated without retaining possibly-secret inputs. The canonical
/// encoding is one tag byte per value followed by its little-endian payload
/// (floats by their IEEE-754 bit patterns).
pub fn hash_args(args: &[Value]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for value in args {
        match value {
            Value::I32(v) => {
                hasher.update([0u8]);
                hasher.update(v.to_le_bytes());
            }
            Value::I64(v) => {
                hasher.update([1u8]);
                hasher.update(v.to_le_bytes());
            }
            Value::F32(v) => {
                hasher.update([2u8]);
                hasher.update(v.to_bits().to_le_bytes());
            }
            Value::F64(v) => {
                hasher.update([3u8]);
                hasher.update(v.to_bits().to_le_bytes());
            }
        }
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let args = [Value::I32(20), Value::I32(22)];
        assert_eq!(hash_args(&args), hash_args(&args));
    }

    #[test]
    fn test_hash_distinguishes_values() {
        assert_ne!(
            hash_args(&[Value::I32(1)]),
            hash_args(&[Value::I32(2)])
        );
    }

    #[test]
    fn test_hash_distinguishes_types_of_same_bits() {
        // i32 1 and f32 with bit pattern 1 must not collide via the tag byte.
        assert_ne!(
            hash_args(&[Value::I32(1)]),
            hash_args(&[Value::F32(f32::from_bits(1))])
        );
    }

    #[test]
    fn test_empty_args_hash() {
        // SHA-256 of the empty string.
        assert_eq!(
            hex_of(hash_args(&[])),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    fn hex_of(bytes: [u8; 32]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::I32(7).as_i32(), Some(7));
        assert_eq!(Value::I64(7).as_i32(), None);
        assert_eq!(Value::I64(-1).as_i64(), Some(-1));
        assert_eq!(Value::F64(0.5).ty(), ValueType::F64);
    }
}
