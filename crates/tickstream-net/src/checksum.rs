//! End-of-session integrity checksum.
//!
//! The digest is MD5 over the JSON array of the full sequence (`[v0,v1,...]`),
//! rendered as 32 lowercase hex characters. It is always computed from index
//! zero, so it depends only on `(seed, length)` and never on how many times
//! the client resumed.

use std::fmt;

use md5::{Digest, Md5};

use crate::sequence;

/// Errors from checksum computation.
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    /// The value sequence could not be serialized.
    #[error("failed to serialize sequence: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 128-bit sequence digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 16]);

impl Checksum {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex rendering, as sent on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Digest of an arbitrary ordered run of values.
pub fn digest_values(values: &[u32]) -> Result<Checksum, ChecksumError> {
    let canonical = serde_json::to_vec(values)?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&Md5::digest(&canonical));
    Ok(Checksum(bytes))
}

/// Digest of the full `length`-value sequence for `seed`.
pub fn checksum(seed: u64, length: u32) -> Result<Checksum, ChecksumError> {
    let values: Vec<u32> = sequence::generate(seed, length).collect();
    digest_values(&values)
}
