//! Save-state record for the passthrough device
//!
//! A passthrough connection cannot be captured in a snapshot: the real
//! adapter's state lives outside the emulator. The record only remembers that
//! passthrough was active so a later restore can refuse mismatched states.
//!
//! # Format
//!
//! ```text
//! [postcard-encoded PassthroughSnapshot][CRC32: u32 (little-endian)]
//! ```

use crate::error::{HciError, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Current snapshot record version
pub const SNAPSHOT_VERSION: u8 = 1;

const CHECKSUM_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassthroughSnapshot {
    pub version: u8,
    /// Whether the state was saved with Bluetooth passthrough enabled
    pub passthrough_enabled: bool,
}

impl PassthroughSnapshot {
    /// Record written by an active passthrough device
    pub fn active() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            passthrough_enabled: true,
        }
    }
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encode a snapshot record with its trailing checksum
pub fn encode_snapshot(snapshot: &PassthroughSnapshot) -> Result<Vec<u8>> {
    let mut bytes = postcard::to_allocvec(snapshot)?;
    let crc = checksum(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(bytes)
}

/// Decode and verify a snapshot record
pub fn decode_snapshot(bytes: &[u8]) -> Result<PassthroughSnapshot> {
    if bytes.len() < CHECKSUM_LEN {
        return Err(HciError::PacketTooShort {
            needed: CHECKSUM_LEN,
            available: bytes.len(),
        });
    }
    let (payload, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = checksum(payload);
    if expected != actual {
        return Err(HciError::ChecksumMismatch { expected, actual });
    }
    Ok(postcard::from_bytes(payload)?)
}
