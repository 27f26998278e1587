//! HCI error types

use thiserror::Error;

/// Errors raised while encoding or decoding HCI packets and snapshot records
#[derive(Debug, Error)]
pub enum HciError {
    /// Packet shorter than the structure it should contain
    #[error("Packet too short: needed {needed} bytes, got {available}")]
    PacketTooShort { needed: usize, available: usize },

    /// Command parameters do not fit the one-byte length field
    #[error("Command parameters too long: {length} bytes (max: {max})")]
    ParametersTooLong { length: usize, max: usize },

    /// Address text is not six colon-separated hex octets
    #[error("Invalid Bluetooth address: {0:?}")]
    InvalidAddress(String),

    /// Link key text is not exactly 32 hex digits
    #[error("Invalid link key: {0:?}")]
    InvalidLinkKey(String),

    /// Snapshot record could not be (de)serialized
    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Snapshot record failed its checksum
    #[error("Snapshot checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Type alias for HCI results
pub type Result<T> = std::result::Result<T, HciError>;
