//! Core HCI value types and protocol constants

use crate::error::{HciError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// HCI command opcodes (OGF << 10 | OCF) handled by the passthrough
pub mod opcodes {
    pub const RESET: u16 = 0x0C03;
    pub const WRITE_STORED_LINK_KEY: u16 = 0x0C11;
    pub const DELETE_STORED_LINK_KEY: u16 = 0x0C12;
    pub const READ_BUFFER_SIZE: u16 = 0x1005;

    /// Vendor commands the integrated module answers but generic adapters reject
    pub const FAKED_VENDOR_COMMANDS: [u16; 2] = [0xFC4C, 0xFC4F];

    /// Opcode group used for vendor-specific commands
    pub const OGF_VENDOR: u16 = 0x3F;

    /// Extract the opcode group field
    pub const fn ogf(opcode: u16) -> u16 {
        opcode >> 10
    }
}

/// HCI event codes
pub mod events {
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    pub const LINK_KEY_NOTIFICATION: u8 = 0x18;
    pub const VENDOR: u8 = 0xFF;
}

/// HCI status codes
pub mod status {
    pub const SUCCESS: u8 = 0x00;
}

/// Buffer limits reported to the guest instead of the adapter's own.
///
/// The guest stack tracks free controller buffers in a u8 and underflows when
/// an adapter advertises more than ten ACL packets.
pub mod buffer_limits {
    pub const ACL_PACKET_SIZE: u16 = 339;
    pub const SCO_PACKET_SIZE: u8 = 64;
    pub const ACL_PACKET_COUNT: u16 = 10;
    pub const SCO_PACKET_COUNT: u16 = 0;
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Bluetooth device address, stored in on-wire (little-endian) byte order.
///
/// The textual form (`00:11:22:33:44:55`) lists the most significant octet
/// first, so parsing and formatting reverse the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const LEN: usize = 6;
    pub const ZERO: BdAddr = BdAddr([0; 6]);

    /// Build from on-wire bytes
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 6] = bytes
            .get(..Self::LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(HciError::PacketTooShort {
                needed: Self::LEN,
                available: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// On-wire bytes
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl FromStr for BdAddr {
    type Err = HciError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || HciError::InvalidAddress(s.to_string());
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.trim().split(':') {
            if count == octets.len() || part.len() != 2 || !is_hex(part) {
                return Err(invalid());
            }
            octets[count] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
            count += 1;
        }
        if count != octets.len() {
            return Err(invalid());
        }
        octets.reverse();
        Ok(Self(octets))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

/// 128-bit link key established during pairing
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkKey(pub [u8; 16]);

impl LinkKey {
    pub const LEN: usize = 16;

    /// Build from on-wire bytes
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 16] = bytes
            .get(..Self::LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(HciError::PacketTooShort {
                needed: Self::LEN,
                available: bytes.len(),
            })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

// Keys are secrets; keep them out of debug logs.
impl fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LinkKey(..)")
    }
}

impl FromStr for LinkKey {
    type Err = HciError;

    /// Accepts exactly 32 hex digits; odd or short input is rejected rather
    /// than truncated or zero-padded.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || HciError::InvalidLinkKey(s.to_string());
        if s.len() != Self::LEN * 2 || !is_hex(s) {
            return Err(invalid());
        }
        let mut key = [0u8; 16];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(key))
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bdaddr_text_is_reversed_on_wire() {
        let addr: BdAddr = "00:11:22:33:44:55".parse().unwrap();
        assert_eq!(addr.0, [0x55, 0x44, 0x33, 0x22, 0x11, 0x00]);
        assert_eq!(addr.to_string(), "00:11:22:33:44:55");
    }

    #[test]
    fn test_bdaddr_rejects_bad_text() {
        assert!("00:11:22:33:44".parse::<BdAddr>().is_err());
        assert!("00:11:22:33:44:55:66".parse::<BdAddr>().is_err());
        assert!("00:11:22:33:44:zz".parse::<BdAddr>().is_err());
        assert!("0:11:22:33:44:55".parse::<BdAddr>().is_err());
        assert!("".parse::<BdAddr>().is_err());
    }

    #[test]
    fn test_link_key_hex() {
        let key: LinkKey = "000102030405060708090A0B0C0D0E0F".parse().unwrap();
        assert_eq!(key.0[10], 0x0a);
        assert_eq!(key.to_string(), "000102030405060708090a0b0c0d0e0f");
    }

    #[test]
    fn test_link_key_rejects_odd_and_short() {
        // odd length
        assert!("000102030405060708090a0b0c0d0e0".parse::<LinkKey>().is_err());
        // even but short
        assert!("0001020304".parse::<LinkKey>().is_err());
        // even but long
        assert!("000102030405060708090a0b0c0d0e0f10".parse::<LinkKey>().is_err());
        // non-hex
        assert!("zz0102030405060708090a0b0c0d0e0f".parse::<LinkKey>().is_err());
        // multibyte chars must not panic on slicing
        assert!("ää0102030405060708090a0b0c0d0e0f".parse::<LinkKey>().is_err());
    }

    #[test]
    fn test_link_key_debug_is_redacted() {
        let key = LinkKey([0xab; 16]);
        assert_eq!(format!("{:?}", key), "LinkKey(..)");
    }

    #[test]
    fn test_vendor_ogf() {
        for opcode in opcodes::FAKED_VENDOR_COMMANDS {
            assert_eq!(opcodes::ogf(opcode), opcodes::OGF_VENDOR);
        }
        assert_eq!(opcodes::ogf(opcodes::RESET), 0x03);
    }
}
