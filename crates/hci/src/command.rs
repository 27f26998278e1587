//! HCI command packets
//!
//! Commands travel host -> controller over the USB control endpoint:
//! ```text
//! [Opcode: u16 (little-endian)][Parameter length: u8][Parameters...]
//! ```

use crate::error::{HciError, Result};
use crate::types::{BdAddr, LinkKey, opcodes};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};

/// Size of the command header (opcode + parameter length)
pub const COMMAND_HEADER_LEN: usize = 3;

/// Largest parameter block the one-byte length field can describe
pub const MAX_PARAMETERS_LEN: usize = u8::MAX as usize;

/// Bytes per (address, key) record in Write_Stored_Link_Key
pub const STORED_KEY_RECORD_LEN: usize = BdAddr::LEN + LinkKey::LEN;

/// Most keys a single Write_Stored_Link_Key command can carry
pub const MAX_KEYS_PER_WRITE: usize = (MAX_PARAMETERS_LEN - 1) / STORED_KEY_RECORD_LEN;

/// Read the opcode of a command packet
pub fn command_opcode(packet: &[u8]) -> Result<u16> {
    if packet.len() < 2 {
        return Err(HciError::PacketTooShort {
            needed: 2,
            available: packet.len(),
        });
    }
    Ok(LittleEndian::read_u16(packet))
}

/// Parameters of a command packet (everything after the header)
pub fn command_parameters(packet: &[u8]) -> Result<&[u8]> {
    packet
        .get(COMMAND_HEADER_LEN..)
        .ok_or(HciError::PacketTooShort {
            needed: COMMAND_HEADER_LEN,
            available: packet.len(),
        })
}

/// Build a command packet from an opcode and its parameters
pub fn encode_command(opcode: u16, parameters: &[u8]) -> Result<Vec<u8>> {
    if parameters.len() > MAX_PARAMETERS_LEN {
        return Err(HciError::ParametersTooLong {
            length: parameters.len(),
            max: MAX_PARAMETERS_LEN,
        });
    }
    let mut packet = BytesMut::with_capacity(COMMAND_HEADER_LEN + parameters.len());
    packet.put_u16_le(opcode);
    packet.put_u8(parameters.len() as u8);
    packet.put_slice(parameters);
    Ok(packet.to_vec())
}

/// HCI_Reset
pub fn reset() -> Vec<u8> {
    vec![
        (opcodes::RESET & 0xff) as u8,
        (opcodes::RESET >> 8) as u8,
        0,
    ]
}

/// Which stored keys a Delete_Stored_Link_Key command targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStoredLinkKey {
    /// Remove the key for one address
    One(BdAddr),
    /// Remove every stored key
    All,
}

impl DeleteStoredLinkKey {
    const PARAMETERS_LEN: usize = BdAddr::LEN + 1;

    /// Decode from a full command packet (header included)
    pub fn parse(packet: &[u8]) -> Result<Self> {
        let params = command_parameters(packet)?;
        if params.len() < Self::PARAMETERS_LEN {
            return Err(HciError::PacketTooShort {
                needed: COMMAND_HEADER_LEN + Self::PARAMETERS_LEN,
                available: packet.len(),
            });
        }
        if params[BdAddr::LEN] != 0 {
            Ok(Self::All)
        } else {
            Ok(Self::One(BdAddr::from_wire(params)?))
        }
    }

    /// Encode as a full command packet
    pub fn encode(&self) -> Vec<u8> {
        let mut params = [0u8; Self::PARAMETERS_LEN];
        match self {
            Self::One(addr) => params[..BdAddr::LEN].copy_from_slice(addr.as_bytes()),
            Self::All => params[BdAddr::LEN] = 1,
        }
        let mut packet = Vec::with_capacity(COMMAND_HEADER_LEN + params.len());
        packet.extend_from_slice(&opcodes::DELETE_STORED_LINK_KEY.to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// Build Write_Stored_Link_Key for the given keys.
///
/// Returns `None` for an empty key set. At most [`MAX_KEYS_PER_WRITE`] keys are
/// encoded; the caller is told how many made it in through the second tuple field.
pub fn write_stored_link_keys<'a, I>(keys: I) -> Option<(Vec<u8>, usize)>
where
    I: IntoIterator<Item = (&'a BdAddr, &'a LinkKey)>,
{
    let mut params = BytesMut::with_capacity(MAX_PARAMETERS_LEN);
    params.put_u8(0);
    let mut written = 0usize;
    for (addr, key) in keys.into_iter().take(MAX_KEYS_PER_WRITE) {
        params.put_slice(addr.as_bytes());
        params.put_slice(key.as_bytes());
        written += 1;
    }
    if written == 0 {
        return None;
    }
    params[0] = written as u8;

    // MAX_KEYS_PER_WRITE keeps the parameters within the length field
    let packet = encode_command(opcodes::WRITE_STORED_LINK_KEY, &params).ok()?;
    Some((packet, written))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> BdAddr {
        BdAddr([last, 1, 2, 3, 4, 5])
    }

    #[test]
    fn test_command_opcode() {
        assert_eq!(command_opcode(&[0x05, 0x10, 0x00]).unwrap(), 0x1005);
        assert!(command_opcode(&[0x05]).is_err());
    }

    #[test]
    fn test_reset_packet() {
        assert_eq!(reset(), vec![0x03, 0x0C, 0x00]);
    }

    #[test]
    fn test_delete_all_encoding() {
        let packet = DeleteStoredLinkKey::All.encode();
        assert_eq!(packet, vec![0x12, 0x0C, 0x07, 0, 0, 0, 0, 0, 0, 0x01]);
        assert_eq!(
            DeleteStoredLinkKey::parse(&packet).unwrap(),
            DeleteStoredLinkKey::All
        );
    }

    #[test]
    fn test_delete_one_parse() {
        let packet = [0x12, 0x0C, 0x07, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00, 0x00];
        let expected: BdAddr = "00:11:22:33:44:55".parse().unwrap();
        assert_eq!(
            DeleteStoredLinkKey::parse(&packet).unwrap(),
            DeleteStoredLinkKey::One(expected)
        );
    }

    #[test]
    fn test_delete_truncated() {
        assert!(DeleteStoredLinkKey::parse(&[0x12, 0x0C, 0x07, 0x55]).is_err());
    }

    #[test]
    fn test_write_stored_link_keys_layout() {
        let keys = [(addr(1), LinkKey([0xaa; 16])), (addr(2), LinkKey([0xbb; 16]))];
        let (packet, written) =
            write_stored_link_keys(keys.iter().map(|(a, k)| (a, k))).unwrap();
        assert_eq!(written, 2);
        assert_eq!(command_opcode(&packet).unwrap(), opcodes::WRITE_STORED_LINK_KEY);
        assert_eq!(packet[2] as usize, 1 + 2 * STORED_KEY_RECORD_LEN);
        assert_eq!(packet[3], 2);
        assert_eq!(&packet[4..10], addr(1).as_bytes());
        assert_eq!(&packet[10..26], &[0xaa; 16]);
        assert_eq!(&packet[26..32], addr(2).as_bytes());
        assert_eq!(packet.len(), COMMAND_HEADER_LEN + 1 + 2 * STORED_KEY_RECORD_LEN);
    }

    #[test]
    fn test_write_stored_link_keys_capped() {
        let keys: Vec<_> = (0..20u8).map(|i| (addr(i), LinkKey([i; 16]))).collect();
        let (packet, written) =
            write_stored_link_keys(keys.iter().map(|(a, k)| (a, k))).unwrap();
        assert_eq!(written, MAX_KEYS_PER_WRITE);
        assert_eq!(MAX_KEYS_PER_WRITE, 11);
        assert!(packet.len() - COMMAND_HEADER_LEN <= MAX_PARAMETERS_LEN);
    }

    #[test]
    fn test_write_stored_link_keys_empty() {
        assert!(write_stored_link_keys(std::iter::empty()).is_none());
    }

    #[test]
    fn test_encode_command_too_long() {
        assert!(encode_command(0x0C11, &[0u8; 256]).is_err());
    }
}
