//! HCI event packets
//!
//! Events travel controller -> host over the interrupt endpoint:
//! ```text
//! [Event code: u8][Parameter length: u8][Parameters...]
//! ```
//!
//! Besides parsing the few events the passthrough reacts to, this module
//! builds the replies fabricated on the adapter's behalf.

use crate::error::{HciError, Result};
use crate::types::{BdAddr, LinkKey, buffer_limits, events, opcodes, status};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};

/// Size of the event header (event code + parameter length)
pub const EVENT_HEADER_LEN: usize = 2;

/// Sync button vendor event payloads
pub const SYNC_BUTTON_PRESSED: u8 = 0x08;
pub const SYNC_BUTTON_HELD: u8 = 0x09;

/// Events the passthrough inspects on their way to the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Command_Complete for `opcode`
    CommandComplete { opcode: u16 },
    /// Link_Key_Notification: the adapter paired with `addr`
    LinkKeyNotification { addr: BdAddr, key: LinkKey },
    /// Any other event
    Other { code: u8 },
}

impl InboundEvent {
    /// Parse an event packet. Truncated packets are errors; unknown events
    /// come back as [`InboundEvent::Other`].
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < EVENT_HEADER_LEN {
            return Err(HciError::PacketTooShort {
                needed: EVENT_HEADER_LEN,
                available: packet.len(),
            });
        }
        let params = &packet[EVENT_HEADER_LEN..];
        match packet[0] {
            events::COMMAND_COMPLETE => {
                // [num_hci_command_packets: u8][opcode: u16][return parameters...]
                if params.len() < 3 {
                    return Err(HciError::PacketTooShort {
                        needed: EVENT_HEADER_LEN + 3,
                        available: packet.len(),
                    });
                }
                Ok(Self::CommandComplete {
                    opcode: LittleEndian::read_u16(&params[1..3]),
                })
            }
            events::LINK_KEY_NOTIFICATION => {
                // [bdaddr: 6][key: 16][key_type: u8]
                let needed = BdAddr::LEN + LinkKey::LEN;
                if params.len() < needed {
                    return Err(HciError::PacketTooShort {
                        needed: EVENT_HEADER_LEN + needed,
                        available: packet.len(),
                    });
                }
                Ok(Self::LinkKeyNotification {
                    addr: BdAddr::from_wire(params)?,
                    key: LinkKey::from_wire(&params[BdAddr::LEN..])?,
                })
            }
            code => Ok(Self::Other { code }),
        }
    }

    /// True for a Command_Complete matching `opcode`
    pub fn is_command_complete_for(&self, opcode: u16) -> bool {
        matches!(self, Self::CommandComplete { opcode: o } if *o == opcode)
    }
}

fn command_complete(opcode: u16, return_parameters: &[u8]) -> Vec<u8> {
    let mut packet = BytesMut::with_capacity(EVENT_HEADER_LEN + 3 + return_parameters.len());
    packet.put_u8(events::COMMAND_COMPLETE);
    packet.put_u8((3 + return_parameters.len()) as u8);
    // the guest may send one more command
    packet.put_u8(0x01);
    packet.put_u16_le(opcode);
    packet.put_slice(return_parameters);
    packet.to_vec()
}

/// Command_Complete for Read_Buffer_Size carrying the fixed guest-safe limits
pub fn fake_read_buffer_size_reply() -> Vec<u8> {
    let mut reply = BytesMut::with_capacity(8);
    reply.put_u8(status::SUCCESS);
    reply.put_u16_le(buffer_limits::ACL_PACKET_SIZE);
    reply.put_u8(buffer_limits::SCO_PACKET_SIZE);
    reply.put_u16_le(buffer_limits::ACL_PACKET_COUNT);
    reply.put_u16_le(buffer_limits::SCO_PACKET_COUNT);
    command_complete(opcodes::READ_BUFFER_SIZE, &reply)
}

/// Successful Command_Complete echoing a swallowed vendor command
pub fn fake_vendor_command_reply(opcode: u16) -> Vec<u8> {
    command_complete(opcode, &[status::SUCCESS])
}

/// Vendor event emitted by the integrated module's sync button
pub fn fake_sync_button_event(payload: u8) -> Vec<u8> {
    vec![events::VENDOR, 1, payload]
}
