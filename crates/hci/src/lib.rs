//! HCI wire vocabulary for the Bluetooth passthrough
//!
//! This crate knows how the handful of HCI commands and events the
//! passthrough cares about are laid out on the wire. It performs no I/O.
//!
//! # Example
//!
//! ```
//! use hci::{InboundEvent, fake_read_buffer_size_reply, opcodes};
//!
//! let reply = fake_read_buffer_size_reply();
//! let event = InboundEvent::parse(&reply).unwrap();
//! assert!(event.is_command_complete_for(opcodes::READ_BUFFER_SIZE));
//! ```
//!
//! Addresses use on-wire byte order internally and colon-separated text with
//! the most significant octet first:
//!
//! ```
//! use hci::BdAddr;
//!
//! let addr: BdAddr = "00:11:22:33:44:55".parse().unwrap();
//! assert_eq!(addr.as_bytes()[0], 0x55);
//! assert_eq!(addr.to_string(), "00:11:22:33:44:55");
//! ```

pub mod command;
pub mod error;
pub mod event;
pub mod snapshot;
pub mod types;

pub use command::{
    COMMAND_HEADER_LEN, DeleteStoredLinkKey, MAX_KEYS_PER_WRITE, command_opcode,
    command_parameters, encode_command, write_stored_link_keys,
};
pub use error::{HciError, Result};
pub use event::{
    EVENT_HEADER_LEN, InboundEvent, SYNC_BUTTON_HELD, SYNC_BUTTON_PRESSED,
    fake_read_buffer_size_reply, fake_sync_button_event, fake_vendor_command_reply,
};
pub use snapshot::{PassthroughSnapshot, SNAPSHOT_VERSION, decode_snapshot, encode_snapshot};
pub use types::{BdAddr, LinkKey, buffer_limits, events, opcodes, status};
