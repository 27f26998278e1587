//! Common utilities for the Bluetooth passthrough
//!
//! This crate provides the seams between the passthrough core and the world
//! around it: USB transfer types and the black-box transport interface, the
//! completion queue feeding the completion worker, the ticket registry that
//! correlates transfers with guest requests, emulator collaborator traits,
//! error handling and logging setup.

pub mod channel;
pub mod error;
pub mod guest;
pub mod logging;
pub mod loopback;
pub mod test_utils;
pub mod tickets;
pub mod transport;
pub mod usb_types;

pub use channel::{CompletionReceiver, CompletionSender, create_completion_queue};
pub use error::{Error, Result};
pub use guest::{GuestAddr, GuestMemory, HostServices, IoVector, IoctlvRequest, ReplySink, RequestAddr};
pub use logging::setup_logging;
pub use loopback::LoopbackGuest;
pub use tickets::TicketRegistry;
pub use transport::{AdapterHandle, CompletionHandler, UsbBackend};
pub use usb_types::{
    AdapterCandidate, AdapterStrings, BLUETOOTH_CLASS, BLUETOOTH_INTERFACE, Completion,
    ControlSetup, HCI_EVENT_ENDPOINT, InterfaceClass, OpenError, SubmitError, Ticket, TicketId,
    Transfer, TransferKind, TransferStatus, UsbError,
};
