//! USB transfer types shared between the passthrough core and USB backends
//!
//! A [`Transfer`] carries an owned [`Ticket`] into the backend; the backend
//! hands the same ticket back inside exactly one [`Completion`]. Tickets are
//! neither `Clone` nor `Copy`, so a completion cannot be produced twice for
//! one submission without the type system noticing.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// HCI event endpoint of a USB Bluetooth interface
pub const HCI_EVENT_ENDPOINT: u8 = 0x81;

/// Bluetooth interface number on USB Bluetooth adapters
pub const BLUETOOTH_INTERFACE: u8 = 0;

/// Interface class triple identifying a Bluetooth radio (wireless controller / RF / Bluetooth)
pub const BLUETOOTH_CLASS: InterfaceClass = InterfaceClass {
    class: 0xE0,
    subclass: 0x01,
    protocol: 0x01,
};

/// Identifier of an in-flight transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TicketId(pub u64);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owned claim on a pending transfer record.
///
/// Issued by [`crate::TicketRegistry::issue`] and consumed by
/// [`crate::TicketRegistry::redeem`].
#[derive(Debug, PartialEq, Eq)]
pub struct Ticket(TicketId);

impl Ticket {
    pub(crate) fn new(id: TicketId) -> Self {
        Self(id)
    }

    pub fn id(&self) -> TicketId {
        self.0
    }
}

/// USB transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Control,
    Interrupt,
    Bulk,
}

/// Control transfer setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    /// Class request to the Bluetooth interface carrying an HCI command
    pub fn hci_command(length: u16) -> Self {
        Self {
            // host-to-device | class | interface
            request_type: 0x21,
            request: 0,
            value: 0,
            index: BLUETOOTH_INTERFACE as u16,
            length,
        }
    }

    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Direction of a non-control endpoint address
pub fn endpoint_is_in(endpoint: u8) -> bool {
    endpoint & 0x80 != 0
}

/// A transfer handed to a USB backend
#[derive(Debug)]
pub struct Transfer {
    pub ticket: Ticket,
    pub kind: TransferKind,
    /// Endpoint address (0 for control transfers)
    pub endpoint: u8,
    /// Setup packet; only meaningful for control transfers
    pub setup: ControlSetup,
    /// OUT: bytes to send. IN: receive buffer sized to the requested length.
    pub buffer: Vec<u8>,
    pub timeout: Duration,
}

impl Transfer {
    pub fn control(ticket: Ticket, setup: ControlSetup, buffer: Vec<u8>, timeout: Duration) -> Self {
        Self {
            ticket,
            kind: TransferKind::Control,
            endpoint: 0,
            setup,
            buffer,
            timeout,
        }
    }

    pub fn interrupt(ticket: Ticket, endpoint: u8, buffer: Vec<u8>, timeout: Duration) -> Self {
        Self {
            ticket,
            kind: TransferKind::Interrupt,
            endpoint,
            setup: ControlSetup::default(),
            buffer,
            timeout,
        }
    }

    pub fn bulk(ticket: Ticket, endpoint: u8, buffer: Vec<u8>, timeout: Duration) -> Self {
        Self {
            ticket,
            kind: TransferKind::Bulk,
            endpoint,
            setup: ControlSetup::default(),
            buffer,
            timeout,
        }
    }

    /// Whether data flows device -> host
    pub fn is_in(&self) -> bool {
        match self.kind {
            TransferKind::Control => self.setup.is_in(),
            TransferKind::Interrupt | TransferKind::Bulk => endpoint_is_in(self.endpoint),
        }
    }
}

/// Final status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    /// Dropped during connection teardown
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
    Error,
}

impl TransferStatus {
    /// Statuses that indicate a misbehaving adapter rather than normal operation
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Stall | Self::Overflow | Self::Error)
    }
}

/// Result of a transfer, carrying back the ticket it was submitted with
#[derive(Debug)]
pub struct Completion {
    pub ticket: Ticket,
    pub kind: TransferKind,
    pub endpoint: u8,
    pub status: TransferStatus,
    pub buffer: Vec<u8>,
    pub actual_length: usize,
}

impl Completion {
    /// Finish `transfer` with `status`, `actual_length` bytes valid in its buffer
    pub fn finish(transfer: Transfer, status: TransferStatus, actual_length: usize) -> Self {
        let actual_length = actual_length.min(transfer.buffer.len());
        Self {
            ticket: transfer.ticket,
            kind: transfer.kind,
            endpoint: transfer.endpoint,
            status,
            buffer: transfer.buffer,
            actual_length,
        }
    }

    /// Finish `transfer` without touching the device
    pub fn cancelled(transfer: Transfer) -> Self {
        Self::finish(transfer, TransferStatus::Cancelled, 0)
    }

    /// The bytes the device actually transferred
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length]
    }
}

/// Synchronous USB error, mirroring libusb's error codes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    #[error("operation timed out")]
    Timeout,
    #[error("pipe error (endpoint stalled)")]
    Pipe,
    #[error("device disconnected")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("overflow")]
    Overflow,
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied")]
    Access,
    #[error("operation not supported")]
    NotSupported,
    #[error("{message}")]
    Other { message: String },
}

impl UsbError {
    /// Status a transfer failing with this error completes with
    pub fn transfer_status(&self) -> TransferStatus {
        match self {
            Self::Timeout => TransferStatus::TimedOut,
            Self::Pipe => TransferStatus::Stall,
            Self::NoDevice => TransferStatus::NoDevice,
            Self::Overflow => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }
}

/// Transfer the backend refused to queue (connection closed)
#[derive(Debug)]
pub struct SubmitError {
    pub transfer: Transfer,
    pub reason: UsbError,
}

/// Why opening a candidate adapter failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    #[error("Failed to open Bluetooth device: {0}")]
    Open(UsbError),
    #[error("Failed to detach kernel driver for BT passthrough: {0}")]
    DetachKernelDriver(UsbError),
    #[error("Failed to claim interface for BT passthrough: {0}")]
    ClaimInterface(UsbError),
    #[error("Device is no longer present")]
    Gone,
}

/// Class triple of an interface's first alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceClass {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// A device found during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterCandidate {
    pub bus_number: u8,
    pub device_address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    /// Class of interface 0, `None` if the configuration could not be read
    pub interface: Option<InterfaceClass>,
}

impl fmt::Display for AdapterCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (rev {:x}) on bus {} address {}",
            self.vendor_id, self.product_id, self.device_version, self.bus_number, self.device_address
        )
    }
}

/// String descriptors read after opening an adapter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterStrings {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}
