//! Interfaces of the emulator collaborators the passthrough talks to
//!
//! The device-dispatch framework hands requests in as [`IoctlvRequest`]s and
//! receives asynchronous replies through a [`ReplySink`]. Guest RAM is reached
//! through [`GuestMemory`], and user-facing notifications go to [`HostServices`].

use crate::Result;
use byteorder::{BigEndian, ByteOrder};
use std::time::Duration;

/// Request codes of the USB V0 IO-control-vector interface
pub mod usbv0 {
    /// Control message (HCI command)
    pub const CTRLMSG: u32 = 0;
    /// Bulk message (ACL data)
    pub const BLKMSG: u32 = 1;
    /// Interrupt message (HCI event)
    pub const INTRMSG: u32 = 2;

    /// In-vector count of a control message: bmRequestType, bRequest,
    /// wValue, wIndex, wLength and one unused byte
    pub const CTRL_IN_VECTORS: usize = 6;
    /// In-vector count of interrupt and bulk messages: endpoint, length
    pub const ENDPOINT_IN_VECTORS: usize = 2;
}

/// Guest physical address
pub type GuestAddr = u32;

/// Address of the guest request a reply belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestAddr(pub u32);

/// One scatter/gather buffer of an IO-control-vector request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVector {
    pub address: GuestAddr,
    pub size: u32,
}

/// IO-control-vector request as delivered by the dispatch framework
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlvRequest {
    /// Reply destination
    pub address: RequestAddr,
    /// Request code
    pub request: u32,
    /// Vectors the guest only reads from our point of view (inputs)
    pub in_vectors: Vec<IoVector>,
    /// Vectors the device may write (in/out buffers)
    pub io_vectors: Vec<IoVector>,
}

/// Byte-exact access to guest memory
pub trait GuestMemory: Send + Sync {
    /// Copy `dst.len()` bytes starting at `addr` out of the guest
    fn copy_from_guest(&self, addr: GuestAddr, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into the guest starting at `addr`
    fn copy_to_guest(&self, addr: GuestAddr, src: &[u8]) -> Result<()>;

    fn read_u8(&self, addr: GuestAddr) -> Result<u8> {
        let mut b = [0u8; 1];
        self.copy_from_guest(addr, &mut b)?;
        Ok(b[0])
    }

    /// Guest integers are big-endian
    fn read_u16(&self, addr: GuestAddr) -> Result<u16> {
        let mut b = [0u8; 2];
        self.copy_from_guest(addr, &mut b)?;
        Ok(BigEndian::read_u16(&b))
    }
}

/// Asynchronous reply path back to the dispatch framework.
///
/// Called from the completion worker thread as well as the request thread.
pub trait ReplySink: Send + Sync {
    fn enqueue_reply(&self, request: RequestAddr, return_value: i32);
}

impl<F> ReplySink for F
where
    F: Fn(RequestAddr, i32) + Send + Sync,
{
    fn enqueue_reply(&self, request: RequestAddr, return_value: i32) {
        self(request, return_value)
    }
}

/// User-facing host hooks
pub trait HostServices: Send + Sync {
    /// Show a transient on-screen message
    fn display_message(&self, message: &str, duration: Duration);

    /// Show a blocking alert for a serious problem
    fn alert(&self, message: &str);

    /// Ask the host to stop the emulation session
    fn stop_execution(&self);

    /// Live state of the sync button, for hosts that can sample it directly
    fn sync_button_held(&self) -> Option<bool> {
        None
    }
}
