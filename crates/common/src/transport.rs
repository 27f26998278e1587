//! Black-box USB transport interface
//!
//! The passthrough core never touches libusb directly. A [`UsbBackend`]
//! enumerates and opens adapters; an opened [`AdapterHandle`] accepts
//! asynchronous transfers and reports each one exactly once through the
//! completion queue it was opened with.

use crate::channel::CompletionSender;
use crate::usb_types::{
    AdapterCandidate, AdapterStrings, Completion, OpenError, SubmitError, Transfer, UsbError,
};
use std::time::Duration;

pub trait UsbBackend: Send + Sync {
    /// Enumerate every device currently attached
    fn candidates(&self) -> Result<Vec<AdapterCandidate>, UsbError>;

    /// Open `candidate`, detach any kernel driver and claim the Bluetooth interface.
    ///
    /// Completions of transfers submitted to the returned handle are pushed to `completions`.
    fn open(
        &self,
        candidate: &AdapterCandidate,
        completions: CompletionSender,
    ) -> Result<Box<dyn AdapterHandle>, OpenError>;
}

pub trait AdapterHandle: Send + Sync {
    /// String descriptors read at open time
    fn strings(&self) -> AdapterStrings;

    /// Queue a transfer. Returns immediately; the completion arrives later on
    /// the completion queue. A refused transfer is handed back untouched.
    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError>;

    /// Send an HCI command on the control endpoint and wait for it to be accepted
    fn write_command(&self, packet: &[u8], timeout: Duration) -> Result<usize, UsbError>;

    /// Read one HCI event from the event endpoint
    fn read_event(&self, buffer: &mut [u8], timeout: Duration) -> Result<usize, UsbError>;

    /// Release the claimed Bluetooth interface
    fn release_interface(&self);

    /// Invalidate the handle.
    ///
    /// Every transfer still queued is completed (as cancelled if it never ran)
    /// before this returns, and the handle drops its completion sender.
    /// Idempotent.
    fn close(&self);
}

/// Consumer of completions, run inline on the completion worker thread
pub trait CompletionHandler: Send + Sync {
    fn on_completion(&self, completion: Completion);
}
