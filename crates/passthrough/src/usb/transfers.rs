//! USB transfer execution
//!
//! Runs one [`Transfer`] to completion with rusb's synchronous API and
//! packages the outcome as a [`Completion`] carrying the transfer's ticket.

use common::{Completion, ControlSetup, Transfer, TransferKind, TransferStatus, UsbError};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Execute a transfer and report its completion
pub fn execute_transfer(handle: &DeviceHandle<Context>, mut transfer: Transfer) -> Completion {
    let timeout = transfer.timeout;
    let result = match transfer.kind {
        TransferKind::Control => {
            execute_control_transfer(handle, transfer.setup, &mut transfer.buffer, timeout)
        }
        TransferKind::Bulk => {
            execute_bulk_transfer(handle, transfer.endpoint, &mut transfer.buffer, timeout)
        }
        TransferKind::Interrupt => {
            execute_interrupt_transfer(handle, transfer.endpoint, &mut transfer.buffer, timeout)
        }
    };

    match result {
        Ok(len) => {
            trace!(
                "{:?} transfer on endpoint {:#04x} succeeded: {} bytes",
                transfer.kind, transfer.endpoint, len
            );
            Completion::finish(transfer, TransferStatus::Completed, len)
        }
        Err(UsbError::Timeout) => {
            // Nothing to read yet; the guest just polls again.
            trace!(
                "{:?} transfer on endpoint {:#04x} timed out",
                transfer.kind, transfer.endpoint
            );
            Completion::finish(transfer, TransferStatus::TimedOut, 0)
        }
        Err(error) => {
            warn!(
                "{:?} transfer on endpoint {:#04x} failed: {}",
                transfer.kind, transfer.endpoint, error
            );
            let status = error.transfer_status();
            Completion::finish(transfer, status, 0)
        }
    }
}

/// Execute a control transfer
///
/// Control transfers always go to endpoint 0. For IN transfers `buffer` is
/// filled; for OUT transfers it holds the bytes to send.
fn execute_control_transfer(
    handle: &DeviceHandle<Context>,
    setup: ControlSetup,
    buffer: &mut [u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, data_len={}",
        setup.request_type,
        setup.request,
        setup.value,
        setup.index,
        buffer.len()
    );

    let result = if setup.is_in() {
        handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buffer,
            timeout,
        )
    } else {
        handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buffer,
            timeout,
        )
    };
    result.map_err(map_rusb_error)
}

/// Execute a bulk transfer (ACL data)
fn execute_bulk_transfer(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    buffer: &mut [u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    let result = if common::usb_types::endpoint_is_in(endpoint) {
        handle.read_bulk(endpoint, buffer, timeout)
    } else {
        handle.write_bulk(endpoint, buffer, timeout)
    };
    result.map_err(map_rusb_error)
}

/// Execute an interrupt transfer (HCI events)
fn execute_interrupt_transfer(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    buffer: &mut [u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    let result = if common::usb_types::endpoint_is_in(endpoint) {
        handle.read_interrupt(endpoint, buffer, timeout)
    } else {
        handle.write_interrupt(endpoint, buffer, timeout)
    };
    result.map_err(map_rusb_error)
}

/// Map rusb::Error to the transport's UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        rusb::Error::NotSupported => UsbError::NotSupported,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}
