//! Opened Bluetooth adapter backed by rusb
//!
//! Owns the device handle for the lifetime of a passthrough session. Interface
//! 0 is claimed on open (detaching the kernel driver first where one is bound)
//! and given back to the kernel on close.

use crate::usb::lanes::Lanes;
use crate::usb::transfers::map_rusb_error;
use common::{
    AdapterHandle, AdapterStrings, BLUETOOTH_INTERFACE, CompletionSender, ControlSetup,
    HCI_EVENT_ENDPOINT, OpenError, SubmitError, Transfer, UsbError,
};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

struct HandleState {
    /// `None` once closed
    handle: Option<Arc<DeviceHandle<Context>>>,
    claimed: bool,
    kernel_driver_detached: bool,
}

/// An adapter with its Bluetooth interface claimed
pub struct RusbAdapter {
    strings: AdapterStrings,
    lanes: Lanes,
    state: Mutex<HandleState>,
}

impl RusbAdapter {
    /// Open `device` and claim its Bluetooth interface
    pub fn open(device: &Device<Context>, completions: CompletionSender) -> Result<Self, OpenError> {
        let descriptor = device
            .device_descriptor()
            .map_err(|e| OpenError::Open(map_rusb_error(e)))?;

        let mut handle = device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            match e {
                rusb::Error::NoDevice => OpenError::Gone,
                _ => OpenError::Open(map_rusb_error(e)),
            }
        })?;

        debug!(
            "Opened device {:04x}:{:04x}",
            descriptor.vendor_id(),
            descriptor.product_id()
        );

        let kernel_driver_detached = match handle.kernel_driver_active(BLUETOOTH_INTERFACE) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {}",
                    BLUETOOTH_INTERFACE
                );
                match handle.detach_kernel_driver(BLUETOOTH_INTERFACE) {
                    Ok(()) => true,
                    Err(rusb::Error::NotFound | rusb::Error::NotSupported) => false,
                    Err(e) => return Err(OpenError::DetachKernelDriver(map_rusb_error(e))),
                }
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    BLUETOOTH_INTERFACE, e
                );
                false
            }
        };

        if let Err(e) = handle.claim_interface(BLUETOOTH_INTERFACE) {
            warn!("Failed to claim interface {}: {}", BLUETOOTH_INTERFACE, e);
            if kernel_driver_detached {
                let _ = handle.attach_kernel_driver(BLUETOOTH_INTERFACE);
            }
            return Err(OpenError::ClaimInterface(map_rusb_error(e)));
        }
        debug!("Claimed interface {}", BLUETOOTH_INTERFACE);

        let strings = read_string_descriptors(&descriptor, &handle);
        let handle = Arc::new(handle);

        Ok(Self {
            strings,
            lanes: Lanes::new(handle.clone(), completions),
            state: Mutex::new(HandleState {
                handle: Some(handle),
                claimed: true,
                kernel_driver_detached,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shared_handle(&self) -> Result<Arc<DeviceHandle<Context>>, UsbError> {
        self.lock().handle.clone().ok_or(UsbError::NoDevice)
    }
}

impl AdapterHandle for RusbAdapter {
    fn strings(&self) -> AdapterStrings {
        self.strings.clone()
    }

    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError> {
        self.lanes.submit(transfer)
    }

    fn write_command(&self, packet: &[u8], timeout: Duration) -> Result<usize, UsbError> {
        let handle = self.shared_handle()?;
        let setup = ControlSetup::hci_command(packet.len() as u16);
        handle
            .write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                packet,
                timeout,
            )
            .map_err(map_rusb_error)
    }

    fn read_event(&self, buffer: &mut [u8], timeout: Duration) -> Result<usize, UsbError> {
        let handle = self.shared_handle()?;
        handle
            .read_interrupt(HCI_EVENT_ENDPOINT, buffer, timeout)
            .map_err(map_rusb_error)
    }

    /// Stop all transfers and release the Bluetooth interface.
    ///
    /// rusb needs exclusive access to the handle to release it, so the
    /// transfer lanes are shut down first.
    fn release_interface(&self) {
        self.lanes.shutdown();

        let mut state = self.lock();
        if !state.claimed {
            return;
        }
        let Some(handle) = state.handle.as_mut().and_then(Arc::get_mut) else {
            warn!("Device handle still in use, not releasing interface");
            return;
        };
        if let Err(e) = handle.release_interface(BLUETOOTH_INTERFACE) {
            warn!("Failed to release interface {}: {}", BLUETOOTH_INTERFACE, e);
        }
        state.claimed = false;
        debug!("Released interface {}", BLUETOOTH_INTERFACE);
    }

    /// Cancel outstanding transfers and close the device.
    ///
    /// Restores the kernel driver if one was detached on open. Idempotent.
    fn close(&self) {
        self.lanes.shutdown();

        let mut state = self.lock();
        let Some(mut shared) = state.handle.take() else {
            return;
        };

        match Arc::get_mut(&mut shared) {
            Some(handle) => {
                if state.claimed {
                    if let Err(e) = handle.release_interface(BLUETOOTH_INTERFACE) {
                        warn!("Failed to release interface {}: {}", BLUETOOTH_INTERFACE, e);
                    }
                    state.claimed = false;
                }
                if state.kernel_driver_detached {
                    match handle.attach_kernel_driver(BLUETOOTH_INTERFACE) {
                        Ok(()) => debug!(
                            "Reattached kernel driver to interface {}",
                            BLUETOOTH_INTERFACE
                        ),
                        Err(e) => warn!(
                            "Could not reattach kernel driver to interface {}: {}",
                            BLUETOOTH_INTERFACE, e
                        ),
                    }
                    state.kernel_driver_detached = false;
                }
            }
            None => warn!("Device handle still in use, closing without restoring the kernel driver"),
        }

        info!("Closed Bluetooth adapter");
    }
}

impl Drop for RusbAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read manufacturer, product and serial strings, skipping any that fail
fn read_string_descriptors(
    descriptor: &DeviceDescriptor,
    handle: &DeviceHandle<Context>,
) -> AdapterStrings {
    let manufacturer = descriptor
        .manufacturer_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    let product = descriptor
        .product_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    let serial_number = descriptor
        .serial_number_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    AdapterStrings {
        manufacturer,
        product,
        serial_number,
    }
}
