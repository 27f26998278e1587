//! rusb implementation of the USB backend

use crate::usb::device::RusbAdapter;
use crate::usb::transfers::map_rusb_error;
use common::{
    AdapterCandidate, AdapterHandle, BLUETOOTH_INTERFACE, CompletionSender, InterfaceClass,
    OpenError, UsbBackend, UsbError,
};
use rusb::{Context, Device, UsbContext};
use tracing::{debug, warn};

/// Enumerates and opens host USB devices through libusb
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self, UsbError> {
        let context = Context::new().map_err(map_rusb_error)?;
        debug!("Initialized libusb context");
        Ok(Self { context })
    }

    fn describe(device: &Device<Context>) -> Result<AdapterCandidate, rusb::Error> {
        let descriptor = device.device_descriptor()?;

        let interface = match device.config_descriptor(0) {
            Ok(config) => config
                .interfaces()
                .find(|interface| interface.number() == BLUETOOTH_INTERFACE)
                .and_then(|interface| interface.descriptors().next())
                .map(|setting| InterfaceClass {
                    class: setting.class_code(),
                    subclass: setting.sub_class_code(),
                    protocol: setting.protocol_code(),
                }),
            Err(e) => {
                debug!(
                    "No config descriptor for bus={}, addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                None
            }
        };

        Ok(AdapterCandidate {
            bus_number: device.bus_number(),
            device_address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            device_version: version_to_bcd(descriptor.device_version()),
            interface,
        })
    }
}

impl UsbBackend for RusbBackend {
    fn candidates(&self) -> Result<Vec<AdapterCandidate>, UsbError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;

        let mut candidates = Vec::new();
        for device in devices.iter() {
            match Self::describe(&device) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => warn!(
                    "Failed to read device descriptor for bus={}, addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }
        Ok(candidates)
    }

    fn open(
        &self,
        candidate: &AdapterCandidate,
        completions: CompletionSender,
    ) -> Result<Box<dyn AdapterHandle>, OpenError> {
        let devices = self
            .context
            .devices()
            .map_err(|e| OpenError::Open(map_rusb_error(e)))?;

        let device = devices
            .iter()
            .find(|device| {
                device.bus_number() == candidate.bus_number
                    && device.address() == candidate.device_address
                    && device.device_descriptor().is_ok_and(|descriptor| {
                        descriptor.vendor_id() == candidate.vendor_id
                            && descriptor.product_id() == candidate.product_id
                    })
            })
            .ok_or(OpenError::Gone)?;

        let adapter = RusbAdapter::open(&device, completions)?;
        Ok(Box::new(adapter))
    }
}

/// Pack a descriptor version back into its bcdDevice form
pub fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = version.major() as u16;
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | ((version.minor() as u16) << 4)
        | version.sub_minor() as u16
}
