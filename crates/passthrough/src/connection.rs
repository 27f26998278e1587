//! Adapter discovery and the open connection to it

use crate::error::{PassthroughError, Result};
use common::{
    AdapterCandidate, AdapterHandle, BLUETOOTH_CLASS, CompletionSender, HostServices, OpenError,
    UsbBackend,
};
use tracing::{debug, error, info, warn};

/// Vendor and product id of the console's own Bluetooth module
pub const INTEGRATED_MODULE: (u16, u16) = (0x057e, 0x0305);

/// Whether `candidate` passes the vendor/product override (everything does without one)
pub fn is_wanted_device(candidate: &AdapterCandidate, device_override: Option<(u16, u16)>) -> bool {
    match device_override {
        Some((vid, pid)) => candidate.vendor_id == vid && candidate.product_id == pid,
        None => true,
    }
}

/// Whether interface 0 of `candidate` is a Bluetooth radio.
///
/// With an override configured the class is not checked at all.
pub fn is_bluetooth_interface(
    candidate: &AdapterCandidate,
    device_override: Option<(u16, u16)>,
) -> bool {
    device_override.is_some() || candidate.interface == Some(BLUETOOTH_CLASS)
}

pub fn is_integrated_module(candidate: &AdapterCandidate) -> bool {
    (candidate.vendor_id, candidate.product_id) == INTEGRATED_MODULE
}

/// Candidates eligible for passthrough, in enumeration order
pub fn eligible_candidates(
    candidates: &[AdapterCandidate],
    device_override: Option<(u16, u16)>,
) -> Vec<AdapterCandidate> {
    candidates
        .iter()
        .filter(|candidate| {
            if candidate.interface.is_none() {
                error!("Failed to get config descriptor for device {}", candidate);
                return false;
            }
            is_bluetooth_interface(candidate, device_override)
                && is_wanted_device(candidate, device_override)
        })
        .cloned()
        .collect()
}

/// An adapter opened with its Bluetooth interface claimed
pub struct Connection {
    adapter: Box<dyn AdapterHandle>,
    candidate: AdapterCandidate,
    integrated: bool,
}

impl Connection {
    /// Open the first eligible adapter.
    ///
    /// A candidate that cannot be opened is reported through a host alert and
    /// skipped. Fails with [`PassthroughError::NoAdapter`] when nothing could
    /// be opened.
    pub fn open(
        backend: &dyn UsbBackend,
        device_override: Option<(u16, u16)>,
        completions: &CompletionSender,
        host: &dyn HostServices,
    ) -> Result<Self> {
        let candidates = backend.candidates()?;
        debug!("Enumerated {} USB device(s)", candidates.len());

        for candidate in eligible_candidates(&candidates, device_override) {
            match backend.open(&candidate, completions.clone()) {
                Ok(adapter) => {
                    let strings = adapter.strings();
                    info!(
                        "Using device {} for Bluetooth: {} {} {}",
                        candidate,
                        strings.manufacturer.as_deref().unwrap_or(""),
                        strings.product.as_deref().unwrap_or(""),
                        strings.serial_number.as_deref().unwrap_or("")
                    );
                    let integrated = is_integrated_module(&candidate);
                    return Ok(Self {
                        adapter,
                        candidate,
                        integrated,
                    });
                }
                Err(OpenError::Gone) => {
                    warn!("Device {} disappeared before it could be opened", candidate);
                }
                Err(e) => {
                    warn!("Skipping device {}: {}", candidate, e);
                    host.alert(&e.to_string());
                }
            }
        }

        Err(PassthroughError::NoAdapter)
    }

    pub fn adapter(&self) -> &dyn AdapterHandle {
        self.adapter.as_ref()
    }

    pub fn candidate(&self) -> &AdapterCandidate {
        &self.candidate
    }

    /// Whether this is the console's own module, which needs no reply faking
    pub fn is_integrated(&self) -> bool {
        self.integrated
    }

    /// Release the interface and invalidate the handle.
    ///
    /// When this returns every submitted transfer has been completed.
    pub fn close(self) {
        debug!("Closing Bluetooth adapter {}", self.candidate);
        self.adapter.release_interface();
        self.adapter.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::InterfaceClass;
    use common::test_utils::{
        create_mock_bluetooth_candidate, create_mock_candidate_with_class,
        create_mock_storage_candidate,
    };

    #[test]
    fn test_class_matching() {
        let radio = create_mock_bluetooth_candidate(1, 0x0a12, 0x0001);
        let storage = create_mock_storage_candidate(2);
        assert!(is_bluetooth_interface(&radio, None));
        assert!(!is_bluetooth_interface(&storage, None));

        let almost = create_mock_candidate_with_class(
            3,
            0x0a12,
            0x0001,
            Some(InterfaceClass {
                class: 0xE0,
                subclass: 0x01,
                protocol: 0x02,
            }),
        );
        assert!(!is_bluetooth_interface(&almost, None));
    }

    #[test]
    fn test_override_selects_exact_device() {
        let storage = create_mock_storage_candidate(2);
        let radio = create_mock_bluetooth_candidate(1, 0x0a12, 0x0001);
        let device_override = Some((0x0781, 0x5567));

        assert!(is_bluetooth_interface(&storage, device_override));
        assert!(is_wanted_device(&storage, device_override));
        assert!(!is_wanted_device(&radio, device_override));

        let picked = eligible_candidates(&[radio, storage.clone()], device_override);
        assert_eq!(picked, vec![storage]);
    }

    #[test]
    fn test_unreadable_config_skipped() {
        let unknown = create_mock_candidate_with_class(4, 0x0a12, 0x0001, None);
        assert!(eligible_candidates(&[unknown], None).is_empty());
    }

    #[test]
    fn test_integrated_identity() {
        assert!(is_integrated_module(&create_mock_bluetooth_candidate(1, 0x057e, 0x0305)));
        assert!(!is_integrated_module(&create_mock_bluetooth_candidate(1, 0x057e, 0x0306)));
    }
}
