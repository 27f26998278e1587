//! Save-state support
//!
//! The adapter's state lives outside the emulator, so a passthrough session
//! can never be restored faithfully. Saving records that passthrough was in
//! use; loading warns the user and refuses states made without passthrough.

use crate::error::{PassthroughError, Result};
use common::HostServices;
use hci::{PassthroughSnapshot, decode_snapshot, encode_snapshot};
use std::time::Duration;
use tracing::warn;

const ABORT_MESSAGE_DURATION: Duration = Duration::from_secs(4);

/// Serialize the passthrough device's snapshot record
pub fn save_state() -> Result<Vec<u8>> {
    Ok(encode_snapshot(&PassthroughSnapshot::active())?)
}

/// Check a snapshot record on load.
///
/// Always alerts the user. Fails when the record is corrupt or was written
/// with passthrough disabled, in which case the load must be aborted.
pub fn restore_state(bytes: &[u8], host: &dyn HostServices) -> Result<()> {
    host.alert("Attempted to load a state. Bluetooth will likely be broken now.");

    let snapshot = match decode_snapshot(bytes) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Unreadable Bluetooth passthrough state: {}", e);
            host.display_message(
                "Bluetooth passthrough state is unreadable. Aborting load.",
                ABORT_MESSAGE_DURATION,
            );
            return Err(PassthroughError::RestoreAborted(e.to_string()));
        }
    };

    if !snapshot.passthrough_enabled {
        host.display_message(
            "State needs Bluetooth passthrough to be disabled. Aborting load.",
            ABORT_MESSAGE_DURATION,
        );
        return Err(PassthroughError::RestoreAborted(
            "state was saved with Bluetooth passthrough disabled".to_string(),
        ));
    }

    warn!("Loaded a state while Bluetooth passthrough is active");
    Ok(())
}
