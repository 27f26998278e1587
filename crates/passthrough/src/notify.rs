//! Lock-free flags shared between the request thread and the completion worker

use common::{HostServices, TransferKind, TransferStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::error;

const FAILURE_MESSAGE_DURATION: Duration = Duration::from_secs(10);

/// Boolean that is consumed by exactly one reader
#[derive(Debug, Default)]
pub struct OneShotFlag(AtomicBool);

impl OneShotFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set
    pub fn test_and_clear(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Shows the "adapter may be incompatible" message once per failure streak
#[derive(Debug, Default)]
pub struct FailureNotifier {
    shown: AtomicBool,
}

impl FailureNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one finished transfer. Returns true if the user was notified.
    pub fn record(&self, kind: TransferKind, status: TransferStatus, host: &dyn HostServices) -> bool {
        if status == TransferStatus::Completed {
            self.shown.store(false, Ordering::SeqCst);
            return false;
        }
        if !status.is_failure() {
            return false;
        }

        error!("{:?} transfer failed, status: {:?}", kind, status);
        if self.shown.swap(true, Ordering::SeqCst) {
            return false;
        }

        let headline = match kind {
            TransferKind::Control => "Failed to send a command to the Bluetooth adapter.",
            TransferKind::Interrupt | TransferKind::Bulk => {
                "Failed to transfer to or from to the Bluetooth adapter."
            }
        };
        host.display_message(headline, FAILURE_MESSAGE_DURATION);
        host.display_message(
            "It may not be compatible with passthrough mode.",
            FAILURE_MESSAGE_DURATION,
        );
        true
    }

    pub fn is_shown(&self) -> bool {
        self.shown.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::RecordingHost;

    #[test]
    fn test_one_shot_flag() {
        let flag = OneShotFlag::new();
        assert!(!flag.test_and_clear());
        flag.set();
        flag.set();
        assert!(flag.is_set());
        assert!(flag.test_and_clear());
        assert!(!flag.test_and_clear());
    }

    #[test]
    fn test_failure_streak_notifies_once() {
        let host = RecordingHost::new();
        let notifier = FailureNotifier::new();

        assert!(notifier.record(TransferKind::Bulk, TransferStatus::Stall, &host));
        assert!(!notifier.record(TransferKind::Bulk, TransferStatus::Error, &host));
        assert_eq!(host.messages().len(), 2);

        // timeouts neither notify nor end the streak
        assert!(!notifier.record(TransferKind::Interrupt, TransferStatus::TimedOut, &host));
        assert!(notifier.is_shown());

        assert!(!notifier.record(TransferKind::Interrupt, TransferStatus::Completed, &host));
        assert!(!notifier.is_shown());

        assert!(notifier.record(TransferKind::Control, TransferStatus::Overflow, &host));
        let messages = host.messages();
        assert_eq!(messages.len(), 4);
        assert!(messages[2].contains("send a command"));
    }

    #[test]
    fn test_teardown_statuses_are_quiet() {
        let host = RecordingHost::new();
        let notifier = FailureNotifier::new();
        assert!(!notifier.record(TransferKind::Bulk, TransferStatus::Cancelled, &host));
        assert!(!notifier.record(TransferKind::Bulk, TransferStatus::NoDevice, &host));
        assert!(host.messages().is_empty());
    }
}
