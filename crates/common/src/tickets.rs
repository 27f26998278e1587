//! Registry correlating in-flight transfers with their originating requests

use crate::usb_types::{Ticket, TicketId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Arena of pending records keyed by generated ticket ids.
///
/// `issue` is called on the request thread, `redeem` on the completion worker;
/// the lock is only held for a map insert or remove.
pub struct TicketRegistry<T> {
    next_id: AtomicU64,
    pending: Mutex<HashMap<TicketId, T>>,
}

impl<T> TicketRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Store `record` and return the only ticket that can claim it back
    pub fn issue(&self, record: T) -> Ticket {
        let id = TicketId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, record);
        trace!("Issued ticket {}", id);
        Ticket::new(id)
    }

    /// Consume `ticket` and return its record.
    ///
    /// `None` means the record was already drained by [`TicketRegistry::drain`].
    pub fn redeem(&self, ticket: Ticket) -> Option<T> {
        let id = ticket.id();
        let record = self.lock().remove(&id);
        trace!("Redeemed ticket {} (found: {})", id, record.is_some());
        record
    }

    /// Number of transfers still in flight
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every pending record, e.g. after a backend vanished without completing
    pub fn drain(&self) -> Vec<(TicketId, T)> {
        self.lock().drain().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TicketId, T>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Default for TicketRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_issue_and_redeem() {
        let registry = TicketRegistry::new();
        let a = registry.issue("a");
        let b = registry.issue("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.redeem(b), Some("b"));
        assert_eq!(registry.redeem(a), Some("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_then_redeem() {
        let registry = TicketRegistry::new();
        let a = registry.issue(1u32);
        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(registry.redeem(a), None);
    }

    #[test]
    fn test_cross_thread_redeem() {
        let registry = Arc::new(TicketRegistry::new());
        let tickets: Vec<_> = (0..100u32).map(|i| registry.issue(i)).collect();

        let worker_registry = registry.clone();
        let handle = thread::spawn(move || {
            tickets
                .into_iter()
                .filter_map(|t| worker_registry.redeem(t))
                .sum::<u32>()
        });

        assert_eq!(handle.join().unwrap(), (0..100).sum());
        assert!(registry.is_empty());
    }
}
