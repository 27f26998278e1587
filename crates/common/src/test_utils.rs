//! Test utilities for the Bluetooth passthrough
//!
//! Provides recording collaborators and a scriptable USB backend so the
//! passthrough core can be driven end to end without hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockBackend, create_mock_bluetooth_candidate};
//! use common::UsbBackend;
//!
//! let backend = MockBackend::new();
//! backend.add_candidate(create_mock_bluetooth_candidate(1, 0x0a12, 0x0001));
//! assert_eq!(backend.candidates().unwrap().len(), 1);
//! ```

use crate::channel::CompletionSender;
use crate::guest::{HostServices, RequestAddr, ReplySink};
use crate::transport::{AdapterHandle, UsbBackend};
use crate::usb_types::{
    AdapterCandidate, AdapterStrings, BLUETOOTH_CLASS, Completion, InterfaceClass, OpenError,
    SubmitError, Transfer, TransferKind, TransferStatus, UsbError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Create a candidate whose interface 0 is a Bluetooth radio
///
/// # Arguments
/// * `address` - Device address on bus 1
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
pub fn create_mock_bluetooth_candidate(
    address: u8,
    vendor_id: u16,
    product_id: u16,
) -> AdapterCandidate {
    create_mock_candidate_with_class(address, vendor_id, product_id, Some(BLUETOOTH_CLASS))
}

/// Create a candidate with an arbitrary interface class
pub fn create_mock_candidate_with_class(
    address: u8,
    vendor_id: u16,
    product_id: u16,
    interface: Option<InterfaceClass>,
) -> AdapterCandidate {
    AdapterCandidate {
        bus_number: 1,
        device_address: address,
        vendor_id,
        product_id,
        device_version: 0x0100,
        interface,
    }
}

/// Create a mass-storage candidate (never selected by class matching)
pub fn create_mock_storage_candidate(address: u8) -> AdapterCandidate {
    create_mock_candidate_with_class(
        address,
        0x0781,
        0x5567,
        Some(InterfaceClass {
            class: 0x08,
            subclass: 0x06,
            protocol: 0x50,
        }),
    )
}

// ============================================================================
// Recording collaborators
// ============================================================================

/// Reply sink that records every reply and lets tests wait for one
#[derive(Default)]
pub struct RecordingReplies {
    replies: Mutex<Vec<(RequestAddr, i32)>>,
    arrived: Condvar,
}

impl RecordingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every reply so far, in arrival order
    pub fn all(&self) -> Vec<(RequestAddr, i32)> {
        lock(&self.replies).clone()
    }

    /// Replies addressed to `request`
    pub fn for_request(&self, request: RequestAddr) -> Vec<i32> {
        lock(&self.replies)
            .iter()
            .filter(|(addr, _)| *addr == request)
            .map(|(_, value)| *value)
            .collect()
    }

    /// Wait until `request` has been answered, returning its (first) return value
    pub fn wait_for(&self, request: RequestAddr, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        let mut replies = lock(&self.replies);
        loop {
            if let Some((_, value)) = replies.iter().find(|(addr, _)| *addr == request) {
                return Some(*value);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            replies = self
                .arrived
                .wait_timeout(replies, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }
}

impl ReplySink for RecordingReplies {
    fn enqueue_reply(&self, request: RequestAddr, return_value: i32) {
        lock(&self.replies).push((request, return_value));
        self.arrived.notify_all();
    }
}

/// Host that records messages, alerts and stop requests
#[derive(Default)]
pub struct RecordingHost {
    messages: Mutex<Vec<String>>,
    alerts: Mutex<Vec<String>>,
    stop_requested: AtomicBool,
    button: Mutex<Option<bool>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        lock(&self.alerts).clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Expose a live sync button signal to the passthrough
    pub fn set_button(&self, held: Option<bool>) {
        *lock(&self.button) = held;
    }
}

impl HostServices for RecordingHost {
    fn display_message(&self, message: &str, _duration: Duration) {
        lock(&self.messages).push(message.to_string());
    }

    fn alert(&self, message: &str) {
        lock(&self.alerts).push(message.to_string());
    }

    fn stop_execution(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn sync_button_held(&self) -> Option<bool> {
        *lock(&self.button)
    }
}

// ============================================================================
// Scriptable USB backend
// ============================================================================

/// A transfer as observed by the mock adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransfer {
    pub kind: TransferKind,
    pub endpoint: u8,
    /// OUT payload (empty for IN transfers)
    pub data: Vec<u8>,
}

/// Ordered record of everything sent to the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterTraffic {
    /// Synchronous HCI command written by the passthrough itself
    Command(Vec<u8>),
    /// Asynchronous transfer submitted on behalf of the guest
    Transfer(SubmittedTransfer),
}

#[derive(Default)]
struct MockShared {
    candidates: Mutex<Vec<AdapterCandidate>>,
    open_failures: Mutex<HashMap<(u8, u8), OpenError>>,
    opened: Mutex<Vec<AdapterCandidate>>,
    pending: Mutex<VecDeque<Transfer>>,
    traffic: Mutex<Vec<AdapterTraffic>>,
    events: Mutex<VecDeque<Vec<u8>>>,
    auto_ack: AtomicBool,
    completions: Mutex<Option<CompletionSender>>,
    released: AtomicUsize,
    closed: AtomicUsize,
    strings: Mutex<AdapterStrings>,
}

/// USB backend whose adapters complete transfers only when the test says so
#[derive(Clone, Default)]
pub struct MockBackend {
    shared: Arc<MockShared>,
}

impl MockBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.shared.auto_ack.store(true, Ordering::SeqCst);
        backend
    }

    pub fn add_candidate(&self, candidate: AdapterCandidate) {
        lock(&self.shared.candidates).push(candidate);
    }

    /// Make opening the device at `address` fail
    pub fn fail_open(&self, address: u8, error: OpenError) {
        lock(&self.shared.open_failures).insert((1, address), error);
    }

    /// Strings reported by adapters opened from now on
    pub fn set_strings(&self, strings: AdapterStrings) {
        *lock(&self.shared.strings) = strings;
    }

    /// Answer every synchronous command with a matching Command_Complete (default on)
    pub fn set_auto_ack(&self, enabled: bool) {
        self.shared.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// Queue an event for the next synchronous event read
    pub fn push_event(&self, packet: Vec<u8>) {
        lock(&self.shared.events).push_back(packet);
    }

    /// Candidates opened so far, in order
    pub fn opened(&self) -> Vec<AdapterCandidate> {
        lock(&self.shared.opened).clone()
    }

    pub fn traffic(&self) -> Vec<AdapterTraffic> {
        lock(&self.shared.traffic).clone()
    }

    /// Synchronous commands written so far
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.traffic()
            .into_iter()
            .filter_map(|t| match t {
                AdapterTraffic::Command(packet) => Some(packet),
                AdapterTraffic::Transfer(_) => None,
            })
            .collect()
    }

    /// Asynchronous transfers submitted so far
    pub fn submitted(&self) -> Vec<SubmittedTransfer> {
        self.traffic()
            .into_iter()
            .filter_map(|t| match t {
                AdapterTraffic::Transfer(transfer) => Some(transfer),
                AdapterTraffic::Command(_) => None,
            })
            .collect()
    }

    /// Transfers submitted but not yet completed
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    pub fn release_count(&self) -> usize {
        self.shared.released.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Complete the oldest pending transfer on `endpoint`.
    ///
    /// For IN transfers `data` is copied into the transfer buffer (truncated to
    /// its size). Returns false if nothing was pending or the adapter is closed.
    pub fn complete(&self, endpoint: u8, status: TransferStatus, data: &[u8]) -> bool {
        let transfer = {
            let mut pending = lock(&self.shared.pending);
            match pending.iter().position(|t| t.endpoint == endpoint) {
                Some(index) => pending.remove(index),
                None => None,
            }
        };
        let Some(mut transfer) = transfer else {
            return false;
        };

        let actual = if transfer.is_in() {
            let n = data.len().min(transfer.buffer.len());
            transfer.buffer[..n].copy_from_slice(&data[..n]);
            n
        } else if status == TransferStatus::Completed {
            transfer.buffer.len()
        } else {
            0
        };
        let actual = if status == TransferStatus::TimedOut { 0 } else { actual };

        let sender = lock(&self.shared.completions).clone();
        match sender {
            Some(sender) => sender
                .send(Completion::finish(transfer, status, actual))
                .is_ok(),
            None => false,
        }
    }

    /// Wait until at least `count` transfers are pending
    pub fn wait_for_pending(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.pending_count() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.pending_count() >= count
    }
}

impl UsbBackend for MockBackend {
    fn candidates(&self) -> Result<Vec<AdapterCandidate>, UsbError> {
        Ok(lock(&self.shared.candidates).clone())
    }

    fn open(
        &self,
        candidate: &AdapterCandidate,
        completions: CompletionSender,
    ) -> Result<Box<dyn AdapterHandle>, OpenError> {
        let key = (candidate.bus_number, candidate.device_address);
        if let Some(error) = lock(&self.shared.open_failures).get(&key) {
            return Err(error.clone());
        }
        lock(&self.shared.opened).push(candidate.clone());
        *lock(&self.shared.completions) = Some(completions);
        Ok(Box::new(MockAdapter {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockAdapter {
    shared: Arc<MockShared>,
    closed: AtomicBool,
}

impl AdapterHandle for MockAdapter {
    fn strings(&self) -> AdapterStrings {
        lock(&self.shared.strings).clone()
    }

    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError {
                transfer,
                reason: UsbError::NoDevice,
            });
        }
        let data = if transfer.is_in() {
            Vec::new()
        } else {
            transfer.buffer.clone()
        };
        lock(&self.shared.traffic).push(AdapterTraffic::Transfer(SubmittedTransfer {
            kind: transfer.kind,
            endpoint: transfer.endpoint,
            data,
        }));
        lock(&self.shared.pending).push_back(transfer);
        Ok(())
    }

    fn write_command(&self, packet: &[u8], _timeout: Duration) -> Result<usize, UsbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UsbError::NoDevice);
        }
        lock(&self.shared.traffic).push(AdapterTraffic::Command(packet.to_vec()));
        if self.shared.auto_ack.load(Ordering::SeqCst) && packet.len() >= 2 {
            let ack = vec![0x0E, 0x04, 0x01, packet[0], packet[1], 0x00];
            lock(&self.shared.events).push_back(ack);
        }
        Ok(packet.len())
    }

    fn read_event(&self, buffer: &mut [u8], _timeout: Duration) -> Result<usize, UsbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UsbError::NoDevice);
        }
        match lock(&self.shared.events).pop_front() {
            Some(event) => {
                let n = event.len().min(buffer.len());
                buffer[..n].copy_from_slice(&event[..n]);
                Ok(n)
            }
            None => Err(UsbError::Timeout),
        }
    }

    fn release_interface(&self) {
        self.shared.released.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sender = lock(&self.shared.completions).take();
        let pending: Vec<Transfer> = lock(&self.shared.pending).drain(..).collect();
        if let Some(sender) = sender {
            for transfer in pending {
                let _ = sender.send(Completion::cancelled(transfer));
            }
        }
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::create_completion_queue;
    use crate::tickets::TicketRegistry;

    #[test]
    fn test_recording_replies_wait() {
        let replies = Arc::new(RecordingReplies::new());
        let writer = replies.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            writer.enqueue_reply(RequestAddr(7), 3);
        });
        assert_eq!(replies.wait_for(RequestAddr(7), DEFAULT_TEST_TIMEOUT), Some(3));
        assert_eq!(replies.wait_for(RequestAddr(8), Duration::from_millis(5)), None);
        handle.join().unwrap();
    }

    #[test]
    fn test_mock_adapter_completion() {
        let backend = MockBackend::new();
        backend.add_candidate(create_mock_bluetooth_candidate(1, 0x0a12, 0x0001));
        let (tx, rx) = create_completion_queue();
        let candidate = backend.candidates().unwrap().remove(0);
        let adapter = backend.open(&candidate, tx).unwrap();

        let registry = TicketRegistry::new();
        let transfer = Transfer::interrupt(registry.issue(()), 0x81, vec![0; 16], Duration::ZERO);
        adapter.submit(transfer).unwrap();
        assert!(backend.complete(0x81, TransferStatus::Completed, &[0x0E, 0x00]));

        let completion = rx.recv().unwrap();
        assert_eq!(completion.data(), &[0x0E, 0x00]);
        assert!(registry.redeem(completion.ticket).is_some());
    }

    #[test]
    fn test_mock_adapter_close_cancels_pending() {
        let backend = MockBackend::new();
        let candidate = create_mock_bluetooth_candidate(1, 0x0a12, 0x0001);
        let (tx, rx) = create_completion_queue();
        let adapter = backend.open(&candidate, tx).unwrap();

        let registry = TicketRegistry::new();
        adapter
            .submit(Transfer::bulk(registry.issue(()), 0x82, vec![0; 8], Duration::ZERO))
            .unwrap();
        adapter.close();
        adapter.close();

        assert_eq!(rx.recv().unwrap().status, TransferStatus::Cancelled);
        assert!(rx.recv().is_err());
        assert_eq!(backend.close_count(), 1);
    }

    #[test]
    fn test_auto_ack() {
        let backend = MockBackend::new();
        let candidate = create_mock_bluetooth_candidate(1, 0x0a12, 0x0001);
        let (tx, _rx) = create_completion_queue();
        let adapter = backend.open(&candidate, tx).unwrap();

        adapter.write_command(&[0x03, 0x0C, 0x00], Duration::ZERO).unwrap();
        let mut buf = [0u8; 16];
        let n = adapter.read_event(&mut buf, Duration::ZERO).unwrap();
        assert_eq!(&buf[..n], &[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
        assert_eq!(adapter.read_event(&mut buf, Duration::ZERO), Err(UsbError::Timeout));
    }
}
