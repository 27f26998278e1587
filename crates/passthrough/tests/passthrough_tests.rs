//! Passthrough Integration Tests
//!
//! Drives `BluetoothPassthrough` end to end against the scriptable mock
//! backend and the loop-back guest:
//! - Adapter discovery and open failures
//! - Reply faking for Read_Buffer_Size and vendor commands
//! - Link-key mirroring and the post-reset key refill
//! - Sync-button events
//! - Teardown with transfers in flight
//!
//! Run with: `cargo test -p passthrough --test passthrough_tests`

use common::test_utils::{
    AdapterTraffic, DEFAULT_TEST_TIMEOUT, MockBackend, RecordingHost, RecordingReplies,
    SubmittedTransfer, create_mock_bluetooth_candidate, create_mock_storage_candidate,
};
use common::guest::usbv0;
use common::{
    AdapterCandidate, GuestMemory, IoVector, IoctlvRequest, LoopbackGuest, OpenError,
    RequestAddr, TransferKind, TransferStatus, UsbError,
};
use hci::{BdAddr, DeleteStoredLinkKey, LinkKey};
use passthrough::{
    BluetoothPassthrough, Environment, PassthroughConfig, PassthroughError, RequestOutcome,
    return_codes,
};
use std::sync::Arc;

const EVENT_ENDPOINT: u8 = 0x81;
const ACL_IN: u8 = 0x82;
const ACL_OUT: u8 = 0x02;

const KEY_A: &str = "00:11:22:33:44:55=000102030405060708090a0b0c0d0e0f";
const KEY_B: &str = "66:77:88:99:aa:bb=f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff";

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    backend: MockBackend,
    guest: Arc<LoopbackGuest>,
    replies: Arc<RecordingReplies>,
    host: Arc<RecordingHost>,
    bt: BluetoothPassthrough,
}

impl Harness {
    fn new(config: PassthroughConfig, candidates: Vec<AdapterCandidate>) -> Self {
        let backend = MockBackend::new();
        for candidate in candidates {
            backend.add_candidate(candidate);
        }
        let guest = Arc::new(LoopbackGuest::new(64 * 1024));
        let replies = Arc::new(RecordingReplies::new());
        let host = Arc::new(RecordingHost::new());
        let env = Environment {
            memory: guest.clone(),
            replies: replies.clone(),
            host: host.clone(),
        };
        let bt = BluetoothPassthrough::new(config, Arc::new(backend.clone()), env);
        Self {
            backend,
            guest,
            replies,
            host,
            bt,
        }
    }

    /// Opened on a generic third-party adapter
    fn open(config: PassthroughConfig) -> Self {
        let mut harness = Self::new(config, vec![create_mock_bluetooth_candidate(1, 0x0a12, 0x0001)]);
        harness.bt.open().unwrap();
        harness
    }

    /// Opened on the console's own module
    fn open_integrated(config: PassthroughConfig) -> Self {
        let mut harness = Self::new(config, vec![create_mock_bluetooth_candidate(1, 0x057e, 0x0305)]);
        harness.bt.open().unwrap();
        harness
    }

    fn command(&self, packet: &[u8]) -> IoctlvRequest {
        let request = self.guest.hci_command_request(packet).unwrap();
        assert_eq!(self.bt.handle_request(&request), RequestOutcome::NoReply);
        request
    }

    fn poll(&self) -> IoctlvRequest {
        let request = self.guest.interrupt_request(EVENT_ENDPOINT, 64).unwrap();
        assert_eq!(self.bt.handle_request(&request), RequestOutcome::NoReply);
        request
    }

    fn reply(&self, request: &IoctlvRequest) -> i32 {
        self.replies
            .wait_for(request.address, DEFAULT_TEST_TIMEOUT)
            .expect("request was never answered")
    }

    fn guest_data(&self, request: &IoctlvRequest, len: usize) -> Vec<u8> {
        self.guest.read(request.io_vectors[0].address, len).unwrap()
    }

    /// Complete the outstanding event poll with `event` and wait for its reply
    fn deliver_event(&self, request: &IoctlvRequest, event: &[u8]) {
        assert!(self.backend.complete(EVENT_ENDPOINT, TransferStatus::Completed, event));
        assert_eq!(self.reply(request), event.len() as i32);
    }
}

fn config_with_keys(keys: &str) -> PassthroughConfig {
    let mut config = PassthroughConfig::default();
    config.bluetooth.link_keys = keys.to_string();
    config
}

fn link_key_notification(addr: BdAddr, key: LinkKey) -> Vec<u8> {
    let mut event = vec![0x18, 0x17];
    event.extend_from_slice(addr.as_bytes());
    event.extend_from_slice(key.as_bytes());
    event.push(0x00);
    event
}

// ============================================================================
// Discovery
// ============================================================================

#[test]
fn test_open_selects_bluetooth_adapter() {
    let mut h = Harness::new(
        PassthroughConfig::default(),
        vec![
            create_mock_storage_candidate(1),
            create_mock_bluetooth_candidate(2, 0x0a12, 0x0001),
        ],
    );
    h.bt.open().unwrap();

    assert!(h.bt.is_open());
    assert_eq!(h.backend.opened().len(), 1);
    assert_eq!(h.backend.opened()[0].device_address, 2);
    assert!(h.host.alerts().is_empty());
}

#[test]
fn test_open_is_idempotent() {
    let mut h = Harness::open(PassthroughConfig::default());
    h.bt.open().unwrap();
    assert_eq!(h.backend.opened().len(), 1);
}

#[test]
fn test_no_adapter_alerts_and_stops() {
    let mut h = Harness::new(
        PassthroughConfig::default(),
        vec![create_mock_storage_candidate(1)],
    );

    assert!(matches!(h.bt.open(), Err(PassthroughError::NoAdapter)));
    assert!(!h.bt.is_open());
    assert!(h.host.stop_requested());
    assert_eq!(
        h.host.alerts(),
        vec![
            "Bluetooth passthrough mode is enabled, but no usable Bluetooth USB device was found. Aborting."
                .to_string()
        ]
    );
}

#[test]
fn test_open_failure_moves_to_next_candidate() {
    let mut h = Harness::new(
        PassthroughConfig::default(),
        vec![
            create_mock_bluetooth_candidate(1, 0x0a12, 0x0001),
            create_mock_bluetooth_candidate(2, 0x0a12, 0x0001),
        ],
    );
    h.backend
        .fail_open(1, OpenError::ClaimInterface(UsbError::Busy));
    h.bt.open().unwrap();

    assert_eq!(h.backend.opened()[0].device_address, 2);
    assert_eq!(h.host.alerts().len(), 1);
    assert!(h.host.alerts()[0].contains("claim interface"));
    assert!(!h.host.stop_requested());
}

#[test]
fn test_close_then_reopen() {
    let mut h = Harness::open(PassthroughConfig::default());
    h.bt.close();
    assert!(!h.bt.is_open());

    h.bt.open().unwrap();
    assert!(h.bt.is_open());
    assert_eq!(h.backend.opened().len(), 2);

    // Completions flow through the fresh queue and worker
    let poll = h.poll();
    h.deliver_event(&poll, &[0x13, 0x05, 0x01, 0x01, 0x00, 0x01, 0x00]);
    assert_eq!(h.replies.for_request(poll.address), vec![7]);
}

#[test]
fn test_override_selects_device_regardless_of_class() {
    let mut config = PassthroughConfig::default();
    config.usb.vendor_id = Some(0x0781);
    config.usb.product_id = Some(0x5567);
    let mut h = Harness::new(
        config,
        vec![
            create_mock_bluetooth_candidate(1, 0x0a12, 0x0001),
            create_mock_storage_candidate(2),
        ],
    );
    h.bt.open().unwrap();
    assert_eq!(h.backend.opened()[0].vendor_id, 0x0781);
}

// ============================================================================
// Request routing
// ============================================================================

#[test]
fn test_request_before_open_is_rejected() {
    let h = Harness::new(
        PassthroughConfig::default(),
        vec![create_mock_bluetooth_candidate(1, 0x0a12, 0x0001)],
    );
    let request = h.guest.interrupt_request(EVENT_ENDPOINT, 64).unwrap();
    assert_eq!(
        h.bt.handle_request(&request),
        RequestOutcome::Reply(return_codes::IPC_ENOENT)
    );
}

#[test]
fn test_unknown_request_code_is_rejected() {
    let h = Harness::open(PassthroughConfig::default());
    let mut request = h.guest.interrupt_request(EVENT_ENDPOINT, 64).unwrap();
    request.request = 7;
    assert_eq!(
        h.bt.handle_request(&request),
        RequestOutcome::Reply(return_codes::IPC_EINVAL)
    );
    assert!(h.backend.submitted().is_empty());
}

#[test]
fn test_control_length_read_little_endian() {
    let h = Harness::open(PassthroughConfig::default());
    let field = |bytes: &[u8]| {
        let address = h.guest.alloc(bytes.len() as u32).unwrap();
        h.guest.copy_to_guest(address, bytes).unwrap();
        IoVector {
            address,
            size: bytes.len() as u32,
        }
    };
    let mut buffer = vec![0u8; 32];
    buffer[..3].copy_from_slice(&[0x03, 0x0C, 0x00]);
    let request = IoctlvRequest {
        address: RequestAddr(h.guest.alloc(4).unwrap()),
        request: usbv0::CTRLMSG,
        in_vectors: vec![
            field(&[0x21]),
            field(&[0x00]),
            field(&[0x00, 0x00]),
            field(&[0x00, 0x00]),
            field(&[0x03, 0x00]),
            field(&[0x00]),
        ],
        io_vectors: vec![field(&buffer)],
    };
    assert_eq!(h.bt.handle_request(&request), RequestOutcome::NoReply);

    assert_eq!(
        h.backend.submitted(),
        vec![SubmittedTransfer {
            kind: TransferKind::Control,
            endpoint: 0,
            data: vec![0x03, 0x0C, 0x00],
        }]
    );
}

#[test]
fn test_bulk_out_forwarded() {
    let h = Harness::open(PassthroughConfig::default());
    let request = h.guest.bulk_out_request(ACL_OUT, &[1, 2, 3, 4]).unwrap();
    assert_eq!(h.bt.handle_request(&request), RequestOutcome::NoReply);

    assert_eq!(
        h.backend.submitted(),
        vec![SubmittedTransfer {
            kind: TransferKind::Bulk,
            endpoint: ACL_OUT,
            data: vec![1, 2, 3, 4],
        }]
    );
    assert!(h.backend.complete(ACL_OUT, TransferStatus::Completed, &[]));
    assert_eq!(h.reply(&request), 4);
}

#[test]
fn test_bulk_in_copies_to_guest() {
    let h = Harness::open(PassthroughConfig::default());
    let request = h.guest.bulk_in_request(ACL_IN, 32).unwrap();
    assert_eq!(h.bt.handle_request(&request), RequestOutcome::NoReply);

    assert!(h.backend.complete(ACL_IN, TransferStatus::Completed, &[9, 8, 7]));
    assert_eq!(h.reply(&request), 3);
    assert_eq!(h.guest_data(&request, 3), vec![9, 8, 7]);
}

#[test]
fn test_timed_out_poll_replies_zero() {
    let h = Harness::open(PassthroughConfig::default());
    let poll = h.poll();
    assert!(h.backend.complete(EVENT_ENDPOINT, TransferStatus::TimedOut, &[]));
    assert_eq!(h.reply(&poll), 0);
    assert!(h.host.messages().is_empty());
}

// ============================================================================
// Reply faking
// ============================================================================

#[test]
fn test_read_buffer_size_is_faked() {
    let h = Harness::open(PassthroughConfig::default());
    let command = h.command(&[0x05, 0x10, 0x00]);
    assert_eq!(h.replies.for_request(command.address), vec![3]);

    let expected = hci::fake_read_buffer_size_reply();
    let poll = h.poll();
    assert_eq!(h.reply(&poll), expected.len() as i32);
    assert_eq!(h.guest_data(&poll, expected.len()), expected);
    assert!(h.backend.submitted().is_empty());

    // Only one fake per command
    h.poll();
    assert_eq!(h.backend.submitted().len(), 1);
}

#[test]
fn test_read_buffer_size_faked_for_integrated_module() {
    let h = Harness::open_integrated(PassthroughConfig::default());
    h.command(&[0x05, 0x10, 0x00]);
    let poll = h.poll();
    assert_eq!(
        h.reply(&poll),
        hci::fake_read_buffer_size_reply().len() as i32
    );
}

#[test]
fn test_vendor_command_is_faked() {
    let h = Harness::open(PassthroughConfig::default());
    h.command(&[0x4C, 0xFC, 0x00]);

    let poll = h.poll();
    assert_eq!(h.reply(&poll), 6);
    assert_eq!(
        h.guest_data(&poll, 6),
        vec![0x0E, 0x04, 0x01, 0x4C, 0xFC, 0x00]
    );
}

#[test]
fn test_vendor_command_forwarded_to_integrated_module() {
    let h = Harness::open_integrated(PassthroughConfig::default());
    let command = h.command(&[0x4F, 0xFC, 0x00]);

    assert_eq!(
        h.backend.submitted(),
        vec![SubmittedTransfer {
            kind: TransferKind::Control,
            endpoint: 0,
            data: vec![0x4F, 0xFC, 0x00],
        }]
    );
    assert!(h.backend.complete(0, TransferStatus::Completed, &[]));
    assert_eq!(h.reply(&command), 3);
}

#[test]
fn test_fake_event_truncated_to_guest_buffer() {
    let h = Harness::open(PassthroughConfig::default());
    h.command(&[0x05, 0x10, 0x00]);

    let poll = h.guest.interrupt_request(EVENT_ENDPOINT, 4).unwrap();
    assert_eq!(h.bt.handle_request(&poll), RequestOutcome::NoReply);
    assert_eq!(h.reply(&poll), 4);
    assert_eq!(h.guest_data(&poll, 4), vec![0x0E, 0x0B, 0x01, 0x05]);
}

// ============================================================================
// Link keys
// ============================================================================

#[test]
fn test_delete_one_mirrored_and_forwarded() {
    let h = Harness::open(config_with_keys(&format!("{},{}", KEY_A, KEY_B)));
    let addr: BdAddr = "00:11:22:33:44:55".parse().unwrap();
    let packet = DeleteStoredLinkKey::One(addr).encode();

    let command = h.command(&packet);
    assert_eq!(h.bt.link_keys().len(), 1);
    assert!(h.bt.link_keys().get(&addr).is_none());

    assert_eq!(h.backend.submitted()[0].data, packet);
    assert!(h.backend.complete(0, TransferStatus::Completed, &[]));
    assert_eq!(h.reply(&command), packet.len() as i32);
}

#[test]
fn test_delete_all_mirrored() {
    let h = Harness::open(config_with_keys(&format!("{},{}", KEY_A, KEY_B)));
    h.command(&DeleteStoredLinkKey::All.encode());
    assert!(h.bt.link_keys().is_empty());
}

#[test]
fn test_link_key_notification_learned() {
    let h = Harness::open(PassthroughConfig::default());
    let addr = BdAddr([1, 2, 3, 4, 5, 6]);
    let key = LinkKey([0x42; 16]);

    let poll = h.poll();
    h.deliver_event(&poll, &link_key_notification(addr, key));

    assert_eq!(h.bt.link_keys().get(&addr), Some(key));
}

#[test]
fn test_keys_restored_after_reset() {
    let h = Harness::open(config_with_keys(KEY_A));

    let poll = h.poll();
    h.deliver_event(&poll, &[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
    assert!(h.backend.commands().is_empty());

    // The refill happens before the next guest request reaches the adapter
    h.poll();
    let keys = h.bt.link_keys().snapshot();
    let (write, written) =
        hci::write_stored_link_keys(keys.iter().map(|(a, k)| (a, k))).unwrap();
    assert_eq!(written, 1);

    let traffic = h.backend.traffic();
    assert_eq!(traffic.len(), 4);
    assert!(matches!(traffic[0], AdapterTraffic::Transfer(_)));
    assert_eq!(
        traffic[1],
        AdapterTraffic::Command(DeleteStoredLinkKey::All.encode())
    );
    assert_eq!(traffic[2], AdapterTraffic::Command(write));
    assert!(matches!(traffic[3], AdapterTraffic::Transfer(_)));

    // Once per reset
    h.poll();
    assert_eq!(h.backend.commands().len(), 2);
}

#[test]
fn test_integrated_module_keeps_keys_across_reset() {
    let h = Harness::open_integrated(config_with_keys(KEY_A));
    let poll = h.poll();
    h.deliver_event(&poll, &[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
    h.poll();
    assert!(h.backend.commands().is_empty());
}

// ============================================================================
// Sync button
// ============================================================================

#[test]
fn test_short_press_emits_one_event() {
    let h = Harness::open(PassthroughConfig::default());

    h.host.set_button(Some(true));
    h.poll();
    assert_eq!(h.backend.submitted().len(), 1);

    h.host.set_button(Some(false));
    let poll = h.poll();
    assert_eq!(h.reply(&poll), 3);
    assert_eq!(h.guest_data(&poll, 3), vec![0xFF, 0x01, 0x08]);
    assert_eq!(h.host.messages(), vec!["Scanning for Wii Remotes".to_string()]);

    h.poll();
    assert_eq!(h.backend.submitted().len(), 2);
}

#[test]
fn test_long_press_emits_one_event() {
    let mut config = PassthroughConfig::default();
    config.bluetooth.sync_button_hold_ms = 0;
    let h = Harness::open(config);

    h.host.set_button(Some(true));
    let poll = h.poll();
    assert_eq!(h.reply(&poll), 3);
    assert_eq!(h.guest_data(&poll, 3), vec![0xFF, 0x01, 0x09]);
    assert_eq!(
        h.host.messages(),
        vec!["Reset saved Wii Remote pairings".to_string()]
    );

    // Still held: nothing more until the button is released
    h.poll();
    h.host.set_button(Some(false));
    h.poll();
    assert_eq!(h.backend.submitted().len(), 2);
}

#[test]
fn test_triggered_press() {
    let h = Harness::open(PassthroughConfig::default());
    h.bt.trigger_sync_button_pressed();

    let poll = h.poll();
    assert_eq!(h.guest_data(&poll, 3), vec![0xFF, 0x01, 0x08]);
    assert!(h.backend.submitted().is_empty());
}

// ============================================================================
// Failures and teardown
// ============================================================================

#[test]
fn test_failure_message_once_per_streak() {
    let h = Harness::open(PassthroughConfig::default());

    let poll = h.poll();
    assert!(h.backend.complete(EVENT_ENDPOINT, TransferStatus::Stall, &[]));
    assert_eq!(h.reply(&poll), 0);
    assert_eq!(
        h.host.messages(),
        vec![
            "Failed to transfer to or from to the Bluetooth adapter.".to_string(),
            "It may not be compatible with passthrough mode.".to_string(),
        ]
    );

    let poll = h.poll();
    assert!(h.backend.complete(EVENT_ENDPOINT, TransferStatus::Error, &[]));
    h.reply(&poll);
    assert_eq!(h.host.messages().len(), 2);

    let poll = h.poll();
    h.deliver_event(&poll, &[0x0E, 0x04, 0x01, 0x00, 0x00, 0x00]);
    let command = h.command(&[0x01, 0x04, 0x00]);
    assert!(h.backend.complete(0, TransferStatus::Stall, &[]));
    h.reply(&command);
    assert_eq!(h.host.messages().len(), 4);
    assert_eq!(
        h.host.messages()[2],
        "Failed to send a command to the Bluetooth adapter."
    );
}

#[test]
fn test_close_answers_pending_requests() {
    let mut h = Harness::open(PassthroughConfig::default());
    let poll = h.poll();
    let bulk = h.guest.bulk_in_request(ACL_IN, 32).unwrap();
    assert_eq!(h.bt.handle_request(&bulk), RequestOutcome::NoReply);
    assert_eq!(h.bt.pending_transfers(), 2);

    h.bt.close();

    assert_eq!(h.replies.for_request(poll.address), vec![0]);
    assert_eq!(h.replies.for_request(bulk.address), vec![0]);
    assert_eq!(h.bt.pending_transfers(), 0);
    assert_eq!(h.backend.release_count(), 1);
    assert_eq!(h.backend.close_count(), 1);
    assert!(h.host.messages().is_empty());

    assert_eq!(
        h.bt.handle_request(&poll),
        RequestOutcome::Reply(return_codes::IPC_ENOENT)
    );

    h.bt.close();
    assert_eq!(h.backend.close_count(), 1);
}

#[test]
fn test_every_request_answered_once() {
    let mut h = Harness::open(PassthroughConfig::default());
    let requests: Vec<IoctlvRequest> = (0..8).map(|_| h.poll()).collect();
    assert!(h.backend.wait_for_pending(8, DEFAULT_TEST_TIMEOUT));

    for _ in 0..3 {
        assert!(h.backend.complete(EVENT_ENDPOINT, TransferStatus::TimedOut, &[]));
    }
    h.bt.close();

    for request in &requests {
        assert_eq!(h.replies.for_request(request.address).len(), 1);
    }
    let addresses: Vec<RequestAddr> = h.replies.all().into_iter().map(|(a, _)| a).collect();
    assert_eq!(addresses.len(), requests.len());
}

#[test]
fn test_shutdown_resets_adapter_and_saves_keys() {
    let mut h = Harness::open(PassthroughConfig::default());
    let addr = BdAddr([1, 2, 3, 4, 5, 6]);
    let key = LinkKey([0x42; 16]);
    let poll = h.poll();
    h.deliver_event(&poll, &link_key_notification(addr, key));

    h.bt.shutdown();

    assert_eq!(h.backend.commands(), vec![hci::command::reset()]);
    assert!(!h.bt.is_open());
    assert_eq!(
        h.bt.config().bluetooth.link_keys,
        format!("{}={}", addr, key)
    );

    h.bt.shutdown();
    assert_eq!(h.backend.commands().len(), 1);
}

// ============================================================================
// Save states
// ============================================================================

#[test]
fn test_state_round_trip_warns() {
    let h = Harness::open(PassthroughConfig::default());
    let state = h.bt.save_state().unwrap();
    assert!(h.bt.restore_state(&state).is_ok());
    assert_eq!(
        h.host.alerts(),
        vec!["Attempted to load a state. Bluetooth will likely be broken now.".to_string()]
    );
}

#[test]
fn test_corrupt_state_aborts_load() {
    let h = Harness::open(PassthroughConfig::default());
    assert!(matches!(
        h.bt.restore_state(&[0xde, 0xad]),
        Err(PassthroughError::RestoreAborted(_))
    ));
    assert_eq!(h.host.alerts().len(), 1);
}
