//! HCI packet integration tests
//!
//! Covers the text forms used for persisted keys and the packets the
//! passthrough builds or inspects.
//!
//! Run with: `cargo test -p hci --test packet_tests`

use hci::{
    BdAddr, COMMAND_HEADER_LEN, DeleteStoredLinkKey, InboundEvent, LinkKey, MAX_KEYS_PER_WRITE,
    command_opcode, command_parameters, fake_vendor_command_reply, opcodes,
    write_stored_link_keys,
};
use proptest::prelude::*;

// ============================================================================
// Text forms
// ============================================================================

proptest! {
    #[test]
    fn prop_bdaddr_text_round_trip(bytes in any::<[u8; 6]>()) {
        let addr = BdAddr(bytes);
        let parsed: BdAddr = addr.to_string().parse().unwrap();
        prop_assert_eq!(parsed, addr);
    }

    #[test]
    fn prop_link_key_text_round_trip(bytes in any::<[u8; 16]>()) {
        let key = LinkKey(bytes);
        let parsed: LinkKey = key.to_string().parse().unwrap();
        prop_assert_eq!(parsed, key);
    }

    #[test]
    fn prop_link_key_parse_never_panics(s in "\\PC{0,40}") {
        let _ = s.parse::<LinkKey>();
    }

    #[test]
    fn prop_delete_one_round_trip(bytes in any::<[u8; 6]>()) {
        let cmd = DeleteStoredLinkKey::One(BdAddr(bytes));
        prop_assert_eq!(DeleteStoredLinkKey::parse(&cmd.encode()).unwrap(), cmd);
    }
}

#[test]
fn test_uppercase_hex_accepted() {
    let addr: BdAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();
    assert_eq!(addr.to_string(), "aa:bb:cc:dd:ee:ff");
}

// ============================================================================
// Packets
// ============================================================================

#[test]
fn test_write_stored_keys_parameters_match_header() {
    let keys: Vec<(BdAddr, LinkKey)> = (0..3u8)
        .map(|i| (BdAddr([i; 6]), LinkKey([i; 16])))
        .collect();
    let (packet, written) = write_stored_link_keys(keys.iter().map(|(a, k)| (a, k))).unwrap();
    assert_eq!(written, 3);
    assert_eq!(command_opcode(&packet).unwrap(), opcodes::WRITE_STORED_LINK_KEY);
    let params = command_parameters(&packet).unwrap();
    assert_eq!(params.len(), packet[2] as usize);
    assert_eq!(params.len(), packet.len() - COMMAND_HEADER_LEN);
}

#[test]
fn test_write_stored_keys_never_exceeds_cap() {
    let keys: Vec<(BdAddr, LinkKey)> = (0..=255u8)
        .map(|i| (BdAddr([i; 6]), LinkKey([i; 16])))
        .collect();
    let (packet, written) = write_stored_link_keys(keys.iter().map(|(a, k)| (a, k))).unwrap();
    assert_eq!(written, MAX_KEYS_PER_WRITE);
    assert_eq!(packet[3] as usize, MAX_KEYS_PER_WRITE);
}

#[test]
fn test_vendor_reply_is_command_complete() {
    for opcode in opcodes::FAKED_VENDOR_COMMANDS {
        let event = InboundEvent::parse(&fake_vendor_command_reply(opcode)).unwrap();
        assert!(event.is_command_complete_for(opcode));
    }
}
