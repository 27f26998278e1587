//! HCI interceptor and reply faker
//!
//! Sits between the guest and the adapter and patches the places where a
//! generic adapter does not behave like the module the guest's stack was
//! written for:
//!
//! - Read_Buffer_Size is answered locally with limits the guest can cope
//!   with; the stack underflows if the controller claims to buffer more than
//!   10 ACL packets.
//! - Two vendor commands only the integrated module understands are
//!   swallowed and acknowledged.
//! - Link keys the adapter learns are mirrored into the [`LinkKeyStore`], and
//!   pushed back into the adapter after it has been reset.

use crate::link_keys::LinkKeyStore;
use crate::notify::OneShotFlag;
use common::{AdapterHandle, HCI_EVENT_ENDPOINT, UsbError};
use hci::{DeleteStoredLinkKey, InboundEvent, opcodes};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Polls of the event endpoint before giving up on a Command_Complete
pub const COMMAND_COMPLETE_TRIES: usize = 100;

/// Timeout of each poll while waiting for a Command_Complete
pub const COMMAND_COMPLETE_POLL: Duration = Duration::from_millis(20);

const EVENT_BUFFER_LEN: usize = 1024;

/// What to do with an outbound HCI command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    /// Send it to the adapter
    Forward,
    /// Keep it from the adapter; a fabricated reply has been armed
    Swallow,
}

pub struct Interceptor {
    keys: Arc<LinkKeyStore>,
    integrated: AtomicBool,
    fake_read_buffer_size: OneShotFlag,
    fake_vendor_reply: OneShotFlag,
    vendor_opcode: AtomicU16,
    need_key_reset: OneShotFlag,
}

impl Interceptor {
    pub fn new(keys: Arc<LinkKeyStore>) -> Self {
        Self {
            keys,
            integrated: AtomicBool::new(false),
            fake_read_buffer_size: OneShotFlag::new(),
            fake_vendor_reply: OneShotFlag::new(),
            vendor_opcode: AtomicU16::new(0),
            need_key_reset: OneShotFlag::new(),
        }
    }

    pub fn keys(&self) -> &Arc<LinkKeyStore> {
        &self.keys
    }

    /// Whether the open adapter is the vendor's own module
    pub fn set_integrated(&self, integrated: bool) {
        self.integrated.store(integrated, Ordering::SeqCst);
    }

    pub fn is_integrated(&self) -> bool {
        self.integrated.load(Ordering::SeqCst)
    }

    /// Inspect a guest command before it reaches the adapter
    pub fn inspect_command(&self, packet: &[u8]) -> CommandAction {
        let opcode = match hci::command_opcode(packet) {
            Ok(opcode) => opcode,
            Err(e) => {
                debug!("Forwarding unparseable command: {}", e);
                return CommandAction::Forward;
            }
        };

        if opcode == opcodes::READ_BUFFER_SIZE {
            debug!("Intercepted Read_Buffer_Size, reply will be faked");
            self.fake_read_buffer_size.set();
            return CommandAction::Swallow;
        }

        if !self.is_integrated() && opcodes::FAKED_VENDOR_COMMANDS.contains(&opcode) {
            debug!("Intercepted vendor command {:#06x}, reply will be faked", opcode);
            self.vendor_opcode.store(opcode, Ordering::SeqCst);
            self.fake_vendor_reply.set();
            return CommandAction::Swallow;
        }

        if opcode == opcodes::DELETE_STORED_LINK_KEY {
            match DeleteStoredLinkKey::parse(packet) {
                Ok(command) => self.keys.apply_delete(command),
                Err(e) => warn!("Malformed Delete_Stored_Link_Key from guest: {}", e),
            }
        } else if opcodes::ogf(opcode) == opcodes::OGF_VENDOR {
            debug!("Forwarding vendor command {:#06x}", opcode);
        }

        CommandAction::Forward
    }

    /// Fabricated event owed to the guest's next interrupt poll, if any
    pub fn take_fake_reply(&self) -> Option<Vec<u8>> {
        if self.fake_read_buffer_size.test_and_clear() {
            info!("Faking Read_Buffer_Size reply");
            return Some(hci::fake_read_buffer_size_reply());
        }
        if self.fake_vendor_reply.test_and_clear() {
            let opcode = self.vendor_opcode.load(Ordering::SeqCst);
            info!("Faking reply to vendor command {:#06x}", opcode);
            return Some(hci::fake_vendor_command_reply(opcode));
        }
        None
    }

    /// Inspect an event the adapter delivered on the event endpoint
    pub fn inspect_event(&self, packet: &[u8]) {
        match InboundEvent::parse(packet) {
            Ok(InboundEvent::LinkKeyNotification { addr, key }) => {
                self.keys.insert(addr, key);
            }
            Ok(event) if event.is_command_complete_for(opcodes::RESET) => {
                debug!("Adapter was reset, stored link keys need restoring");
                self.need_key_reset.set();
            }
            Ok(_) => {}
            Err(e) => debug!("Unparseable event from adapter: {}", e),
        }
    }

    /// Consume a pending key reset. Never fires for the integrated module,
    /// which keeps its keys across resets.
    pub fn take_key_reset(&self) -> bool {
        !self.is_integrated() && self.need_key_reset.test_and_clear()
    }

    /// Refill the adapter's key storage from the store.
    ///
    /// Deletes everything the adapter holds, then writes the store's keys.
    /// Write failures and missing acknowledgements are logged and tolerated.
    pub fn resync_keys(&self, adapter: &dyn AdapterHandle, timeout: Duration) {
        info!("Restoring link keys on the adapter");
        let delete_all = DeleteStoredLinkKey::All.encode();
        if send_command(adapter, &delete_all, timeout) {
            wait_for_command_complete(adapter, opcodes::DELETE_STORED_LINK_KEY);
        }

        let keys = self.keys.snapshot();
        let Some((packet, written)) = hci::write_stored_link_keys(keys.iter().map(|(a, k)| (a, k)))
        else {
            return;
        };
        if written < keys.len() {
            warn!(
                "Only {} of {} link keys fit in one command, the rest were not restored",
                written,
                keys.len()
            );
        }
        if send_command(adapter, &packet, timeout) {
            wait_for_command_complete(adapter, opcodes::WRITE_STORED_LINK_KEY);
        }
    }
}

/// Write an HCI command synchronously. Returns false (logged) on failure.
pub fn send_command(adapter: &dyn AdapterHandle, packet: &[u8], timeout: Duration) -> bool {
    match adapter.write_command(packet, timeout) {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to send HCI command {:02x?}: {}", &packet[..packet.len().min(2)], e);
            false
        }
    }
}

/// Poll the event endpoint until the Command_Complete for `opcode` shows up.
///
/// Gives up after [`COMMAND_COMPLETE_TRIES`] polls. Events read here are not
/// forwarded to the guest.
pub fn wait_for_command_complete(adapter: &dyn AdapterHandle, opcode: u16) -> bool {
    let mut buffer = vec![0u8; EVENT_BUFFER_LEN];
    for _ in 0..COMMAND_COMPLETE_TRIES {
        match adapter.read_event(&mut buffer, COMMAND_COMPLETE_POLL) {
            Ok(len) => {
                let matched = InboundEvent::parse(&buffer[..len])
                    .map(|event| event.is_command_complete_for(opcode))
                    .unwrap_or(false);
                if matched {
                    return true;
                }
            }
            Err(UsbError::NoDevice) => break,
            Err(UsbError::Timeout) => {}
            Err(e) => debug!("Polling endpoint {:#04x} failed: {}", HCI_EVENT_ENDPOINT, e),
        }
    }
    warn!("No Command_Complete for {:#06x} from the adapter", opcode);
    false
}
