//! Transfer dispatcher
//!
//! Turns decoded guest requests into asynchronous adapter transfers and
//! turns their completions back into guest replies. Requests answered by the
//! interceptor or the sync button never reach the adapter.
//!
//! Each submitted transfer carries a [`Ticket`] for its [`PendingTransfer`]
//! record. The record is reclaimed exactly once: by the completion handler,
//! by a refused submission, or by [`Dispatcher::abandon_pending`] at teardown.

use crate::error::Result;
use crate::interceptor::{CommandAction, Interceptor};
use crate::notify::FailureNotifier;
use crate::request::{ControlMessage, EndpointMessage, UsbV0Request};
use crate::sync_button::SyncButton;
use common::{
    AdapterHandle, Completion, CompletionHandler, GuestAddr, GuestMemory, HCI_EVENT_ENDPOINT,
    HostServices, IoctlvRequest, ReplySink, RequestAddr, Ticket, TicketRegistry, Transfer,
    TransferKind, TransferStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const SYNC_MESSAGE_DURATION: Duration = Duration::from_secs(2);

/// The emulator collaborators the passthrough talks to
#[derive(Clone)]
pub struct Environment {
    pub memory: Arc<dyn GuestMemory>,
    pub replies: Arc<dyn ReplySink>,
    pub host: Arc<dyn HostServices>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Interrupt and bulk transfers
    pub transfer: Duration,
    /// Control transfers and synchronous HCI commands
    pub control: Duration,
}

/// Immediate answer to a guest request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The reply will arrive later through the reply sink
    NoReply,
    /// Reply right away with this return value
    Reply(i32),
}

/// Correlates one in-flight transfer with the guest request it serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransfer {
    pub request: RequestAddr,
    pub data_address: GuestAddr,
    pub length: u16,
    pub kind: TransferKind,
    pub is_in: bool,
}

pub struct Dispatcher {
    env: Environment,
    interceptor: Interceptor,
    sync_button: Arc<SyncButton>,
    failures: FailureNotifier,
    pending: TicketRegistry<PendingTransfer>,
    timeouts: Timeouts,
}

impl Dispatcher {
    pub fn new(
        env: Environment,
        interceptor: Interceptor,
        sync_button: Arc<SyncButton>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            env,
            interceptor,
            sync_button,
            failures: FailureNotifier::new(),
            pending: TicketRegistry::new(),
            timeouts,
        }
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Transfers submitted and not yet completed
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Handle one guest request against the open adapter
    pub fn dispatch(&self, request: &IoctlvRequest, adapter: &dyn AdapterHandle) -> RequestOutcome {
        // Before anything else goes out, so the guest never sees the refill.
        if self.interceptor.take_key_reset() {
            self.interceptor.resync_keys(adapter, self.timeouts.control);
        }

        let result = UsbV0Request::decode(request, self.env.memory.as_ref()).and_then(|decoded| {
            match decoded {
                UsbV0Request::Control(message) => {
                    self.dispatch_control(request.address, message, adapter)
                }
                UsbV0Request::Interrupt(message) => {
                    self.dispatch_interrupt(request.address, message, adapter);
                    Ok(())
                }
                UsbV0Request::Bulk(message) => self.dispatch_bulk(request.address, message, adapter),
            }
        });

        match result {
            Ok(()) => RequestOutcome::NoReply,
            Err(e) => {
                warn!("Rejecting request {:#010x}: {}", request.address.0, e);
                RequestOutcome::Reply(e.return_code())
            }
        }
    }

    fn dispatch_control(
        &self,
        address: RequestAddr,
        message: ControlMessage,
        adapter: &dyn AdapterHandle,
    ) -> Result<()> {
        let is_in = message.setup.is_in();
        let buffer = if is_in {
            vec![0; message.length as usize]
        } else {
            let packet = message.read_packet(self.env.memory.as_ref())?;
            if self.interceptor.inspect_command(&packet) == CommandAction::Swallow {
                // acknowledged as if the adapter had accepted it
                self.env.replies.enqueue_reply(address, packet.len() as i32);
                return Ok(());
            }
            packet
        };

        let record = PendingTransfer {
            request: address,
            data_address: message.data_address,
            length: message.length,
            kind: TransferKind::Control,
            is_in,
        };
        let timeout = self.timeouts.control;
        self.submit(adapter, record, |ticket| {
            Transfer::control(ticket, message.setup, buffer, timeout)
        });
        Ok(())
    }

    fn dispatch_interrupt(
        &self,
        address: RequestAddr,
        message: EndpointMessage,
        adapter: &dyn AdapterHandle,
    ) {
        if let Some(held) = self.env.host.sync_button_held() {
            self.sync_button.update(held);
        }

        if let Some(event) = self.sync_button.take_event() {
            info!(
                "Faking 'sync button {:?}' ({:#04x}) event packet",
                event,
                event.payload()
            );
            self.env
                .host
                .display_message(event.message(), SYNC_MESSAGE_DURATION);
            self.reply_with_event(address, &message, &hci::fake_sync_button_event(event.payload()));
            return;
        }

        if let Some(packet) = self.interceptor.take_fake_reply() {
            self.reply_with_event(address, &message, &packet);
            return;
        }

        let record = PendingTransfer {
            request: address,
            data_address: message.data_address,
            length: message.length,
            kind: TransferKind::Interrupt,
            is_in: message.is_in(),
        };
        let timeout = self.timeouts.transfer;
        self.submit(adapter, record, |ticket| {
            Transfer::interrupt(ticket, message.endpoint, vec![0; message.length as usize], timeout)
        });
    }

    fn dispatch_bulk(
        &self,
        address: RequestAddr,
        message: EndpointMessage,
        adapter: &dyn AdapterHandle,
    ) -> Result<()> {
        let is_in = message.is_in();
        let buffer = if is_in {
            vec![0; message.length as usize]
        } else {
            message.read_payload(self.env.memory.as_ref())?
        };

        let record = PendingTransfer {
            request: address,
            data_address: message.data_address,
            length: message.length,
            kind: TransferKind::Bulk,
            is_in,
        };
        let timeout = self.timeouts.transfer;
        self.submit(adapter, record, |ticket| {
            Transfer::bulk(ticket, message.endpoint, buffer, timeout)
        });
        Ok(())
    }

    fn submit<F>(&self, adapter: &dyn AdapterHandle, record: PendingTransfer, build: F)
    where
        F: FnOnce(Ticket) -> Transfer,
    {
        let ticket = self.pending.issue(record);
        trace!(
            "Submitting {:?} transfer {} for request {:#010x}",
            record.kind,
            ticket.id(),
            record.request.0
        );
        if let Err(refused) = adapter.submit(build(ticket)) {
            warn!(
                "Adapter refused {:?} transfer: {}",
                refused.transfer.kind, refused.reason
            );
            if let Some(record) = self.pending.redeem(refused.transfer.ticket) {
                self.env.replies.enqueue_reply(record.request, 0);
            }
        }
    }

    /// Answer an interrupt poll with a fabricated event
    fn reply_with_event(&self, address: RequestAddr, message: &EndpointMessage, packet: &[u8]) {
        let len = packet.len().min(message.length as usize);
        if len < packet.len() {
            warn!(
                "Guest buffer of {} bytes truncates a {} byte event",
                message.length,
                packet.len()
            );
        }
        let value = match self
            .env
            .memory
            .copy_to_guest(message.data_address, &packet[..len])
        {
            Ok(()) => len as i32,
            Err(e) => {
                error!("Failed to write fabricated event to the guest: {}", e);
                crate::error::return_codes::IPC_EINVAL
            }
        };
        self.env.replies.enqueue_reply(address, value);
    }

    /// Answer every request whose transfer will never complete.
    ///
    /// Called after the adapter has been closed and the completion worker has
    /// drained the queue, so anything left has been lost by the backend.
    pub fn abandon_pending(&self) {
        for (id, record) in self.pending.drain() {
            warn!(
                "Transfer {} for request {:#010x} never completed",
                id, record.request.0
            );
            self.env.replies.enqueue_reply(record.request, 0);
        }
    }
}

impl CompletionHandler for Dispatcher {
    fn on_completion(&self, completion: Completion) {
        let Completion {
            ticket,
            kind,
            endpoint,
            status,
            buffer,
            actual_length,
        } = completion;

        let id = ticket.id();
        let Some(record) = self.pending.redeem(ticket) else {
            debug!("Completion for abandoned transfer {}", id);
            return;
        };

        self.failures.record(kind, status, self.env.host.as_ref());

        let data = &buffer[..actual_length.min(buffer.len())];
        let mut value = data.len() as i32;
        if record.is_in && !data.is_empty() {
            let len = data.len().min(record.length as usize);
            if let Err(e) = self.env.memory.copy_to_guest(record.data_address, &data[..len]) {
                error!("Failed to copy {} bytes to the guest: {}", len, e);
                value = crate::error::return_codes::IPC_EINVAL;
            }
        }

        if status == TransferStatus::Completed
            && kind == TransferKind::Interrupt
            && endpoint == HCI_EVENT_ENDPOINT
        {
            self.interceptor.inspect_event(data);
        }

        trace!(
            "Transfer {} finished with {:?}, replying {} to {:#010x}",
            id, status, value, record.request.0
        );
        self.env.replies.enqueue_reply(record.request, value);
    }
}
