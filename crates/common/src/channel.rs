//! Completion queue between USB backends and the completion worker thread
//!
//! Backends push [`Completion`]s from whichever thread finished the transfer;
//! the worker blocks on [`CompletionReceiver::recv`] and runs the completion
//! handler inline. Closing the queue wakes the worker once every queued
//! completion has been drained.

use crate::usb_types::Completion;
use async_channel::{Receiver, Sender, unbounded};

/// Producer side, held by USB backends
#[derive(Clone)]
pub struct CompletionSender {
    tx: Sender<Completion>,
}

impl CompletionSender {
    /// Queue a completion (never blocks: the queue is unbounded)
    pub fn send(&self, completion: Completion) -> Result<(), Completion> {
        self.tx.send_blocking(completion).map_err(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, held by the completion worker
#[derive(Clone)]
pub struct CompletionReceiver {
    rx: Receiver<Completion>,
}

impl CompletionReceiver {
    /// Block until a completion arrives.
    ///
    /// Fails once the queue is closed and empty.
    pub fn recv(&self) -> crate::Result<Completion> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Close the queue. Queued completions remain receivable; further sends fail.
    pub fn close(&self) -> bool {
        self.rx.close()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the completion queue
///
/// Returns (CompletionSender for backends, CompletionReceiver for the worker)
pub fn create_completion_queue() -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = unbounded();
    (CompletionSender { tx }, CompletionReceiver { rx })
}
