//! Completion worker thread
//!
//! Dedicated thread that drains the completion queue and runs the completion
//! handler inline, one completion at a time. It exits once the queue has been
//! closed and everything already queued has been handled.

use common::{CompletionHandler, CompletionReceiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

pub struct CompletionWorker {
    receiver: CompletionReceiver,
    handle: Option<JoinHandle<()>>,
}

impl CompletionWorker {
    /// Spawn the worker thread
    pub fn spawn(
        receiver: CompletionReceiver,
        handler: Arc<dyn CompletionHandler>,
    ) -> std::io::Result<Self> {
        let thread_receiver = receiver.clone();
        let handle = std::thread::Builder::new()
            .name("bt-usb-completions".to_string())
            .spawn(move || run(thread_receiver, handler))?;

        Ok(Self {
            receiver,
            handle: Some(handle),
        })
    }

    /// Signal the worker to stop and wait for it.
    ///
    /// Completions already queued are still handled; later sends fail.
    /// Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        debug!(
            "Stopping completion worker ({} completion(s) queued)",
            self.receiver.len()
        );
        self.receiver.close();
        if let Err(e) = handle.join() {
            error!("Completion worker thread panicked: {:?}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for CompletionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(receiver: CompletionReceiver, handler: Arc<dyn CompletionHandler>) {
    info!("Completion worker started");

    while let Ok(completion) = receiver.recv() {
        // Keep the thread alive if a handler panics
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler.on_completion(completion)
        }));

        if let Err(e) = result {
            error!("Panic in completion handler: {:?}", e);
        }
    }

    info!("Completion worker stopped");
}
