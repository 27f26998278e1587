//! Per-endpoint transfer lanes
//!
//! rusb only offers blocking transfers, so each (transfer type, endpoint)
//! pair gets a lane: a thread that runs the lane's transfers one after the
//! other and pushes each completion to the completion queue. Transfers on
//! different endpoints run concurrently, transfers on one endpoint complete
//! in submission order.

use crate::usb::transfers::execute_transfer;
use async_channel::{Sender, unbounded};
use common::{Completion, CompletionSender, SubmitError, Transfer, TransferKind, UsbError};
use rusb::{Context, DeviceHandle};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

type LaneKey = (TransferKind, u8);

struct Lane {
    queue: Sender<Transfer>,
    thread: JoinHandle<()>,
}

struct LaneSet {
    /// `None` once shut down, which drops the lanes' handle and completion sender
    open: Option<(Arc<DeviceHandle<Context>>, CompletionSender)>,
    lanes: HashMap<LaneKey, Lane>,
}

pub struct Lanes {
    cancelled: Arc<AtomicBool>,
    inner: Mutex<LaneSet>,
}

impl Lanes {
    pub fn new(handle: Arc<DeviceHandle<Context>>, completions: CompletionSender) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(LaneSet {
                open: Some((handle, completions)),
                lanes: HashMap::new(),
            }),
        }
    }

    /// Queue a transfer on its endpoint's lane, starting the lane if needed
    pub fn submit(&self, transfer: Transfer) -> Result<(), SubmitError> {
        let mut inner = self.lock();
        let Some((handle, completions)) = inner.open.clone() else {
            return Err(SubmitError {
                transfer,
                reason: UsbError::NoDevice,
            });
        };

        let key = (transfer.kind, transfer.endpoint);
        let lane = match inner.lanes.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match self.spawn_lane(key, handle, completions) {
                Ok(lane) => entry.insert(lane),
                Err(e) => {
                    error!("Failed to start transfer lane {:?}: {}", key, e);
                    return Err(SubmitError {
                        transfer,
                        reason: UsbError::Other {
                            message: e.to_string(),
                        },
                    });
                }
            },
        };

        lane.queue.send_blocking(transfer).map_err(|e| SubmitError {
            transfer: e.into_inner(),
            reason: UsbError::NoDevice,
        })
    }

    fn spawn_lane(
        &self,
        key: LaneKey,
        handle: Arc<DeviceHandle<Context>>,
        completions: CompletionSender,
    ) -> std::io::Result<Lane> {
        let (queue, transfers) = unbounded::<Transfer>();
        let cancelled = self.cancelled.clone();
        let (kind, endpoint) = key;

        let thread = std::thread::Builder::new()
            .name(format!("bt-usb-{:?}-{:02x}", kind, endpoint).to_lowercase())
            .spawn(move || {
                debug!("Transfer lane {:?} {:#04x} started", kind, endpoint);
                while let Ok(transfer) = transfers.recv_blocking() {
                    let completion = if cancelled.load(Ordering::SeqCst) {
                        Completion::cancelled(transfer)
                    } else {
                        execute_transfer(&handle, transfer)
                    };
                    if completions.send(completion).is_err() {
                        warn!("Completion queue closed, dropping lane {:?} {:#04x}", kind, endpoint);
                        break;
                    }
                }
                debug!("Transfer lane {:?} {:#04x} stopped", kind, endpoint);
            })?;

        Ok(Lane { queue, thread })
    }

    /// Stop every lane.
    ///
    /// Transfers already running finish (bounded by their timeout); transfers
    /// still queued complete as cancelled. Returns once all lanes have exited
    /// and every lane reference to the device handle and the completion
    /// sender has been dropped. Idempotent.
    pub fn shutdown(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let lanes: Vec<(LaneKey, Lane)> = {
            let mut inner = self.lock();
            inner.open = None;
            inner.lanes.drain().collect()
        };

        for (_, lane) in &lanes {
            lane.queue.close();
        }
        for (key, lane) in lanes {
            if let Err(e) = lane.thread.join() {
                error!("Transfer lane {:?} panicked: {:?}", key, e);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LaneSet> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Lanes {
    fn drop(&mut self) {
        self.shutdown();
    }
}
