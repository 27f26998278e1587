//! Bluetooth HCI passthrough
//!
//! Hands a physical USB Bluetooth adapter on the host to an emulated guest.
//! Guest USB V0 requests become asynchronous transfers on the adapter, their
//! completions become guest replies. A few HCI exchanges are intercepted on
//! the way so that generic adapters behave like the guest's own module.
//!
//! # Example
//!
//! ```no_run
//! use common::{HostServices, LoopbackGuest, RequestAddr};
//! use passthrough::{BluetoothPassthrough, Environment, PassthroughConfig, RusbBackend};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Console;
//!
//! impl HostServices for Console {
//!     fn display_message(&self, message: &str, _duration: Duration) {
//!         println!("{}", message);
//!     }
//!     fn alert(&self, message: &str) {
//!         eprintln!("{}", message);
//!     }
//!     fn stop_execution(&self) {}
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let guest = Arc::new(LoopbackGuest::new(64 * 1024));
//! let env = Environment {
//!     memory: guest.clone(),
//!     replies: Arc::new(|request: RequestAddr, value: i32| {
//!         println!("{:#010x} -> {}", request.0, value);
//!     }),
//!     host: Arc::new(Console),
//! };
//!
//! let mut bt = BluetoothPassthrough::new(
//!     PassthroughConfig::default(),
//!     Arc::new(RusbBackend::new()?),
//!     env,
//! );
//! bt.open()?;
//! let poll = guest.interrupt_request(0x81, 64)?;
//! bt.handle_request(&poll);
//! bt.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod interceptor;
pub mod link_keys;
pub mod notify;
pub mod request;
pub mod state;
pub mod sync_button;
pub mod usb;
pub mod worker;

pub use config::PassthroughConfig;
pub use connection::{Connection, INTEGRATED_MODULE, eligible_candidates};
pub use dispatcher::{Dispatcher, Environment, RequestOutcome, Timeouts};
pub use error::{PassthroughError, Result, return_codes};
pub use link_keys::LinkKeyStore;
pub use sync_button::{SyncButton, SyncButtonEvent, SyncButtonState};
pub use usb::RusbBackend;

use crate::interceptor::{Interceptor, send_command, wait_for_command_complete};
use crate::worker::CompletionWorker;
use common::{IoctlvRequest, UsbBackend, create_completion_queue};
use hci::opcodes;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const NO_ADAPTER_ALERT: &str =
    "Bluetooth passthrough mode is enabled, but no usable Bluetooth USB device was found. Aborting.";

/// The adapter connection together with the thread serving its completions
struct Session {
    connection: Connection,
    worker: CompletionWorker,
}

/// The passthrough device
///
/// Owns the configuration, the link-key table and, while open, the adapter
/// connection. Dropping it runs [`BluetoothPassthrough::shutdown`].
pub struct BluetoothPassthrough {
    config: PassthroughConfig,
    backend: Arc<dyn UsbBackend>,
    env: Environment,
    sync_button: Arc<SyncButton>,
    core: Arc<Dispatcher>,
    session: Option<Session>,
    shut_down: bool,
}

impl BluetoothPassthrough {
    /// Create a closed passthrough device. Link keys are loaded from the
    /// configuration.
    pub fn new(config: PassthroughConfig, backend: Arc<dyn UsbBackend>, env: Environment) -> Self {
        let keys = Arc::new(LinkKeyStore::load(&config.bluetooth.link_keys));
        debug!("Loaded {} link key(s) from configuration", keys.len());

        let sync_button = Arc::new(SyncButton::new(config.bluetooth.sync_button_hold()));
        let timeouts = Timeouts {
            transfer: config.bluetooth.transfer_timeout(),
            control: config.bluetooth.control_timeout(),
        };
        let core = Arc::new(Dispatcher::new(
            env.clone(),
            Interceptor::new(keys),
            sync_button.clone(),
            timeouts,
        ));

        Self {
            config,
            backend,
            env,
            sync_button,
            core,
            session: None,
            shut_down: false,
        }
    }

    /// Find, open and claim an adapter and start serving completions.
    ///
    /// When no adapter can be opened the user is alerted and emulation is
    /// stopped. Does nothing if already open.
    pub fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let (completions, receiver) = create_completion_queue();
        let connection = match Connection::open(
            self.backend.as_ref(),
            self.config.device_override(),
            &completions,
            self.env.host.as_ref(),
        ) {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to open a Bluetooth adapter: {}", e);
                self.env.host.alert(NO_ADAPTER_ALERT);
                self.env.host.stop_execution();
                return Err(e);
            }
        };
        // The adapter holds its own sender; the queue disconnects once it closes.
        drop(completions);

        self.core
            .interceptor()
            .set_integrated(connection.is_integrated());

        let worker = match CompletionWorker::spawn(receiver, self.core.clone()) {
            Ok(worker) => worker,
            Err(e) => {
                error!("Failed to spawn completion worker: {}", e);
                connection.close();
                return Err(common::Error::from(e).into());
            }
        };

        info!("Bluetooth passthrough open on {}", connection.candidate());
        self.session = Some(Session { connection, worker });
        Ok(())
    }

    /// Close the adapter.
    ///
    /// Outstanding transfers are cancelled and every pending guest request
    /// receives exactly one reply before this returns. Idempotent.
    pub fn close(&mut self) {
        let Some(Session {
            connection,
            mut worker,
        }) = self.session.take()
        else {
            return;
        };

        connection.close();
        worker.stop();
        self.core.abandon_pending();
        info!("Bluetooth passthrough closed");
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Handle one USB V0 IO-control-vector request from the guest
    pub fn handle_request(&self, request: &IoctlvRequest) -> RequestOutcome {
        match &self.session {
            Some(session) => self.core.dispatch(request, session.connection.adapter()),
            None => {
                warn!(
                    "Request {:#010x} while the adapter is closed",
                    request.address.0
                );
                RequestOutcome::Reply(PassthroughError::NotOpen.return_code())
            }
        }
    }

    /// Serialize the device's save-state record
    pub fn save_state(&self) -> Result<Vec<u8>> {
        state::save_state()
    }

    /// Check a save-state record being loaded; an error aborts the load
    pub fn restore_state(&self, bytes: &[u8]) -> Result<()> {
        state::restore_state(bytes, self.env.host.as_ref())
    }

    /// Fake a short sync-button press on the next interrupt poll
    pub fn trigger_sync_button_pressed(&self) {
        self.sync_button.trigger_pressed();
    }

    /// Fake a long sync-button hold on the next interrupt poll
    pub fn trigger_sync_button_held(&self) {
        self.sync_button.trigger_held();
    }

    /// Feed the live state of the sync button; call once per emulated tick
    pub fn update_sync_button_state(&self, held: bool) {
        self.sync_button.update(held);
    }

    pub fn sync_button(&self) -> Arc<SyncButton> {
        self.sync_button.clone()
    }

    pub fn link_keys(&self) -> &LinkKeyStore {
        self.core.interceptor().keys()
    }

    /// The link-key table in its configuration text form
    pub fn save_link_keys(&self) -> String {
        self.link_keys().save()
    }

    pub fn pending_transfers(&self) -> usize {
        self.core.pending_count()
    }

    /// Configuration, including the link keys written back by `shutdown`
    pub fn config(&self) -> &PassthroughConfig {
        &self.config
    }

    /// Final teardown.
    ///
    /// Resets the adapter and waits for the reset to complete, closes it, then
    /// writes the link-key table back into the configuration. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Some(session) = &self.session {
            let adapter = session.connection.adapter();
            if send_command(adapter, &hci::command::reset(), self.core.timeouts().control)
                && wait_for_command_complete(adapter, opcodes::RESET)
            {
                info!("Sent a reset command to adapter");
            }
        }

        self.close();
        self.config.bluetooth.link_keys = self.save_link_keys();
        debug!("Saved {} link key(s) to configuration", self.link_keys().len());
    }
}

impl Drop for BluetoothPassthrough {
    fn drop(&mut self) {
        self.shutdown();
    }
}
