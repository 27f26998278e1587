//! bt-passthrough
//!
//! Command-line harness for the Bluetooth passthrough. Opens a host USB
//! Bluetooth adapter, keeps an HCI event poll outstanding on an in-process
//! guest and logs every event that comes back until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use common::{
    GuestMemory, HCI_EVENT_ENDPOINT, HostServices, IoctlvRequest, LoopbackGuest, RequestAddr,
    UsbBackend, setup_logging,
};
use passthrough::{
    BluetoothPassthrough, Environment, PassthroughConfig, RequestOutcome, RusbBackend,
    eligible_candidates,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

const GUEST_MEMORY_SIZE: usize = 64 * 1024;
const EVENT_POLL_LENGTH: u16 = 1024;

#[derive(Parser, Debug)]
#[command(name = "bt-passthrough")]
#[command(
    author,
    version,
    about = "Bluetooth passthrough - Hand a host USB Bluetooth adapter to an emulated guest"
)]
#[command(long_about = "
Opens a host USB Bluetooth adapter the way the emulator's passthrough device
does and logs the HCI events it produces.

EXAMPLES:
    # Run with default config
    bt-passthrough

    # Show which adapter would be picked
    bt-passthrough --list

    # Start a pairing scan on open
    bt-passthrough --sync

CONFIGURATION:
    The configuration is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/bt-passthrough/config.toml
    3. /etc/bt-passthrough/config.toml
    4. Built-in defaults

Learned link keys are written back to the configuration on exit.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and the adapter that would be used, then exit
    #[arg(long)]
    list: bool,

    /// Fake a sync-button press once the adapter is open
    #[arg(long)]
    sync: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// Host services for a terminal session
struct ConsoleHost {
    stop: Arc<Notify>,
}

impl HostServices for ConsoleHost {
    fn display_message(&self, message: &str, duration: Duration) {
        info!("{} ({}s)", message, duration.as_secs());
    }

    fn alert(&self, message: &str) {
        error!("{}", message);
    }

    fn stop_execution(&self) {
        self.stop.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = PassthroughConfig::default();
        let path = PassthroughConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        PassthroughConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        PassthroughConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("bt-passthrough v{}", env!("CARGO_PKG_VERSION"));
    debug!("Log level: {}", log_level);

    let backend = Arc::new(RusbBackend::new().context("Failed to initialize libusb")?);

    if args.list {
        return list_mode(backend.as_ref(), &config);
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(PassthroughConfig::default_path);
    run(config, backend, args.sync, config_path).await
}

/// Print every USB device and mark the ones eligible for passthrough
fn list_mode(backend: &dyn UsbBackend, config: &PassthroughConfig) -> Result<()> {
    let candidates = backend
        .candidates()
        .context("Failed to enumerate USB devices")?;
    let eligible = eligible_candidates(&candidates, config.device_override());

    if candidates.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", candidates.len());
    for candidate in &candidates {
        let marker = if eligible.first() == Some(candidate) {
            "*"
        } else if eligible.contains(candidate) {
            "+"
        } else {
            " "
        };
        match candidate.interface {
            Some(class) => println!(
                "{} {}  interface 0: {:02x}/{:02x}/{:02x}",
                marker, candidate, class.class, class.subclass, class.protocol
            ),
            None => println!("{} {}  interface 0: unknown", marker, candidate),
        }
    }
    println!("\n* selected   + eligible");

    Ok(())
}

/// Keep an event poll outstanding and log events until Ctrl-C
async fn run(
    config: PassthroughConfig,
    backend: Arc<RusbBackend>,
    sync: bool,
    config_path: PathBuf,
) -> Result<()> {
    let guest = Arc::new(LoopbackGuest::new(GUEST_MEMORY_SIZE));
    let stop = Arc::new(Notify::new());
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<(RequestAddr, i32)>();

    let sink_tx = reply_tx.clone();
    let env = Environment {
        memory: guest.clone(),
        replies: Arc::new(move |request: RequestAddr, value: i32| {
            let _ = sink_tx.send((request, value));
        }),
        host: Arc::new(ConsoleHost { stop: stop.clone() }),
    };

    let mut bt = BluetoothPassthrough::new(config, backend, env);
    bt.open().context("Failed to open Bluetooth passthrough")?;
    if sync {
        bt.trigger_sync_button_pressed();
    }

    let poll = guest
        .interrupt_request(HCI_EVENT_ENDPOINT, EVENT_POLL_LENGTH)
        .context("Failed to build event poll")?;
    let event_buffer = poll
        .io_vectors
        .first()
        .map(|vector| vector.address)
        .context("Event poll has no data vector")?;
    submit_poll(&bt, &poll, &reply_tx);

    info!("Polling HCI events, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down...");
                break;
            }
            _ = stop.notified() => {
                warn!("Emulation stop requested");
                break;
            }
            Some((request, value)) = replies.recv() => {
                if request != poll.address {
                    debug!("Reply {} for request {:#010x}", value, request.0);
                    continue;
                }
                if value > 0 {
                    let mut event = vec![0u8; value as usize];
                    match guest.copy_from_guest(event_buffer, &mut event) {
                        Ok(()) => info!("HCI event: {:02x?}", event),
                        Err(e) => error!("Failed to read event from guest memory: {}", e),
                    }
                } else if value < 0 {
                    error!("Event poll failed with {}", value);
                    break;
                }
                submit_poll(&bt, &poll, &reply_tx);
            }
        }
    }

    bt.shutdown();
    bt.config()
        .save(&config_path)
        .context("Failed to save link keys")?;

    Ok(())
}

fn submit_poll(
    bt: &BluetoothPassthrough,
    poll: &IoctlvRequest,
    replies: &mpsc::UnboundedSender<(RequestAddr, i32)>,
) {
    if let RequestOutcome::Reply(value) = bt.handle_request(poll) {
        let _ = replies.send((poll.address, value));
    }
}
