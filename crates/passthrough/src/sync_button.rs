//! Sync-button state machine
//!
//! The integrated module reports its red sync button through vendor events:
//! payload `0x08` for a short press, `0x09` once it has been held long
//! enough to wipe the pairings. Hosts feed the live button signal in with
//! [`SyncButton::update`] (or trigger the events directly) and the next
//! interrupt poll from the guest consumes the resulting event.
//!
//! ```text
//! Unpressed --held--> Held --released--> Pressed ----+
//!                      |                             |--event sent--> Ignored --released--> Unpressed
//!                      +--held >= threshold--> LongPressed
//! ```

use hci::{SYNC_BUTTON_HELD, SYNC_BUTTON_PRESSED};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncButtonState {
    Unpressed,
    Held,
    Pressed,
    LongPressed,
    /// Event delivered; waiting for the button to be released
    Ignored,
}

/// Event owed to the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncButtonEvent {
    Pressed,
    Held,
}

impl SyncButtonEvent {
    /// Vendor event payload byte
    pub fn payload(&self) -> u8 {
        match self {
            Self::Pressed => SYNC_BUTTON_PRESSED,
            Self::Held => SYNC_BUTTON_HELD,
        }
    }

    /// On-screen message shown when the event reaches the guest
    pub fn message(&self) -> &'static str {
        match self {
            Self::Pressed => "Scanning for Wii Remotes",
            Self::Held => "Reset saved Wii Remote pairings",
        }
    }
}

struct Inner {
    state: SyncButtonState,
    held_since: Instant,
}

pub struct SyncButton {
    inner: Mutex<Inner>,
    hold_threshold: Duration,
}

impl SyncButton {
    pub fn new(hold_threshold: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SyncButtonState::Unpressed,
                held_since: Instant::now(),
            }),
            hold_threshold,
        }
    }

    pub fn state(&self) -> SyncButtonState {
        self.lock().state
    }

    /// Feed the current button signal
    pub fn update(&self, held: bool) {
        self.update_at(held, Instant::now());
    }

    /// Feed the button signal as sampled at `now`
    pub fn update_at(&self, held: bool, now: Instant) {
        let mut inner = self.lock();
        let before = inner.state;

        if inner.state == SyncButtonState::Unpressed && held {
            inner.held_since = now;
            inner.state = SyncButtonState::Held;
        }

        if inner.state == SyncButtonState::Held {
            if held && now.saturating_duration_since(inner.held_since) >= self.hold_threshold {
                inner.state = SyncButtonState::LongPressed;
            } else if !held {
                inner.state = SyncButtonState::Pressed;
            }
        }

        if inner.state == SyncButtonState::Ignored && !held {
            inner.state = SyncButtonState::Unpressed;
        }

        if inner.state != before {
            debug!("Sync button {:?} -> {:?}", before, inner.state);
        }
    }

    /// Owe the guest a short-press event
    pub fn trigger_pressed(&self) {
        self.lock().state = SyncButtonState::Pressed;
    }

    /// Owe the guest a long-press event
    pub fn trigger_held(&self) {
        self.lock().state = SyncButtonState::LongPressed;
    }

    /// Consume the pending event, if any. At most one event per press.
    pub fn take_event(&self) -> Option<SyncButtonEvent> {
        let mut inner = self.lock();
        let event = match inner.state {
            SyncButtonState::Pressed => SyncButtonEvent::Pressed,
            SyncButtonState::LongPressed => SyncButtonEvent::Held,
            _ => return None,
        };
        inner.state = SyncButtonState::Ignored;
        Some(event)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
