//! Passthrough error types

use thiserror::Error;

/// Return codes handed back to the guest through the reply path
pub mod return_codes {
    /// Invalid argument
    pub const IPC_EINVAL: i32 = -4;
    /// No such device
    pub const IPC_ENOENT: i32 = -6;
}

#[derive(Debug, Error)]
pub enum PassthroughError {
    #[error("Bluetooth passthrough mode is enabled, but no usable Bluetooth USB device was found")]
    NoAdapter,

    #[error("Bluetooth passthrough device is not open")]
    NotOpen,

    #[error("Unknown USB V0 request code {0}")]
    UnknownRequest(u32),

    #[error("Malformed USB V0 request: {0}")]
    InvalidRequest(String),

    #[error("State load aborted: {0}")]
    RestoreAborted(String),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] hci::HciError),

    #[error("USB error: {0}")]
    Usb(#[from] common::UsbError),

    #[error(transparent)]
    Common(#[from] common::Error),
}

impl PassthroughError {
    /// Value to report to the guest when a request fails with this error
    pub fn return_code(&self) -> i32 {
        match self {
            Self::NoAdapter | Self::NotOpen => return_codes::IPC_ENOENT,
            _ => return_codes::IPC_EINVAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, PassthroughError>;
