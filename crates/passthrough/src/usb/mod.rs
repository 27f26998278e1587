//! Host USB access through rusb

pub mod backend;
pub mod device;
pub mod lanes;
pub mod transfers;

pub use backend::RusbBackend;
pub use device::RusbAdapter;
