//! In-process guest used by the command-line harness and the test suites
//!
//! Provides a flat byte array standing in for guest RAM plus builders that lay
//! out USB V0 IO-control-vector requests the way guest drivers do.

use crate::guest::{GuestAddr, GuestMemory, IoVector, IoctlvRequest, RequestAddr, usbv0};
use crate::usb_types::ControlSetup;
use crate::{Error, Result};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// First valid guest address; keeps address 0 unmapped
pub const LOOPBACK_BASE: GuestAddr = 0x1000;

const ALIGN: u32 = 32;

/// Flat guest memory with a bump allocator
pub struct LoopbackGuest {
    memory: Mutex<Vec<u8>>,
    next_free: AtomicU32,
}

impl LoopbackGuest {
    pub fn new(size: usize) -> Self {
        Self {
            memory: Mutex::new(vec![0; size]),
            next_free: AtomicU32::new(LOOPBACK_BASE),
        }
    }

    /// Reserve `len` bytes of zeroed guest memory
    pub fn alloc(&self, len: u32) -> Result<GuestAddr> {
        let reserved = len.max(1).div_ceil(ALIGN) * ALIGN;
        let addr = self.next_free.fetch_add(reserved, Ordering::Relaxed);
        let capacity = self.lock().len();
        let end = (addr - LOOPBACK_BASE) as usize + reserved as usize;
        if end > capacity {
            return Err(Error::GuestMemory {
                addr,
                len: len as usize,
            });
        }
        Ok(addr)
    }

    /// Read `len` bytes starting at `addr`
    pub fn read(&self, addr: GuestAddr, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.copy_from_guest(addr, &mut buf)?;
        Ok(buf)
    }

    fn alloc_with(&self, data: &[u8]) -> Result<IoVector> {
        let address = self.alloc(data.len() as u32)?;
        self.copy_to_guest(address, data)?;
        Ok(IoVector {
            address,
            size: data.len() as u32,
        })
    }

    fn new_request_addr(&self) -> Result<RequestAddr> {
        Ok(RequestAddr(self.alloc(4)?))
    }

    /// Lay out a control message carrying `data` (an HCI command for OUT setups)
    pub fn control_request(&self, setup: ControlSetup, data: &[u8]) -> Result<IoctlvRequest> {
        let in_vectors = vec![
            self.alloc_with(&[setup.request_type])?,
            self.alloc_with(&[setup.request])?,
            self.alloc_with(&setup.value.to_le_bytes())?,
            self.alloc_with(&setup.index.to_le_bytes())?,
            self.alloc_with(&setup.length.to_le_bytes())?,
            self.alloc_with(&[0])?,
        ];
        let buffer_len = (setup.length as usize).max(data.len());
        let mut buffer = vec![0; buffer_len];
        buffer[..data.len()].copy_from_slice(data);
        Ok(IoctlvRequest {
            address: self.new_request_addr()?,
            request: usbv0::CTRLMSG,
            in_vectors,
            io_vectors: vec![self.alloc_with(&buffer)?],
        })
    }

    /// Lay out an HCI command as a class request to the Bluetooth interface
    pub fn hci_command_request(&self, packet: &[u8]) -> Result<IoctlvRequest> {
        self.control_request(ControlSetup::hci_command(packet.len() as u16), packet)
    }

    /// Lay out an interrupt message polling `endpoint` for up to `length` bytes
    pub fn interrupt_request(&self, endpoint: u8, length: u16) -> Result<IoctlvRequest> {
        self.endpoint_request(usbv0::INTRMSG, endpoint, &vec![0; length as usize])
    }

    /// Lay out a bulk IN message reading up to `length` bytes
    pub fn bulk_in_request(&self, endpoint: u8, length: u16) -> Result<IoctlvRequest> {
        self.endpoint_request(usbv0::BLKMSG, endpoint, &vec![0; length as usize])
    }

    /// Lay out a bulk OUT message sending `data`
    pub fn bulk_out_request(&self, endpoint: u8, data: &[u8]) -> Result<IoctlvRequest> {
        self.endpoint_request(usbv0::BLKMSG, endpoint, data)
    }

    fn endpoint_request(&self, request: u32, endpoint: u8, data: &[u8]) -> Result<IoctlvRequest> {
        let in_vectors = vec![
            self.alloc_with(&[endpoint])?,
            self.alloc_with(&(data.len() as u16).to_be_bytes())?,
        ];
        Ok(IoctlvRequest {
            address: self.new_request_addr()?,
            request,
            in_vectors,
            io_vectors: vec![self.alloc_with(data)?],
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn range(&self, memory: &[u8], addr: GuestAddr, len: usize) -> Result<std::ops::Range<usize>> {
        let out_of_range = || Error::GuestMemory { addr, len };
        let start = addr.checked_sub(LOOPBACK_BASE).ok_or_else(out_of_range)? as usize;
        let end = start.checked_add(len).ok_or_else(out_of_range)?;
        if end > memory.len() {
            return Err(out_of_range());
        }
        Ok(start..end)
    }
}

impl GuestMemory for LoopbackGuest {
    fn copy_from_guest(&self, addr: GuestAddr, dst: &mut [u8]) -> Result<()> {
        let memory = self.lock();
        let range = self.range(&memory, addr, dst.len())?;
        dst.copy_from_slice(&memory[range]);
        Ok(())
    }

    fn copy_to_guest(&self, addr: GuestAddr, src: &[u8]) -> Result<()> {
        let mut memory = self.lock();
        let range = self.range(&memory, addr, src.len())?;
        memory[range].copy_from_slice(src);
        Ok(())
    }
}

/// Data buffer (first in/out vector) of a request
pub fn data_vector(request: &IoctlvRequest) -> Option<IoVector> {
    request.io_vectors.first().copied()
}
