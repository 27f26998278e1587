//! Decoding of USB V0 IO-control-vector requests
//!
//! Each request is decoded once, at the boundary, into a tagged variant.
//! Declared lengths are clamped to the size of the guest buffer that backs
//! them, so later copies never run past what the guest handed in.

use crate::error::{PassthroughError, Result};
use common::guest::usbv0;
use common::{ControlSetup, GuestAddr, GuestMemory, IoVector, IoctlvRequest};

/// HCI command sent through the control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub setup: ControlSetup,
    pub data_address: GuestAddr,
    pub length: u16,
}

impl ControlMessage {
    /// Copy the command bytes out of the guest
    pub fn read_packet(&self, memory: &dyn GuestMemory) -> Result<Vec<u8>> {
        let mut packet = vec![0; self.length as usize];
        memory.copy_from_guest(self.data_address, &mut packet)?;
        Ok(packet)
    }
}

/// Interrupt or bulk message addressed to one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointMessage {
    pub endpoint: u8,
    pub data_address: GuestAddr,
    pub length: u16,
}

impl EndpointMessage {
    pub fn is_in(&self) -> bool {
        common::usb_types::endpoint_is_in(self.endpoint)
    }

    /// Copy the outgoing payload out of the guest
    pub fn read_payload(&self, memory: &dyn GuestMemory) -> Result<Vec<u8>> {
        let mut payload = vec![0; self.length as usize];
        memory.copy_from_guest(self.data_address, &mut payload)?;
        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbV0Request {
    /// Outbound HCI command
    Control(ControlMessage),
    /// Inbound HCI events
    Interrupt(EndpointMessage),
    /// ACL data, either direction
    Bulk(EndpointMessage),
}

impl UsbV0Request {
    pub fn decode(request: &IoctlvRequest, memory: &dyn GuestMemory) -> Result<Self> {
        match request.request {
            usbv0::CTRLMSG => {
                let [request_type, bmrequest, value, index, length] =
                    in_vectors::<5>(request, usbv0::CTRL_IN_VECTORS)?;
                let data = data_vector(request)?;
                let declared = read_u16_le(memory, length.address)?;
                let setup = ControlSetup {
                    request_type: memory.read_u8(request_type.address)?,
                    request: memory.read_u8(bmrequest.address)?,
                    value: read_u16_le(memory, value.address)?,
                    index: read_u16_le(memory, index.address)?,
                    length: clamp(declared, data),
                };
                Ok(Self::Control(ControlMessage {
                    setup,
                    data_address: data.address,
                    length: setup.length,
                }))
            }
            usbv0::BLKMSG | usbv0::INTRMSG => {
                let [endpoint, length] = in_vectors::<2>(request, usbv0::ENDPOINT_IN_VECTORS)?;
                let data = data_vector(request)?;
                let message = EndpointMessage {
                    endpoint: memory.read_u8(endpoint.address)?,
                    data_address: data.address,
                    length: clamp(memory.read_u16(length.address)?, data),
                };
                if request.request == usbv0::INTRMSG {
                    Ok(Self::Interrupt(message))
                } else {
                    Ok(Self::Bulk(message))
                }
            }
            other => Err(PassthroughError::UnknownRequest(other)),
        }
    }
}

fn in_vectors<const N: usize>(request: &IoctlvRequest, expected: usize) -> Result<[IoVector; N]> {
    if request.in_vectors.len() < expected {
        return Err(PassthroughError::InvalidRequest(format!(
            "expected {} input vectors, got {}",
            expected,
            request.in_vectors.len()
        )));
    }
    let mut vectors = [IoVector { address: 0, size: 0 }; N];
    vectors.copy_from_slice(&request.in_vectors[..N]);
    Ok(vectors)
}

fn data_vector(request: &IoctlvRequest) -> Result<IoVector> {
    request
        .io_vectors
        .first()
        .copied()
        .ok_or_else(|| PassthroughError::InvalidRequest("missing data vector".to_string()))
}

/// Setup packet fields are stored little-endian, as on the USB wire
fn read_u16_le(memory: &dyn GuestMemory, address: GuestAddr) -> Result<u16> {
    Ok(memory.read_u16(address)?.swap_bytes())
}

fn clamp(declared: u16, data: IoVector) -> u16 {
    declared.min(data.size.min(u16::MAX as u32) as u16)
}
