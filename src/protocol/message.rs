//! Decoding of frames received from the device.

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};
use crate::identifiers::Generation;

use super::command::{ADDRESS_LEN, Opcode, SlotAddress};

// ============================================================================
// DeviceMessage
// ============================================================================

/// A frame payload received from the device, classified by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage<'a> {
    /// Keepalive request; must be echoed back as Pong.
    Ping,
    /// Keepalive answer; discarded.
    Pong,
    /// Command for one slot.
    Addressed(AddressedFrame<'a>),
}

/// A slot-addressed frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressedFrame<'a> {
    /// Opcode byte as received (may be unknown).
    pub raw_opcode: u8,
    /// Target slot.
    pub address: SlotAddress,
    /// Bytes after the address.
    pub body: &'a [u8],
}

impl AddressedFrame<'_> {
    /// Returns the decoded opcode, if known.
    #[inline]
    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.raw_opcode)
    }
}

impl<'a> DeviceMessage<'a> {
    /// Classifies a frame payload.
    ///
    /// Ping and Pong only need the opcode byte. Anything else must carry a
    /// full slot address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Framing`] for an empty payload or an addressed
    /// payload shorter than 5 bytes.
    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let Some(&first) = payload.first() else {
            return Err(Error::framing("empty frame"));
        };

        match Opcode::from_u8(first) {
            Some(Opcode::Ping) => return Ok(Self::Ping),
            Some(Opcode::Pong) => return Ok(Self::Pong),
            _ => {}
        }

        if payload.len() < ADDRESS_LEN {
            return Err(Error::framing(format!(
                "addressed frame needs {ADDRESS_LEN} bytes, got {}",
                payload.len()
            )));
        }

        let index = u16::from_le_bytes([payload[1], payload[2]]);
        let generation = u16::from_le_bytes([payload[3], payload[4]]);

        Ok(Self::Addressed(AddressedFrame {
            raw_opcode: first,
            address: SlotAddress::new(index, Generation::new(generation)),
            body: &payload[ADDRESS_LEN..],
        }))
    }
}

/// Turns a received Ping payload into the matching Pong.
///
/// Only the opcode byte changes; everything after it is echoed verbatim.
#[must_use]
pub fn pong_for(mut ping: Vec<u8>) -> Vec<u8> {
    if let Some(first) = ping.first_mut() {
        *first = Opcode::Pong.as_u8();
    }
    ping
}

// ============================================================================
// Tests
// ============================================================================
