//! Opcode table and addressed command encoding.
//!
//! Every command except Ping/Pong is addressed to one request slot:
//!
//! ```text
//! [opcode:1][slot index:2 LE][generation:2 LE][body...]
//! ```
//!
//! Data carries raw bytes as its body, Created carries the target port.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::identifiers::Generation;

// ============================================================================
// Constants
// ============================================================================

/// Size of the length prefix in front of every device frame.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Bytes taken by opcode, slot index and generation tag.
pub const ADDRESS_LEN: usize = 5;

/// Largest payload one device frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize - LENGTH_PREFIX_LEN;

/// Largest Data body one device frame can carry.
pub const MAX_DATA_CHUNK: usize = MAX_FRAME_PAYLOAD - ADDRESS_LEN;

// ============================================================================
// Opcode
// ============================================================================

/// Command opcode, the first byte of every device frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Never sent.
    Reserved = 0,
    /// Stream bytes for a slot.
    Data = 1,
    /// Slot attached; device should open the target port.
    Created = 2,
    /// Client side closed.
    ClientClosed = 3,
    /// Client side finished sending.
    ClientFinished = 4,
    /// Device side finished sending.
    ServerFinished = 5,
    /// Device side closed.
    ServerClosed = 6,
    /// Flow-control credit for the client side.
    ClientQuota = 7,
    /// Keepalive request.
    Ping = 8,
    /// Keepalive answer.
    Pong = 9,
}

impl Opcode {
    /// Decodes an opcode byte.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Reserved,
            1 => Self::Data,
            2 => Self::Created,
            3 => Self::ClientClosed,
            4 => Self::ClientFinished,
            5 => Self::ServerFinished,
            6 => Self::ServerClosed,
            7 => Self::ClientQuota,
            8 => Self::Ping,
            9 => Self::Pong,
            _ => return None,
        })
    }

    /// Returns the wire byte.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reserved => "Reserved",
            Self::Data => "Data",
            Self::Created => "Created",
            Self::ClientClosed => "ClientClosed",
            Self::ClientFinished => "ClientFinished",
            Self::ServerFinished => "ServerFinished",
            Self::ServerClosed => "ServerClosed",
            Self::ClientQuota => "ClientQuota",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
        };
        f.write_str(name)
    }
}

// ============================================================================
// SlotAddress
// ============================================================================

/// Slot index plus the generation tag the sender believes is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotAddress {
    /// Slot index in the session's table.
    pub index: u16,
    /// Generation tag of that slot.
    pub generation: Generation,
}

impl SlotAddress {
    /// Creates a slot address.
    #[inline]
    #[must_use]
    pub const fn new(index: u16, generation: Generation) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for SlotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

// ============================================================================
// Command
// ============================================================================

/// Outbound command addressed to a slot on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Client bytes for the slot.
    Data {
        /// Target slot.
        address: SlotAddress,
        /// Raw bytes.
        payload: &'a [u8],
    },
    /// New client attached; open `port` on the device side.
    Created {
        /// Target slot.
        address: SlotAddress,
        /// Local endpoint the device should open.
        port: u16,
    },
    /// Client connection ended.
    ClientClosed {
        /// Target slot.
        address: SlotAddress,
    },
}

impl Command<'_> {
    /// Returns the command's opcode.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Data { .. } => Opcode::Data,
            Self::Created { .. } => Opcode::Created,
            Self::ClientClosed { .. } => Opcode::ClientClosed,
        }
    }

    /// Returns the addressed slot.
    #[must_use]
    pub const fn address(&self) -> SlotAddress {
        match self {
            Self::Data { address, .. }
            | Self::Created { address, .. }
            | Self::ClientClosed { address } => *address,
        }
    }

    /// Encodes the command as a frame payload (without length prefix).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body_len = match self {
            Self::Data { payload, .. } => payload.len(),
            Self::Created { .. } => 2,
            Self::ClientClosed { .. } => 0,
        };

        let address = self.address();
        let mut buf = Vec::with_capacity(ADDRESS_LEN + body_len);
        buf.push(self.opcode().as_u8());
        buf.extend_from_slice(&address.index.to_le_bytes());
        buf.extend_from_slice(&address.generation.get().to_le_bytes());

        match self {
            Self::Data { payload, .. } => buf.extend_from_slice(payload),
            Self::Created { port, .. } => buf.extend_from_slice(&port.to_le_bytes()),
            Self::ClientClosed { .. } => {}
        }

        buf
    }
}

// ============================================================================
// Tests
// ============================================================================
