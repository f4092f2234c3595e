//! Device-link command protocol.
//!
//! Frames on the device link carry one command each. The length prefix is
//! handled by [`crate::transport::connection`]; this module deals with the
//! payload behind it.
//!
//! # Opcodes
//!
//! | Byte | Opcode | Direction | Body |
//! |------|--------|-----------|------|
//! | 0 | `Reserved` | - | - |
//! | 1 | `Data` | both | raw bytes |
//! | 2 | `Created` | server → device | target port (u16 LE) |
//! | 3 | `ClientClosed` | server → device | - |
//! | 4 | `ClientFinished` | server → device | - |
//! | 5 | `ServerFinished` | device → server | - |
//! | 6 | `ServerClosed` | device → server | - |
//! | 7 | `ClientQuota` | - | - |
//! | 8 | `Ping` | device → server | echoed |
//! | 9 | `Pong` | both | - |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Opcode table and outbound encoding |
//! | `message` | Inbound frame classification |

// ============================================================================
// Submodules
// ============================================================================

/// Opcode table and addressed command encoding.
pub mod command;

/// Inbound frame decoding.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{
    ADDRESS_LEN, Command, LENGTH_PREFIX_LEN, MAX_DATA_CHUNK, MAX_FRAME_PAYLOAD, Opcode,
    SlotAddress,
};
pub use message::{AddressedFrame, DeviceMessage, pong_for};
