//! Error types for the xport multiplexer.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use xport::{Error, Result};
//!
//! fn capacity(raw: &str) -> Result<u16> {
//!     raw.parse()
//!         .map_err(|_| Error::invalid_argument(format!("bad cap: {raw}")))
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Effect |
//! |----------|----------|--------|
//! | Handshake | [`Error::Handshake`], [`Error::Unauthorized`], [`Error::InvalidArgument`] | request rejected, nothing claimed |
//! | Device link | [`Error::Framing`], [`Error::ConnectionClosed`] | session torn down |
//! | Slots | [`Error::SlotLookup`], [`Error::NoClientConnection`] | frame dropped |
//! | Attach | [`Error::DeviceNotFound`], [`Error::CapacityExhausted`] | client refused |
//! | Configuration | [`Error::Config`] | startup fails |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] | wrapped |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::DeviceId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// Upgrade handshake rejected.
    ///
    /// Returned before any connection is taken over.
    #[error("Handshake failed: {message}")]
    Handshake {
        /// Which check failed.
        message: String,
    },

    /// Token validation failed.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Why the token was refused.
        message: String,
    },

    /// Missing or malformed request parameter.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // Device Link Errors
    // ========================================================================
    /// Length-prefixed framing violated on the device link.
    #[error("Framing error: {message}")]
    Framing {
        /// Description of the framing violation.
        message: String,
    },

    /// Peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Slot Errors
    // ========================================================================
    /// Addressed slot is out of range, idle, or on a newer generation.
    ///
    /// Expected when a frame was in flight for a slot that was just freed.
    #[error("No live slot at index {index} generation {generation}")]
    SlotLookup {
        /// Slot index from the frame.
        index: u16,
        /// Generation tag from the frame.
        generation: u16,
    },

    /// Slot has no client connection attached.
    #[error("Slot {index} has no client connection")]
    NoClientConnection {
        /// Slot index.
        index: u16,
    },

    // ========================================================================
    // Attach Errors
    // ========================================================================
    /// No session registered for the device.
    #[error("Device not found: {device_id}")]
    DeviceNotFound {
        /// The missing device.
        device_id: DeviceId,
    },

    /// Every slot of the session is in use.
    #[error("No free slot on device {device_id} (capacity {capacity})")]
    CapacityExhausted {
        /// Device whose table is full.
        device_id: DeviceId,
        /// Fixed capacity of that table.
        capacity: u16,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error on a client connection.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates an unauthorized error.
    #[inline]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a framing error.
    #[inline]
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    /// Creates a slot lookup error.
    #[inline]
    pub fn slot_lookup(index: u16, generation: u16) -> Self {
        Self::SlotLookup { index, generation }
    }

    /// Creates a no client connection error.
    #[inline]
    pub fn no_client_connection(index: u16) -> Self {
        Self::NoClientConnection { index }
    }

    /// Creates a device not found error.
    #[inline]
    pub fn device_not_found(device_id: DeviceId) -> Self {
        Self::DeviceNotFound { device_id }
    }

    /// Creates a capacity exhausted error.
    #[inline]
    pub fn capacity_exhausted(device_id: DeviceId, capacity: u16) -> Self {
        Self::CapacityExhausted {
            device_id,
            capacity,
        }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the error is an expected race, not a fault.
    ///
    /// The offending frame is dropped and the session continues.
    #[inline]
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::SlotLookup { .. })
    }

    /// Returns `true` if this error refuses a request without touching
    /// any session state.
    #[inline]
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Handshake { .. }
                | Self::Unauthorized { .. }
                | Self::InvalidArgument { .. }
                | Self::DeviceNotFound { .. }
                | Self::CapacityExhausted { .. }
        )
    }

    /// Returns `true` if this is a connection-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Framing { .. } | Self::ConnectionClosed | Self::Io(_) | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::framing("length 2 too short");
        assert_eq!(err.to_string(), "Framing error: length 2 too short");
    }

    #[test]
    fn test_capacity_display() {
        let err = Error::capacity_exhausted(DeviceId::new("dev-1"), 4);
        assert_eq!(err.to_string(), "No free slot on device dev-1 (capacity 4)");
    }

    #[test]
    fn test_is_benign() {
        assert!(Error::slot_lookup(0, 1).is_benign());
        assert!(!Error::framing("x").is_benign());
    }

    #[test]
    fn test_is_rejection() {
        assert!(Error::handshake("no key").is_rejection());
        assert!(Error::device_not_found(DeviceId::new("d")).is_rejection());
        assert!(Error::capacity_exhausted(DeviceId::new("d"), 0).is_rejection());
        assert!(!Error::ConnectionClosed.is_rejection());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::framing("x").is_connection_error());
        assert!(!Error::config("x").is_connection_error());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::UnexpectedEof, "eof");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
