//! Network transport layer.
//!
//! Devices and clients both reach the server over plain TCP with an
//! HTTP/1.1 upgrade. After the 101 response, a device link carries
//! length-prefixed frames and a client connection carries standard
//! WebSocket messages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   framed link (/xportlws)   ┌──────────┐   WebSocket (/xportws)   ┌──────────┐
//! │  Device  │◄───────────────────────────►│  Server  │◄────────────────────────►│  Client  │
//! │ (behind  │   one per device            │          │   one per stream         │          │
//! │  NAT)    │                             │          │                          │          │
//! └──────────┘                             └──────────┘                          └──────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Length-prefixed device link framing |
//! | `handshake` | Request head parsing and upgrade |
//! | `server` | Listener, routing, HTTP replies |

// ============================================================================
// Submodules
// ============================================================================

/// Length-prefixed device link framing.
pub mod connection;

/// Request head parsing and the upgrade handshake.
pub mod handshake;

/// Listener and path routing.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{DeviceStream, FrameReader, FrameWriter, FramedConnection};
pub use handshake::{IncomingRequest, RequestHead, accept_key};
pub use server::{Server, ShutdownHandle};
