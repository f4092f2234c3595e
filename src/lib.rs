//! xport - device tunnel multiplexer.
//!
//! Devices behind NAT open one outbound link to the server. Any number of
//! clients can then reach a port on the device through that link: each
//! client stream is carried as a virtual stream addressed by a slot index
//! and a generation tag.
//!
//! # Architecture
//!
//! ```text
//!  client ──ws──┐
//!  client ──ws──┼──► Registry ──► DeviceSession ══ framed link ══► device
//!  client ──ws──┘     (by id)     (slot table)
//! ```
//!
//! Key design principles:
//!
//! - One [`DeviceSession`] per device; a reconnect replaces the old session
//!   only after it has fully shut down
//! - Slots are reused; a new generation tag on every free makes late frames
//!   for an old occupant harmless
//! - Malformed input from either side drops a frame or ends a session,
//!   never the process
//!
//! # Quick Start
//!
//! ```no_run
//! use xport::{Result, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Server::bind(ServerConfig::new().with_port(8000)).await?;
//!     println!("listening on {}", server.local_addr());
//!     server.run().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`auth`] | Device token validation |
//! | [`config`] | Server configuration |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Device identifiers and generation tags |
//! | [`mux`] | Registry, sessions, slots |
//! | [`protocol`] | Device link opcodes and commands |
//! | [`transport`] | Listener, handshake, framing |

// ============================================================================
// Modules
// ============================================================================

/// Device token validation.
pub mod auth;

/// Server configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Device identifiers and generation tags.
pub mod identifiers;

/// Stream multiplexing: registry, sessions, slots.
pub mod mux;

/// Device link command protocol.
pub mod protocol;

/// Network transport: listener, upgrade handshake, framing.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use auth::{PlainTokenValidator, TokenValidator};
pub use config::ServerConfig;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{DeviceId, Generation};

// Multiplexing
pub use mux::{ClientLink, DeviceSession, Registry, SlotHandle};

// Protocol
pub use protocol::{Command, Opcode, SlotAddress};

// Transport
pub use transport::{FramedConnection, Server, ShutdownHandle};
