//! Stream multiplexing over device links.
//!
//! Each device keeps one [`DeviceSession`]; each attached client occupies
//! one [`RequestSlot`](slot) of that session and is addressed on the device
//! link by `(index, generation)`.
//!
//! # Tasks
//!
//! ```text
//! device task:   Registry::register ─► DeviceSession::run   (ingress)
//! client task:   Registry::attach   ─► SlotHandle::run_egress (egress)
//! ```
//!
//! Tasks share state only through the session's slot table and its
//! serialized frame writer.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `registry` | Device identifier → session table, replacement |
//! | `session` | Device session and ingress dispatch |
//! | `slot` | Request slots, client links, egress loop |

// ============================================================================
// Submodules
// ============================================================================

/// Device registry.
pub mod registry;

/// Device sessions.
pub mod session;

/// Request slots.
pub mod slot;

// ============================================================================
// Re-exports
// ============================================================================

pub use registry::Registry;
pub use session::DeviceSession;
pub use slot::{ClientLink, SlotHandle};
