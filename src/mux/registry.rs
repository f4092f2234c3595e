//! Device registry: identifier → active session.
//!
//! At most one session is registered per device. A device that reconnects
//! under an identifier that is still registered waits until the previous
//! session has closed its link and freed every slot; only then is the new
//! session installed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Registry                   │
//! │  ┌─────────────────────────────────┐    │
//! │  │ "dev-a" → DeviceSession (cap 4) │    │
//! │  │ "dev-b" → DeviceSession (cap 8) │    │
//! │  └─────────────────────────────────┘    │
//! └─────────────────────────────────────────┘
//!        ▲ register (device task)   ▲ attach (client task)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identifiers::DeviceId;
use crate::transport::FramedConnection;

use super::session::DeviceSession;
use super::slot::{ClientLink, SlotHandle};

// ============================================================================
// Registry
// ============================================================================

/// Table of active device sessions, shared by handle.
///
/// # Example
///
/// ```ignore
/// let registry = Arc::new(Registry::new());
///
/// // Device task: blocks until the session ends.
/// registry.register(device_id, 4, connection).await?;
///
/// // Client task:
/// let handle = registry.attach(&device_id, 80, link).await?;
/// handle.run_egress(incoming).await;
/// ```
#[derive(Debug, Default)]
pub struct Registry {
    /// Active sessions by device.
    devices: RwLock<FxHashMap<DeviceId, Arc<DeviceSession>>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of registered devices.
    #[inline]
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    /// Returns `true` if the device has a registered session.
    #[must_use]
    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.devices.read().contains_key(device_id)
    }
}

// ============================================================================
// Registry - Registration
// ============================================================================

impl Registry {
    /// Registers a device and runs its session until the link ends.
    ///
    /// Any session already registered under `device_id` is closed first and
    /// this call waits for it to finish before installing the new one. On
    /// return every slot of the new session has been freed and the entry
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns the link error that ended the session. A session closed
    /// by replacement or [`shutdown`](Self::shutdown) returns `Ok(())`.
    pub async fn register(
        &self,
        device_id: DeviceId,
        capacity: u16,
        connection: FramedConnection,
    ) -> Result<()> {
        let (reader, writer) = connection.into_split();
        let session = DeviceSession::new(device_id.clone(), capacity, writer);

        loop {
            let previous = {
                let mut devices = self.devices.write();
                match devices.get(&device_id) {
                    Some(previous) => Arc::clone(previous),
                    None => {
                        devices.insert(device_id.clone(), Arc::clone(&session));
                        break;
                    }
                }
            };

            info!(device_id = %device_id, "Replacing existing session");
            previous.close();
            previous.wait_finished().await;
        }

        info!(device_id = %device_id, capacity, "Device registered");

        let registration = Registration {
            registry: self,
            session: Arc::clone(&session),
        };
        let result = session.run(reader).await;
        drop(registration);

        result
    }

    /// Removes `session` if it is still the registered one.
    fn remove(&self, session: &Arc<DeviceSession>) {
        let mut devices = self.devices.write();
        let device_id = session.device_id();

        if devices
            .get(device_id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            devices.remove(device_id);
            debug!(device_id = %device_id, "Device unregistered");
        }
    }

    /// Asks every registered session to close.
    ///
    /// Sessions leave the table as their ingress loops exit.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self.devices.read().values().cloned().collect();

        info!(devices = sessions.len(), "Closing all device sessions");
        for session in sessions {
            session.close();
        }
    }
}

/// Tears a session down when registration ends, even if the task is dropped.
struct Registration<'a> {
    registry: &'a Registry,
    session: Arc<DeviceSession>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.session.free_all();
        self.registry.remove(&self.session);
        self.session.mark_finished();
    }
}

// ============================================================================
// Registry - Attach
// ============================================================================

impl Registry {
    /// Returns the live session for a device.
    ///
    /// A session that is being replaced or shut down is not returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if no live session exists.
    pub fn lookup(&self, device_id: &DeviceId) -> Result<Arc<DeviceSession>> {
        self.devices
            .read()
            .get(device_id)
            .filter(|session| !session.is_closing())
            .cloned()
            .ok_or_else(|| Error::device_not_found(device_id.clone()))
    }

    /// Attaches a client to a free slot of the device's session.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if the device is not registered
    /// - [`Error::CapacityExhausted`] if every slot is in use
    /// - see [`DeviceSession::mount_request`]
    pub async fn attach(
        &self,
        device_id: &DeviceId,
        target_port: u16,
        client: ClientLink,
    ) -> Result<SlotHandle> {
        let session = self.lookup(device_id)?;
        session.mount_request(target_port, client).await
    }
}

// ============================================================================
// Tests
// ============================================================================
