//! Request slots: one multiplexed virtual stream each.
//!
//! A slot lives in its session's table for the session's whole life and is
//! reused across clients. Its generation tag changes on every free, so a
//! frame addressed to a previous occupant no longer resolves.
//!
//! # Lifecycle
//!
//! ```text
//!            mount_request                   free
//!   idle ─────────────────────► in use ─────────────► idle
//!   (gen g)   Created(g) sent   (gen g)   gen g+1     (gen g+1)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{DeviceId, Generation};
use crate::protocol::{Command, MAX_DATA_CHUNK, SlotAddress};

use super::session::DeviceSession;

// ============================================================================
// Types
// ============================================================================

/// Write half of a client WebSocket.
type ClientSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

// ============================================================================
// ClientLink
// ============================================================================

/// Handle on the client side of one virtual stream.
///
/// The slot keeps one clone while it is in use; the egress loop keeps
/// another. Releasing the link wakes the egress loop so it can close the
/// client socket.
#[derive(Clone)]
pub struct ClientLink {
    sink: Arc<Mutex<ClientSink>>,
    released: Arc<Notify>,
}

impl fmt::Debug for ClientLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLink").finish_non_exhaustive()
    }
}

impl ClientLink {
    /// Wraps a message sink.
    pub fn new<K>(sink: K) -> Self
    where
        K: Sink<Message, Error = WsError> + Send + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Box::pin(sink))),
            released: Arc::new(Notify::new()),
        }
    }

    /// Splits a client WebSocket into a link and its incoming message stream.
    pub fn split<S>(
        ws: WebSocketStream<S>,
    ) -> (Self, impl Stream<Item = std::result::Result<Message, WsError>> + Send + Unpin)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = ws.split();
        (Self::new(sink), stream)
    }

    /// Sends device bytes to the client as one binary message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] if the client socket fails.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let message = Message::binary(data.to_vec());
        self.sink.lock().await.send(message).await?;
        Ok(())
    }

    /// Asks the egress loop to close the client socket.
    pub fn release(&self) {
        self.released.notify_one();
    }

    /// Resolves once [`release`](Self::release) has been called.
    pub async fn released(&self) {
        self.released.notified().await;
    }

    /// Sends a close frame and shuts the client socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] if the client socket fails.
    pub async fn close(&self) -> Result<()> {
        self.sink.lock().await.close().await?;
        Ok(())
    }
}

// ============================================================================
// RequestSlot
// ============================================================================

/// One entry of a session's slot table.
#[derive(Debug)]
pub(crate) struct RequestSlot {
    /// Position in the table; never changes.
    index: u16,
    /// Current generation tag.
    generation: Generation,
    /// Whether a client is attached.
    in_use: bool,
    /// Port the device was asked to open (informational).
    target_port: u16,
    /// Client connection while in use.
    client: Option<ClientLink>,
}

impl RequestSlot {
    /// Creates an idle slot.
    pub(crate) fn new(index: u16) -> Self {
        Self {
            index,
            generation: Generation::INITIAL,
            in_use: false,
            target_port: 0,
            client: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn index(&self) -> u16 {
        self.index
    }

    #[inline]
    pub(crate) fn generation(&self) -> Generation {
        self.generation
    }

    #[inline]
    pub(crate) fn in_use(&self) -> bool {
        self.in_use
    }

    #[inline]
    pub(crate) fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Address a frame for the current occupant must carry.
    #[inline]
    pub(crate) fn address(&self) -> SlotAddress {
        SlotAddress::new(self.index, self.generation)
    }

    /// A frame is for this slot iff the slot is in use and the tag matches.
    #[inline]
    pub(crate) fn accepts(&self, address: SlotAddress) -> bool {
        self.in_use && self.index == address.index && self.generation == address.generation
    }

    /// Marks the slot in use for a new client.
    pub(crate) fn occupy(&mut self, target_port: u16, client: ClientLink) {
        debug_assert!(!self.in_use, "slot {} occupied twice", self.index);
        self.in_use = true;
        self.target_port = target_port;
        self.client = Some(client);
    }

    /// Forwards device bytes to the attached client.
    ///
    /// # Errors
    ///
    /// - [`Error::NoClientConnection`] if no client is attached
    /// - [`Error::WebSocket`] if the client socket fails
    pub(crate) async fn on_data(client: Option<ClientLink>, index: u16, data: &[u8]) -> Result<()> {
        match client {
            Some(client) => client.send(data).await,
            None => Err(Error::no_client_connection(index)),
        }
    }

    /// Returns a handle on the attached client, if any.
    pub(crate) fn client(&self) -> Option<ClientLink> {
        self.client.clone()
    }

    /// Drops the client connection without recycling the slot.
    pub(crate) fn close(&mut self) {
        if let Some(client) = self.client.take() {
            client.release();
        }
    }

    /// Recycles the slot: closes the client and moves to the next generation.
    ///
    /// Returns `false` if the slot was already idle; the tag only moves on
    /// an in-use to idle transition.
    pub(crate) fn free(&mut self) -> bool {
        self.close();

        if !self.in_use {
            return false;
        }

        self.in_use = false;
        self.target_port = 0;
        self.generation = self.generation.next();
        true
    }
}

// ============================================================================
// SlotHandle
// ============================================================================

/// A mounted slot as seen by its client task.
///
/// Holds only a weak reference to the session; the session stays the sole
/// owner of its slot table and device connection.
#[derive(Debug)]
pub struct SlotHandle {
    pub(crate) device_id: DeviceId,
    pub(crate) session: Weak<DeviceSession>,
    pub(crate) address: SlotAddress,
    pub(crate) client: ClientLink,
}

/// Why an egress loop stopped.
#[derive(Debug)]
enum EgressEnd {
    /// Slot freed elsewhere (device close or session teardown).
    Released,
    /// Client closed or its socket failed.
    ClientGone,
    /// Writing to the device failed.
    DeviceFailed(Error),
}

impl SlotHandle {
    /// Slot index and the generation this client was given.
    #[inline]
    #[must_use]
    pub fn address(&self) -> SlotAddress {
        self.address
    }

    /// Pumps client messages to the device until either side ends.
    ///
    /// Each binary or text message becomes one or more Data frames for this
    /// slot. When the client goes away a ClientClosed is sent and the slot
    /// freed; when the slot is freed from the device side the client socket
    /// is closed without notifying the device.
    pub async fn run_egress<S>(self, mut incoming: S)
    where
        S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    {
        debug!(device_id = %self.device_id, slot = %self.address, "Egress loop started");

        let end = loop {
            let message = tokio::select! {
                biased;
                () = self.client.released() => break EgressEnd::Released,
                message = incoming.next() => message,
            };

            let forwarded = match message {
                Some(Ok(Message::Binary(data))) => self.forward(&data).await,
                Some(Ok(Message::Text(text))) => self.forward(text.as_str().as_bytes()).await,
                Some(Ok(Message::Close(_))) | None => break EgressEnd::ClientGone,
                Some(Ok(_)) => Ok(()),
                Some(Err(e)) => {
                    debug!(device_id = %self.device_id, slot = %self.address, error = %e, "Client read failed");
                    break EgressEnd::ClientGone;
                }
            };

            if let Err(e) = forwarded {
                break EgressEnd::DeviceFailed(e);
            }
        };

        match end {
            EgressEnd::Released => {
                debug!(device_id = %self.device_id, slot = %self.address, "Slot released, closing client");
            }
            EgressEnd::ClientGone => {
                if let Some(session) = self.session.upgrade() {
                    let command = Command::ClientClosed {
                        address: self.address,
                    };
                    if let Err(e) = session.send_command(&command).await {
                        warn!(device_id = %self.device_id, slot = %self.address, error = %e, "Failed to send ClientClosed");
                    }
                    session.free_if_current(self.address);
                }
            }
            EgressEnd::DeviceFailed(e) => {
                if let Some(session) = self.session.upgrade() {
                    warn!(device_id = %self.device_id, slot = %self.address, error = %e, "Device write failed");
                    session.free_if_current(self.address);
                }
            }
        }

        if let Err(e) = self.client.close().await {
            trace!(device_id = %self.device_id, slot = %self.address, error = %e, "Client close failed");
        }
    }

    /// Wraps client bytes into Data frames for this slot.
    async fn forward(&self, data: &[u8]) -> Result<()> {
        let session = self.session.upgrade().ok_or(Error::ConnectionClosed)?;

        for chunk in data.chunks(MAX_DATA_CHUNK) {
            let command = Command::Data {
                address: self.address,
                payload: chunk,
            };
            session.send_command(&command).await?;
        }

        trace!(device_id = %self.device_id, slot = %self.address, len = data.len(), "Client data forwarded");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
