//! Device sessions and the ingress (device → clients) loop.
//!
//! A [`DeviceSession`] owns the write side of one device link and a
//! fixed-capacity table of [`RequestSlot`]s. Its ingress loop owns the read
//! side and runs until the link fails or the session is closed.
//!
//! # Ingress Dispatch
//!
//! | Frame | Action |
//! |-------|--------|
//! | Ping | echo back as Pong, byte-identical apart from the opcode |
//! | Pong | discard |
//! | shorter than 5 bytes | warn, discard |
//! | unresolvable slot | discard (stale generation is expected) |
//! | ServerFinished / ServerClosed | free the slot |
//! | Data | forward to the client; free the slot if that fails |
//! | anything else | log, ignore |
//!
//! # Locking
//!
//! The slot table sits behind one synchronous lock that is never held
//! across an await. Writes to the device go through the shared
//! [`FrameWriter`], which serializes whole frames.
//!
//! # Closing
//!
//! [`DeviceSession::close`] cuts the write side of the link at once, so
//! egress loops blocked on a device that stopped reading fail instead of
//! holding the writer. The ingress loop stops even while a dispatch is
//! still waiting on a slow client.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{DeviceId, Generation};
use crate::protocol::{AddressedFrame, Command, DeviceMessage, Opcode, SlotAddress, pong_for};
use crate::transport::{FrameReader, FrameWriter};

use super::slot::{ClientLink, RequestSlot, SlotHandle};

// ============================================================================
// SlotTable
// ============================================================================

/// Slots plus the flag that stops new mounts once teardown has started.
#[derive(Debug)]
struct SlotTable {
    slots: Vec<RequestSlot>,
    shut: bool,
}

impl SlotTable {
    fn new(capacity: u16) -> Self {
        Self {
            slots: (0..capacity).map(RequestSlot::new).collect(),
            shut: false,
        }
    }

    /// Finds the live slot a frame is addressed to.
    fn resolve(&mut self, address: SlotAddress) -> Result<&mut RequestSlot> {
        self.slots
            .get_mut(usize::from(address.index))
            .filter(|slot| slot.accepts(address))
            .ok_or_else(|| Error::slot_lookup(address.index, address.generation.get()))
    }
}

// ============================================================================
// DeviceSession
// ============================================================================

/// The single active session of one device.
pub struct DeviceSession {
    /// Identifier claimed in the registry.
    device_id: DeviceId,
    /// Slot count, fixed at creation.
    capacity: u16,
    /// Shared write side of the device link.
    writer: FrameWriter,
    /// Slot table.
    table: Mutex<SlotTable>,
    /// Set to ask the ingress loop to stop.
    closing: watch::Sender<bool>,
    /// Set once every slot is freed and the session left the registry.
    finished: watch::Sender<bool>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.device_id)
            .field("capacity", &self.capacity)
            .field("active_slots", &self.active_slots())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// DeviceSession - Constructor & Accessors
// ============================================================================

impl DeviceSession {
    /// Creates a session with `capacity` idle slots.
    pub(crate) fn new(device_id: DeviceId, capacity: u16, writer: FrameWriter) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            capacity,
            writer,
            table: Mutex::new(SlotTable::new(capacity)),
            closing: watch::Sender::new(false),
            finished: watch::Sender::new(false),
        })
    }

    /// Returns the device identifier.
    #[inline]
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Returns the fixed slot capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Returns how many slots are in use.
    #[must_use]
    pub fn active_slots(&self) -> usize {
        self.table.lock().slots.iter().filter(|s| s.in_use()).count()
    }

    /// Returns the current generation of a slot.
    #[must_use]
    pub fn generation_of(&self, index: u16) -> Option<Generation> {
        self.table
            .lock()
            .slots
            .get(usize::from(index))
            .map(RequestSlot::generation)
    }

    /// Returns the target port of an in-use slot.
    #[must_use]
    pub fn target_port_of(&self, index: u16) -> Option<u16> {
        self.table
            .lock()
            .slots
            .get(usize::from(index))
            .filter(|s| s.in_use())
            .map(RequestSlot::target_port)
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }
}

// ============================================================================
// DeviceSession - Lifecycle
// ============================================================================

impl DeviceSession {
    /// Cuts the device link and stops the ingress loop.
    ///
    /// Pending writes to the device fail immediately; slots are freed and the
    /// link shut down as the ingress loop exits.
    pub fn close(&self) {
        self.closing.send_replace(true);
        self.writer.close();
    }

    /// Resolves once the session has fully shut down.
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Returns `true` once the session has fully shut down.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    /// Frees every slot and refuses further mounts.
    pub(crate) fn free_all(&self) {
        let mut table = self.table.lock();
        table.shut = true;

        let freed = table.slots.iter_mut().map(RequestSlot::free).filter(|freed| *freed).count();
        if freed > 0 {
            debug!(device_id = %self.device_id, freed, "Freed slots on teardown");
        }
    }

    /// Frees a slot if it still belongs to the given generation.
    ///
    /// Returns `false` if the slot was already freed or reused.
    pub fn free_if_current(&self, address: SlotAddress) -> bool {
        let freed = {
            let mut table = self.table.lock();
            table.resolve(address).is_ok_and(RequestSlot::free)
        };
        if freed {
            debug!(device_id = %self.device_id, slot = %address, "Slot freed");
        }
        freed
    }
}

// ============================================================================
// DeviceSession - Device Writes
// ============================================================================

impl DeviceSession {
    /// Writes one raw frame payload to the device.
    ///
    /// # Errors
    ///
    /// See [`FrameWriter::write_message`].
    pub async fn send_frame(&self, payload: &[u8]) -> Result<()> {
        self.writer.write_message(payload).await
    }

    /// Encodes and writes one addressed command.
    ///
    /// # Errors
    ///
    /// See [`FrameWriter::write_message`].
    pub async fn send_command(&self, command: &Command<'_>) -> Result<()> {
        trace!(device_id = %self.device_id, opcode = %command.opcode(), slot = %command.address(), "Sending command");
        self.send_frame(&command.encode()).await
    }
}

// ============================================================================
// DeviceSession - Slot Allocation
// ============================================================================

impl DeviceSession {
    /// Attaches a client to the first free slot and announces it to the device.
    ///
    /// The device receives Created with the slot's current generation and
    /// `target_port` before this returns.
    ///
    /// # Errors
    ///
    /// - [`Error::CapacityExhausted`] if every slot is in use (no queueing)
    /// - [`Error::ConnectionClosed`] if the session is shutting down
    /// - [`Error::Io`] if Created could not be written; the slot is freed again
    pub async fn mount_request(
        self: &Arc<Self>,
        target_port: u16,
        client: ClientLink,
    ) -> Result<SlotHandle> {
        let address = {
            let mut table = self.table.lock();
            if table.shut {
                return Err(Error::ConnectionClosed);
            }

            let Some(slot) = table.slots.iter_mut().find(|s| !s.in_use()) else {
                return Err(Error::capacity_exhausted(
                    self.device_id.clone(),
                    self.capacity,
                ));
            };

            slot.occupy(target_port, client.clone());
            slot.address()
        };

        debug!(device_id = %self.device_id, slot = %address, target_port, "Slot mounted");

        let created = Command::Created {
            address,
            port: target_port,
        };
        if let Err(e) = self.send_command(&created).await {
            self.free_if_current(address);
            return Err(e);
        }

        Ok(SlotHandle {
            device_id: self.device_id.clone(),
            session: Arc::downgrade(self),
            address,
            client,
        })
    }
}

// ============================================================================
// DeviceSession - Ingress Loop
// ============================================================================

impl DeviceSession {
    /// Reads and dispatches device frames until the link fails or the
    /// session is closed, then frees every slot.
    ///
    /// # Errors
    ///
    /// Returns the read error that ended the loop; a local
    /// [`close`](Self::close) ends it with `Ok(())`.
    pub async fn run(&self, mut reader: FrameReader) -> Result<()> {
        let mut closing = self.closing.subscribe();

        let result = loop {
            let frame = tokio::select! {
                biased;
                () = closed(&mut closing) => break Ok(()),
                frame = reader.read_message() => frame,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => break Err(e),
            };

            tokio::select! {
                biased;
                () = closed(&mut closing) => break Ok(()),
                () = self.dispatch(frame) => {}
            }
        };

        self.writer.close();
        self.free_all();

        if let Err(e) = self.writer.shutdown().await {
            trace!(device_id = %self.device_id, error = %e, "Link shutdown failed");
        }

        match &result {
            Ok(()) => info!(device_id = %self.device_id, "Device session closed"),
            Err(e) => info!(device_id = %self.device_id, error = %e, "Device link ended"),
        }

        result
    }

    /// Handles one frame from the device.
    async fn dispatch(&self, frame: Vec<u8>) {
        match DeviceMessage::decode(&frame) {
            Ok(DeviceMessage::Ping) => {}
            Ok(DeviceMessage::Pong) => return,
            Ok(DeviceMessage::Addressed(addressed)) => return self.dispatch_addressed(addressed).await,
            Err(e) => {
                warn!(device_id = %self.device_id, error = %e, "Dropping malformed frame");
                return;
            }
        }

        trace!(device_id = %self.device_id, "Ping received, sending Pong");
        if let Err(e) = self.send_frame(&pong_for(frame)).await {
            warn!(device_id = %self.device_id, error = %e, "Failed to send Pong");
        }
    }

    /// Handles a slot-addressed frame.
    async fn dispatch_addressed(&self, frame: AddressedFrame<'_>) {
        let address = frame.address;

        let client = {
            let mut table = self.table.lock();
            let slot = match table.resolve(address) {
                Ok(slot) => slot,
                Err(e) => {
                    debug!(device_id = %self.device_id, opcode = frame.raw_opcode, error = %e, "Dropping frame");
                    return;
                }
            };

            match frame.opcode() {
                Some(Opcode::ServerFinished | Opcode::ServerClosed) => {
                    slot.free();
                    debug!(device_id = %self.device_id, slot = %address, opcode = frame.raw_opcode, "Device ended slot, slot freed");
                    return;
                }
                Some(Opcode::Data) => slot.client(),
                _ => {
                    debug!(device_id = %self.device_id, slot = %address, opcode = frame.raw_opcode, "Ignoring opcode");
                    return;
                }
            }
        };

        if let Err(e) = RequestSlot::on_data(client, address.index, frame.body).await {
            warn!(device_id = %self.device_id, slot = %address, error = %e, "Client write failed");
            self.free_if_current(address);
        }
    }
}

/// Resolves once the closing flag is set.
async fn closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closing| *closing).await;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use futures_util::{SinkExt, Stream, sink, stream};
    use tokio::io::duplex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    use crate::protocol::MAX_DATA_CHUNK;
    use crate::transport::FramedConnection;

    const WAIT: Duration = Duration::from_secs(2);

    type ClientItem = std::result::Result<Message, WsError>;

    /// A session wired to an in-memory device.
    fn session_pair(capacity: u16) -> (Arc<DeviceSession>, FrameReader, FramedConnection) {
        let (ours, theirs) = duplex(1 << 18);
        let (reader, writer) = FramedConnection::new(ours).into_split();
        let session = DeviceSession::new(DeviceId::new("dev"), capacity, writer);
        (session, reader, FramedConnection::new(theirs))
    }

    /// A link whose sent messages can be observed.
    fn observed_link() -> (ClientLink, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = sink::unfold(tx, |tx, message: Message| async move {
            tx.send(message).map_err(|_| WsError::ConnectionClosed)?;
            Ok::<_, WsError>(tx)
        });
        (ClientLink::new(sink), rx)
    }

    /// A link whose sends never complete.
    fn stuck_link() -> ClientLink {
        ClientLink::new(sink::unfold((), |(), _message: Message| async move {
            std::future::pending::<()>().await;
            Ok::<_, WsError>(())
        }))
    }

    fn null_link() -> ClientLink {
        ClientLink::new(sink::drain::<Message>().sink_map_err(|_| WsError::ConnectionClosed))
    }

    /// A fake client message stream fed from the test.
    fn client_stream() -> (
        mpsc::UnboundedSender<ClientItem>,
        impl Stream<Item = ClientItem> + Send + Unpin,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let incoming = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (tx, Box::pin(incoming))
    }

    fn spawn_ingress(
        session: &Arc<DeviceSession>,
        reader: FrameReader,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let session = Arc::clone(session);
        tokio::spawn(async move { session.run(reader).await })
    }

    /// A Ping round-trip proves every earlier frame has been dispatched.
    async fn sync(device: &mut FramedConnection) {
        device.write_message(&[8]).await.unwrap();
        let pong = timeout(WAIT, device.read_message()).await.unwrap().unwrap();
        assert_eq!(pong, vec![9]);
    }

    #[tokio::test]
    async fn test_mount_sends_created() {
        let (session, _reader, mut device) = session_pair(4);

        let handle = session.mount_request(80, null_link()).await.unwrap();
        assert_eq!(handle.address(), SlotAddress::new(0, Generation::new(1)));

        let frame = device.read_message().await.unwrap();
        assert_eq!(frame, vec![2, 0, 0, 1, 0, 80, 0]);
        assert_eq!(session.active_slots(), 1);
        assert_eq!(session.target_port_of(0), Some(80));
    }

    #[tokio::test]
    async fn test_first_fit_and_exhaustion() {
        let (session, _reader, _device) = session_pair(2);

        let a = session.mount_request(1, null_link()).await.unwrap();
        let b = session.mount_request(2, null_link()).await.unwrap();
        assert_eq!(a.address().index, 0);
        assert_eq!(b.address().index, 1);

        let err = session.mount_request(3, null_link()).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted { capacity: 2, .. }));

        assert!(session.free_if_current(a.address()));
        let c = session.mount_request(4, null_link()).await.unwrap();
        assert_eq!(c.address(), SlotAddress::new(0, Generation::new(2)));
    }

    #[tokio::test]
    async fn test_concurrent_mounts_get_distinct_slots() {
        let (session, _reader, _device) = session_pair(8);

        let tasks: Vec<_> = (0..8)
            .map(|port| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.mount_request(port, null_link()).await })
            })
            .collect();

        let mut indices = Vec::new();
        for task in tasks {
            let handle = task.await.unwrap().unwrap();
            indices.push(handle.address().index);
        }
        indices.sort_unstable();
        assert_eq!(indices, (0..8).collect::<Vec<u16>>());
        assert_eq!(session.active_slots(), 8);

        let err = session.mount_request(9, null_link()).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted { .. }));
    }

    #[tokio::test]
    async fn test_zero_capacity_always_exhausted() {
        let (session, _reader, _device) = session_pair(0);
        let err = session.mount_request(80, null_link()).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted { .. }));
    }

    #[tokio::test]
    async fn test_free_if_current_ignores_stale() {
        let (session, _reader, _device) = session_pair(1);
        let handle = session.mount_request(80, null_link()).await.unwrap();
        let stale = handle.address();

        assert!(session.free_if_current(stale));
        assert!(!session.free_if_current(stale));
        assert_eq!(session.generation_of(0), Some(Generation::new(2)));
    }

    #[tokio::test]
    async fn test_ping_echoed_as_pong() {
        let (session, reader, mut device) = session_pair(1);
        let task = spawn_ingress(&session, reader);

        device.write_message(&[8, 5, 0, 9, 0, 0xca, 0xfe]).await.unwrap();
        let pong = timeout(WAIT, device.read_message()).await.unwrap().unwrap();
        assert_eq!(pong, vec![9, 5, 0, 9, 0, 0xca, 0xfe]);

        sync(&mut device).await;

        session.close();
        assert!(timeout(WAIT, task).await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_data_reaches_client_and_bad_frames_dropped() {
        let (session, reader, mut device) = session_pair(2);
        let (link, mut sent) = observed_link();
        let handle = session.mount_request(80, link).await.unwrap();
        let _created = device.read_message().await.unwrap();
        let task = spawn_ingress(&session, reader);

        // Too short to carry an address.
        device.write_message(&[1, 0]).await.unwrap();

        let mut data = Command::Data {
            address: handle.address(),
            payload: b"hello",
        }
        .encode();
        device.write_message(&data).await.unwrap();

        let message = timeout(WAIT, sent.recv()).await.unwrap().unwrap();
        assert_eq!(message, Message::binary(b"hello".to_vec()));

        // Stale generation.
        data[3] = 0x7f;
        device.write_message(&data).await.unwrap();

        // Unknown-to-us opcode on a live slot.
        let mut quota = data.clone();
        quota[0] = Opcode::ClientQuota.as_u8();
        quota[3] = 1;
        device.write_message(&quota).await.unwrap();

        sync(&mut device).await;
        assert!(sent.try_recv().is_err(), "stale frame must not reach client");
        assert_eq!(session.active_slots(), 1);

        session.close();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_closed_frees_slot() {
        let (session, reader, mut device) = session_pair(1);
        let handle = session.mount_request(80, null_link()).await.unwrap();
        let _created = device.read_message().await.unwrap();
        let task = spawn_ingress(&session, reader);

        let address = handle.address();
        let mut closed = vec![Opcode::ServerClosed.as_u8()];
        closed.extend_from_slice(&address.index.to_le_bytes());
        closed.extend_from_slice(&address.generation.get().to_le_bytes());
        device.write_message(&closed).await.unwrap();

        sync(&mut device).await;
        assert_eq!(session.active_slots(), 0);
        assert_eq!(session.generation_of(0), Some(Generation::new(2)));

        // A repeat for the old tag is stale and changes nothing.
        device.write_message(&closed).await.unwrap();
        sync(&mut device).await;
        assert_eq!(session.generation_of(0), Some(Generation::new(2)));

        session.close();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_interrupts_stuck_dispatch() {
        let (session, reader, mut device) = session_pair(1);
        let handle = session.mount_request(80, stuck_link()).await.unwrap();
        let _created = device.read_message().await.unwrap();
        let task = spawn_ingress(&session, reader);

        let data = Command::Data {
            address: handle.address(),
            payload: b"x",
        }
        .encode();
        device.write_message(&data).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        session.close();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(session.active_slots(), 0);
        assert!(device.read_message().await.is_err());
    }

    #[tokio::test]
    async fn test_link_failure_frees_everything() {
        let (session, reader, mut device) = session_pair(3);
        for port in [1, 2, 3] {
            session.mount_request(port, null_link()).await.unwrap();
            device.read_message().await.unwrap();
        }
        assert_eq!(session.active_slots(), 3);

        let task = spawn_ingress(&session, reader);
        drop(device);

        let result = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(result.is_err());
        assert_eq!(session.active_slots(), 0);
        assert_eq!(session.generation_of(2), Some(Generation::new(2)));

        let err = session.mount_request(80, null_link()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_client_write_failure_frees_slot() {
        let (session, reader, mut device) = session_pair(1);
        let (link, sent) = observed_link();
        drop(sent);
        let handle = session.mount_request(80, link).await.unwrap();
        let _created = device.read_message().await.unwrap();
        let task = spawn_ingress(&session, reader);

        let data = Command::Data {
            address: handle.address(),
            payload: b"x",
        }
        .encode();
        device.write_message(&data).await.unwrap();

        sync(&mut device).await;
        assert_eq!(session.active_slots(), 0);

        session.close();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_egress_wraps_client_messages() {
        let (session, _reader, mut device) = session_pair(1);
        let handle = session.mount_request(80, null_link()).await.unwrap();
        let address = handle.address();
        let _created = device.read_message().await.unwrap();

        let (client_tx, incoming) = client_stream();
        let egress = tokio::spawn(handle.run_egress(incoming));

        client_tx.send(Ok(Message::binary(b"abc".to_vec()))).unwrap();
        let frame = timeout(WAIT, device.read_message()).await.unwrap().unwrap();
        assert_eq!(frame, vec![1, 0, 0, 1, 0, b'a', b'b', b'c']);

        client_tx.send(Ok(Message::text("hi"))).unwrap();
        let frame = timeout(WAIT, device.read_message()).await.unwrap().unwrap();
        assert_eq!(frame, vec![1, 0, 0, 1, 0, b'h', b'i']);

        drop(client_tx);
        let closed = timeout(WAIT, device.read_message()).await.unwrap().unwrap();
        assert_eq!(closed, vec![3, 0, 0, 1, 0]);

        timeout(WAIT, egress).await.unwrap().unwrap();
        assert!(!session.free_if_current(address));
        assert_eq!(session.generation_of(0), Some(Generation::new(2)));
    }

    #[tokio::test]
    async fn test_egress_splits_large_messages() {
        let (session, _reader, mut device) = session_pair(1);
        let handle = session.mount_request(80, null_link()).await.unwrap();
        let _created = device.read_message().await.unwrap();

        let (client_tx, incoming) = client_stream();
        let egress = tokio::spawn(handle.run_egress(incoming));

        client_tx.send(Ok(Message::binary(vec![7u8; MAX_DATA_CHUNK + 10]))).unwrap();

        let first = timeout(WAIT, device.read_message()).await.unwrap().unwrap();
        let second = timeout(WAIT, device.read_message()).await.unwrap().unwrap();
        assert_eq!(first.len(), 5 + MAX_DATA_CHUNK);
        assert_eq!(second.len(), 5 + 10);

        drop(client_tx);
        timeout(WAIT, egress).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_egress_stops_quietly_when_released() {
        let (session, _reader, mut device) = session_pair(1);
        let handle = session.mount_request(80, null_link()).await.unwrap();
        let address = handle.address();
        let _created = device.read_message().await.unwrap();

        let (_client_tx, incoming) = client_stream();
        let egress = tokio::spawn(handle.run_egress(incoming));

        assert!(session.free_if_current(address));
        timeout(WAIT, egress).await.unwrap().unwrap();

        // No ClientClosed went out; the next frame the device sees is ours.
        session.send_frame(&[9]).await.unwrap();
        assert_eq!(device.read_message().await.unwrap(), vec![9]);
    }
}
