//! Peer connections and identity bookkeeping
//!
//! Each accepted socket becomes one connection: a receive-loop task that is
//! the sole reader of the framed channel, plus a writer task fed by an
//! unbounded channel so any task can queue outbound frames. Connections
//! start out quarantined — only the configured handshake packet type makes
//! it past the filter — until the session controller promotes them, after
//! which every received frame is queued unconditionally.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::event::{EventQueue, SessionEvent};
use crate::net::frame::{framed, TransportError};

/// Width of the leading packet type tag inspected during quarantine
const TAG_LEN: usize = 4;

/// Opaque identity of one accepted connection, unique for the lifetime of
/// the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        PeerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Only the configured handshake packet type passes the receive filter.
    Quarantined,
    /// Every successfully received frame is queued.
    Promoted,
}

/// State shared between a connection's handle and its tasks.
#[derive(Debug)]
struct PeerShared {
    promoted: AtomicBool,
    /// Set once the Drop event for this connection has been emitted.
    drop_emitted: AtomicBool,
    /// Signals the receive loop to close the socket and exit.
    terminated: Notify,
}

/// Cloneable handle for one connection: identity, outbound frames, and
/// lifecycle control. Safe to use from any task while the receive loop runs.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    shared: Arc<PeerShared>,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> PeerState {
        if self.shared.promoted.load(Ordering::Acquire) {
            PeerState::Promoted
        } else {
            PeerState::Quarantined
        }
    }

    /// Lift the connection out of quarantine. One-way; there is no demotion.
    pub fn promote(&self) {
        self.shared.promoted.store(true, Ordering::Release);
        log::debug!("{} promoted", self.id);
    }

    /// Queue a frame for this peer. Never blocks. Failure means the writer
    /// has already gone away; it does not terminate the connection, whose
    /// read side may still be healthy.
    pub fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.outbound
            .send(payload)
            .map_err(|_| TransportError::PeerGone)
    }

    /// Close the connection. A receive in flight unwinds through the Drop
    /// path exactly once; calling this again (or racing a receive failure)
    /// never produces a second Drop event.
    pub fn terminate(&self) {
        self.shared.terminated.notify_one();
    }
}

/// Wire an accepted socket into the core: quarantined state, writer task,
/// receive loop. The Join event is pushed before the receive loop starts so
/// it always precedes any Packet or Drop from this connection.
pub(crate) fn spawn_connection(
    stream: TcpStream,
    addr: SocketAddr,
    queue: Arc<EventQueue>,
    handshake_tag: u32,
) -> PeerHandle {
    let id = PeerId::next();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(PeerShared {
        promoted: AtomicBool::new(false),
        drop_emitted: AtomicBool::new(false),
        terminated: Notify::new(),
    });

    let handle = PeerHandle {
        id,
        addr,
        outbound: outbound_tx,
        shared: Arc::clone(&shared),
    };

    queue.push(SessionEvent::Join(handle.clone()));

    tokio::spawn(run_connection(
        id,
        addr,
        stream,
        outbound_rx,
        shared,
        queue,
        handshake_tag,
    ));

    handle
}

async fn run_connection(
    id: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<PeerShared>,
    queue: Arc<EventQueue>,
    handshake_tag: u32,
) {
    let (mut writer, mut reader) = framed(stream).split();

    // Writer task: drains the outbound channel. A write failure ends the
    // writer only; the read side decides the connection's fate.
    let write_task = tokio::spawn(async move {
        while let Some(payload) = outbound_rx.recv().await {
            if let Err(e) = writer.send(payload).await {
                log::warn!("write to {} failed: {}", addr, e);
                break;
            }
        }
    });

    // Receive loop: sole reader of the channel. Runs until the read fails,
    // the peer closes, or terminate fires.
    loop {
        tokio::select! {
            _ = shared.terminated.notified() => {
                log::debug!("{} ({}) terminated locally", id, addr);
                break;
            }
            frame = reader.next() => match frame {
                Some(Ok(payload)) => filter_frame(id, &shared, &queue, handshake_tag, payload),
                Some(Err(e)) => {
                    log::warn!("read error from {} ({}): {}", id, addr, e);
                    break;
                }
                None => {
                    log::info!("{} ({}) disconnected", id, addr);
                    break;
                }
            }
        }
    }

    write_task.abort();

    // Exactly one Drop event per connection, even when terminate races a
    // failing receive.
    if !shared.drop_emitted.swap(true, Ordering::AcqRel) {
        queue.push(SessionEvent::Drop(id));
    }
}

/// Quarantine policy: a promoted connection queues everything; a quarantined
/// one queues only frames whose leading type tag matches the handshake tag.
/// A frame too short to carry the tag is a protocol violation and is
/// discarded, never read out of bounds.
fn filter_frame(
    id: PeerId,
    shared: &PeerShared,
    queue: &EventQueue,
    handshake_tag: u32,
    payload: Bytes,
) {
    if shared.promoted.load(Ordering::Acquire) {
        queue.push(SessionEvent::Packet { peer: id, payload });
        return;
    }

    if payload.len() < TAG_LEN {
        log::debug!(
            "{}: discarding {}-byte quarantined frame, too short for a type tag",
            id,
            payload.len()
        );
        return;
    }

    let tag = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if tag == handshake_tag {
        queue.push(SessionEvent::Packet { peer: id, payload });
    } else {
        log::trace!("{}: discarding quarantined frame with tag {}", id, tag);
    }
}

/// Identity bookkeeping for every live connection.
///
/// The dispatch pump registers handles on Join and unregisters them after
/// Drop; anything holding the registry can look peers up, send, broadcast,
/// promote, or terminate them.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PeerId, PeerHandle>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PeerId, PeerHandle>> {
        self.peers.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn add(&self, handle: PeerHandle) {
        log::debug!("registered {} ({})", handle.id(), handle.addr());
        self.write().insert(handle.id(), handle);
    }

    pub(crate) fn remove(&self, id: PeerId) {
        if self.write().remove(&id).is_some() {
            log::debug!("unregistered {}", id);
        }
    }

    pub fn get(&self, id: PeerId) -> Option<PeerHandle> {
        self.read().get(&id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.read().len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.read().keys().copied().collect()
    }

    pub fn handles(&self) -> Vec<PeerHandle> {
        self.read().values().cloned().collect()
    }

    /// Promote a connection by id. Returns false for an unknown peer.
    pub fn promote(&self, id: PeerId) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.promote();
                true
            }
            None => false,
        }
    }

    /// Send a frame to one peer.
    pub fn send_to(&self, id: PeerId, payload: Bytes) -> Result<(), TransportError> {
        match self.get(id) {
            Some(handle) => handle.send(payload),
            None => Err(TransportError::Closed),
        }
    }

    /// Send a frame to every registered peer.
    pub fn broadcast(&self, payload: Bytes) {
        for handle in self.read().values() {
            if let Err(e) = handle.send(payload.clone()) {
                log::warn!("failed to send to {}: {}", handle.id(), e);
            }
        }
    }

    /// Send a frame to every registered peer except one.
    pub fn broadcast_except(&self, payload: Bytes, except: PeerId) {
        for handle in self.read().values() {
            if handle.id() == except {
                continue;
            }
            if let Err(e) = handle.send(payload.clone()) {
                log::warn!("failed to send to {}: {}", handle.id(), e);
            }
        }
    }

    /// Terminate every registered connection.
    pub fn terminate_all(&self) {
        for handle in self.read().values() {
            handle.terminate();
        }
    }
}

#[cfg(test)]
pub(crate) fn test_handle() -> (PeerHandle, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = PeerHandle {
        id: PeerId::next(),
        addr: "127.0.0.1:0".parse().expect("static addr"),
        outbound: tx,
        shared: Arc::new(PeerShared {
            promoted: AtomicBool::new(false),
            drop_emitted: AtomicBool::new(false),
            terminated: Notify::new(),
        }),
    };
    (handle, rx)
}
