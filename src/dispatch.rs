//! Event dispatch into the single consumption context
//!
//! The pump is the only consumer of the event queue. It delivers exactly one
//! event at a time, in push order, into the session controller; everything
//! downstream of a callback can therefore assume no concurrent mutation of
//! shared session state. While dispatch is disabled the pump still wakes on
//! pushes but discards everything queued instead of delivering it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::{EventQueue, SessionEvent};
use crate::net::peer::{PeerHandle, PeerId, PeerRegistry};
use crate::provenance::ProvenanceContext;

/// The session controller's boundary. All three callbacks run inside the
/// single consumption context, one event at a time, in arrival order.
pub trait SessionController: Send + 'static {
    /// A connection was accepted (still quarantined). Its handle has already
    /// been registered; keeping a clone is how the controller addresses the
    /// peer later.
    fn on_join(&mut self, peer: &PeerHandle);

    /// A frame passed the connection's receive filter. Runs inside the
    /// net-packet provenance scope, so state changes applied here are
    /// recognizable as network-originated and can skip re-broadcast.
    fn on_packet(&mut self, peer: PeerId, payload: Bytes);

    /// The connection is gone; emitted exactly once per connection. The
    /// handle is unregistered after this returns.
    fn on_drop(&mut self, peer: PeerId);
}

/// Controls a running dispatch pump.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    enabled: Arc<AtomicBool>,
    shutdown: mpsc::Sender<()>,
}

impl DispatchHandle {
    /// Toggle delivery versus draining, effective at the next wake. The
    /// pump keeps running either way; re-enabling does not resurrect events
    /// drained while disabled.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Stop the pump task.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(()).await;
    }
}

/// Spawn the pump task around a controller.
pub(crate) fn spawn_pump<C: SessionController>(
    queue: Arc<EventQueue>,
    registry: Arc<PeerRegistry>,
    provenance: Arc<ProvenanceContext>,
    mut controller: C,
) -> (DispatchHandle, JoinHandle<()>) {
    let enabled = Arc::new(AtomicBool::new(true));
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    let handle = DispatchHandle {
        enabled: Arc::clone(&enabled),
        shutdown: shutdown_tx,
    };

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    log::info!("dispatch pump shutting down");
                    break;
                }
                _ = queue.wait_nonempty() => {
                    if enabled.load(Ordering::Acquire) {
                        if let Some(event) = queue.pop_one() {
                            deliver(&mut controller, &registry, &provenance, event);
                        }
                    } else {
                        let dropped = queue.drain_all();
                        if dropped > 0 {
                            log::debug!("dispatch disabled, drained {} events", dropped);
                        }
                    }
                }
            }
        }
    });

    (handle, task)
}

fn deliver<C: SessionController>(
    controller: &mut C,
    registry: &PeerRegistry,
    provenance: &ProvenanceContext,
    event: SessionEvent,
) {
    match event {
        SessionEvent::Join(peer) => {
            registry.add(peer.clone());
            controller.on_join(&peer);
        }
        SessionEvent::Packet { peer, payload } => {
            let _scope = provenance.begin_net_packet();
            controller.on_packet(peer, payload);
        }
        SessionEvent::Drop(peer) => {
            controller.on_drop(peer);
            registry.remove(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::peer::test_handle;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Join(PeerId),
        Packet(PeerId, Bytes),
        Drop(PeerId),
    }

    #[derive(Clone)]
    struct Recorder {
        seen: Arc<Mutex<Vec<Seen>>>,
        net_packet_flag: Arc<Mutex<Vec<bool>>>,
        provenance: Arc<ProvenanceContext>,
    }

    impl Recorder {
        fn new(provenance: Arc<ProvenanceContext>) -> Self {
            Self {
                seen: Arc::new(Mutex::new(Vec::new())),
                net_packet_flag: Arc::new(Mutex::new(Vec::new())),
                provenance,
            }
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl SessionController for Recorder {
        fn on_join(&mut self, peer: &PeerHandle) {
            self.seen.lock().unwrap().push(Seen::Join(peer.id()));
        }

        fn on_packet(&mut self, peer: PeerId, payload: Bytes) {
            self.net_packet_flag
                .lock()
                .unwrap()
                .push(self.provenance.is_net_packet());
            self.seen.lock().unwrap().push(Seen::Packet(peer, payload));
        }

        fn on_drop(&mut self, peer: PeerId) {
            self.seen.lock().unwrap().push(Seen::Drop(peer));
        }
    }

    fn pump_with_recorder() -> (
        Arc<EventQueue>,
        Arc<PeerRegistry>,
        Arc<ProvenanceContext>,
        DispatchHandle,
        Recorder,
    ) {
        let queue = Arc::new(EventQueue::new());
        let registry = Arc::new(PeerRegistry::new());
        let provenance = Arc::new(ProvenanceContext::new());
        let recorder = Recorder::new(Arc::clone(&provenance));
        let (handle, _task) = spawn_pump(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&provenance),
            recorder.clone(),
        );
        (queue, registry, provenance, handle, recorder)
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        timeout(Duration::from_secs(2), async {
            while !cond() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    #[tokio::test]
    async fn test_delivers_in_push_order() {
        let (queue, _registry, _provenance, _handle, recorder) = pump_with_recorder();

        let peer = PeerId::next();
        for b in 0..10u8 {
            queue.push(SessionEvent::Packet {
                peer,
                payload: Bytes::copy_from_slice(&[b]),
            });
        }

        wait_for("all packets", || recorder.seen().len() == 10).await;
        let seen = recorder.seen();
        for (i, event) in seen.iter().enumerate() {
            assert_eq!(*event, Seen::Packet(peer, Bytes::copy_from_slice(&[i as u8])));
        }
    }

    #[tokio::test]
    async fn test_disabled_pump_drains_instead_of_delivering() {
        let (queue, _registry, _provenance, handle, recorder) = pump_with_recorder();

        handle.set_enabled(false);
        assert!(!handle.is_enabled());

        let peer = PeerId::next();
        for b in 0..5u8 {
            queue.push(SessionEvent::Packet {
                peer,
                payload: Bytes::copy_from_slice(&[b]),
            });
        }

        // The pump wakes and throws the batch away.
        wait_for("queue drained", || !queue.has_pending()).await;
        assert!(recorder.seen().is_empty());

        // Re-enabling delivers only what is pushed afterwards.
        handle.set_enabled(true);
        queue.push(SessionEvent::Packet {
            peer,
            payload: Bytes::from_static(b"marker"),
        });
        wait_for("marker", || !recorder.seen().is_empty()).await;
        assert_eq!(
            recorder.seen(),
            vec![Seen::Packet(peer, Bytes::from_static(b"marker"))]
        );
    }

    #[tokio::test]
    async fn test_join_and_drop_maintain_registry() {
        let (queue, registry, _provenance, _handle, recorder) = pump_with_recorder();

        let (peer, _rx) = test_handle();
        queue.push(SessionEvent::Join(peer.clone()));
        wait_for("join", || !recorder.seen().is_empty()).await;
        assert_eq!(registry.peer_count(), 1);
        assert!(registry.get(peer.id()).is_some());

        queue.push(SessionEvent::Drop(peer.id()));
        wait_for("drop", || recorder.seen().len() == 2).await;
        assert_eq!(registry.peer_count(), 0);
        assert_eq!(
            recorder.seen(),
            vec![Seen::Join(peer.id()), Seen::Drop(peer.id())]
        );
    }

    #[tokio::test]
    async fn test_packet_runs_inside_net_packet_scope() {
        let (queue, _registry, provenance, _handle, recorder) = pump_with_recorder();

        queue.push(SessionEvent::Packet {
            peer: PeerId::next(),
            payload: Bytes::from_static(b"p"),
        });
        wait_for("packet", || !recorder.seen().is_empty()).await;

        assert_eq!(*recorder.net_packet_flag.lock().unwrap(), vec![true]);
        // Scope closes with the callback.
        assert!(!provenance.is_net_packet());
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_pump() {
        let queue = Arc::new(EventQueue::new());
        let registry = Arc::new(PeerRegistry::new());
        let provenance = Arc::new(ProvenanceContext::new());
        let recorder = Recorder::new(Arc::clone(&provenance));
        let (handle, task) = spawn_pump(
            Arc::clone(&queue),
            registry,
            provenance,
            recorder.clone(),
        );

        handle.shutdown().await;
        timeout(Duration::from_secs(2), task)
            .await
            .expect("pump did not stop")
            .unwrap();

        // Nothing is delivered after shutdown.
        queue.push(SessionEvent::Packet {
            peer: PeerId::next(),
            payload: Bytes::from_static(b"late"),
        });
        sleep(Duration::from_millis(50)).await;
        assert!(recorder.seen().is_empty());
    }
}
