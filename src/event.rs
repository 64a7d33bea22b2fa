//! Cross-task event queue
//!
//! The FIFO boundary between the network-facing tasks (per-connection
//! receive loops, the accept loop) and the single consumption context driven
//! by the dispatch pump. Any number of producers push; only the pump pops.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::net::peer::{PeerHandle, PeerId};

/// One queued network event. Insertion order is dispatch order; there is no
/// priority or reordering.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connection was accepted; carries its handle (still quarantined).
    Join(PeerHandle),
    /// A complete frame arrived on a connection and passed its filter.
    Packet { peer: PeerId, payload: Bytes },
    /// The connection ended. Emitted exactly once per connection.
    Drop(PeerId),
}

/// Unbounded FIFO with a cooperative wake.
///
/// `push` never blocks, never fails, and never drops an event; backpressure
/// is deliberately not applied to the network tasks. The only lossy
/// operation is [`drain_all`](EventQueue::drain_all).
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<SessionEvent>>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SessionEvent>> {
        // A poisoned lock means a producer panicked mid-push; the deque
        // itself is still usable.
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event and wake at most one waiter.
    pub fn push(&self, event: SessionEvent) {
        self.lock().push_back(event);
        self.notify.notify_one();
    }

    /// Remove and return the oldest event, or `None` without blocking.
    /// Consumer side only.
    pub fn pop_one(&self) -> Option<SessionEvent> {
        self.lock().pop_front()
    }

    /// Non-blocking emptiness check.
    pub fn has_pending(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Discard every queued event without dispatching it, returning how many
    /// were thrown away.
    ///
    /// Lossy by design: used while dispatch is suspended. It cancels only
    /// not-yet-dispatched events, never in-flight handler work.
    pub fn drain_all(&self) -> usize {
        let mut events = self.lock();
        let dropped = events.len();
        events.clear();
        dropped
    }

    /// Wait until the queue is non-empty. Returns immediately if it already
    /// is; otherwise parks until a `push` wakes us.
    pub async fn wait_nonempty(&self) {
        loop {
            // Register interest before re-checking so a push between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            if self.has_pending() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn packet(peer: PeerId, byte: u8) -> SessionEvent {
        SessionEvent::Packet {
            peer,
            payload: Bytes::copy_from_slice(&[byte]),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new();
        let peer = PeerId::next();
        for b in 0..4u8 {
            queue.push(packet(peer, b));
        }

        for b in 0..4u8 {
            match queue.pop_one() {
                Some(SessionEvent::Packet { payload, .. }) => assert_eq!(payload[0], b),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(queue.pop_one().is_none());
    }

    #[test]
    fn test_has_pending_and_drain_all() {
        let queue = EventQueue::new();
        assert!(!queue.has_pending());

        let peer = PeerId::next();
        queue.push(packet(peer, 1));
        queue.push(packet(peer, 2));
        assert!(queue.has_pending());

        assert_eq!(queue.drain_all(), 2);
        assert!(!queue.has_pending());
        assert_eq!(queue.drain_all(), 0);
    }

    #[test]
    fn test_concurrent_producers_preserve_per_producer_order() {
        let queue = Arc::new(EventQueue::new());
        let producers = 4;
        let per_producer = 100u8;

        let handles: Vec<_> = (0..producers)
            .map(|_| {
                let queue = queue.clone();
                let peer = PeerId::next();
                std::thread::spawn(move || {
                    for seq in 0..per_producer {
                        queue.push(packet(peer, seq));
                    }
                    peer
                })
            })
            .collect();

        let ids: Vec<PeerId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Each producer's stream must come out in its own push order.
        let mut last_seq: std::collections::HashMap<PeerId, i32> =
            ids.iter().map(|id| (*id, -1)).collect();
        let mut total = 0;
        while let Some(event) = queue.pop_one() {
            let SessionEvent::Packet { peer, payload } = event else {
                panic!("unexpected event");
            };
            let seq = payload[0] as i32;
            assert!(seq > last_seq[&peer], "reordered within one producer");
            last_seq.insert(peer, seq);
            total += 1;
        }
        assert_eq!(total, producers * per_producer as usize);
    }

    #[tokio::test]
    async fn test_wait_nonempty_wakes_on_push() {
        let queue = Arc::new(EventQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.wait_nonempty().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(packet(PeerId::next(), 0));

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter never woke")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_nonempty_returns_immediately_when_pending() {
        let queue = EventQueue::new();
        queue.push(packet(PeerId::next(), 0));

        tokio::time::timeout(Duration::from_millis(100), queue.wait_nonempty())
            .await
            .expect("should not wait");
    }
}
