//! Transport layer
//!
//! Everything that touches a socket:
//! - Length-prefixed frame codec over TCP
//! - Per-connection receive/writer tasks with quarantine filtering
//! - The listening socket and accept loop
//! - Identity bookkeeping for live connections

pub mod frame;
pub mod listener;
pub mod peer;

pub use frame::{framed, FrameCodec, FramedChannel, TransportError, LEN_PREFIX};
pub use listener::Listener;
pub use peer::{PeerHandle, PeerId, PeerRegistry, PeerState};
