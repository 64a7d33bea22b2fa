//! Session-Relay: a peer-networking core for hosting multi-participant
//! sessions over framed TCP.
//!
//! One process acts as the session host for several remote participants,
//! relaying opaque length-framed messages between sockets and a single
//! logical state-mutation context. Features:
//! - Length-prefixed binary framing (big-endian `u32` length + payload)
//! - Per-connection receive tasks with quarantine/promotion lifecycle
//! - An unbounded cross-task event queue with strict FIFO dispatch
//! - A dispatch pump delivering one event at a time into one controller
//! - Provenance tracking (host dump / file load / net packet) so state
//!   handlers can suppress network echo loops
//!
//! # Example
//!
//! ```ignore
//! use session_relay::{HostConfig, SessionHost};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = HostConfig { port: 9377, handshake_tag: 1 };
//!     let host = SessionHost::start(config, MyController::new())
//!         .await
//!         .unwrap();
//!     tokio::signal::ctrl_c().await.unwrap();
//!     host.shutdown().await;
//! }
//! ```

pub mod dispatch;
pub mod event;
pub mod host;
pub mod net;
pub mod provenance;

pub use dispatch::{DispatchHandle, SessionController};
pub use event::{EventQueue, SessionEvent};
pub use host::{HostConfig, HostError, SessionHost};
pub use net::{
    framed, FrameCodec, FramedChannel, Listener, PeerHandle, PeerId, PeerRegistry, PeerState,
    TransportError,
};
pub use provenance::{ProvenanceContext, ProvenanceKind, ProvenanceScope};
