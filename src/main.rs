//! Session relay host
//!
//! Hosts a session and relays every promoted participant's packets to the
//! other promoted participants. A quarantined peer's first deliverable
//! packet is its handshake; it gets promoted and acknowledged with an echo
//! of that handshake.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use session_relay::{
    HostConfig, PeerHandle, PeerId, PeerState, ProvenanceContext, SessionController, SessionHost,
};

#[derive(Parser)]
#[command(name = "session-relay")]
#[command(version = "0.1.0")]
#[command(about = "Host a session and relay framed packets between participants", long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9377)]
    port: u16,

    /// Packet type tag accepted from quarantined connections
    #[arg(long, default_value_t = 1)]
    handshake_tag: u32,
}

/// Relays packets between participants.
struct RelayController {
    peers: HashMap<PeerId, PeerHandle>,
    provenance: Arc<ProvenanceContext>,
}

impl RelayController {
    fn new(provenance: Arc<ProvenanceContext>) -> Self {
        Self {
            peers: HashMap::new(),
            provenance,
        }
    }
}

impl SessionController for RelayController {
    fn on_join(&mut self, peer: &PeerHandle) {
        log::info!("{} joined from {} (quarantined)", peer.id(), peer.addr());
        self.peers.insert(peer.id(), peer.clone());
    }

    fn on_packet(&mut self, peer: PeerId, payload: Bytes) {
        let Some(handle) = self.peers.get(&peer) else {
            return;
        };

        // The only packet a quarantined peer can deliver is its handshake.
        if handle.state() == PeerState::Quarantined {
            handle.promote();
            log::info!("{} promoted after handshake", peer);
            if let Err(e) = handle.send(payload) {
                log::warn!("handshake ack to {} failed: {}", peer, e);
            }
            return;
        }

        // A bulk resynchronization already carries this state; relaying it
        // on top would echo it to peers that are being resynced anyway.
        if self.provenance.is_host_dumping() {
            log::debug!("{}: packet during host dump, not relayed", peer);
            return;
        }

        for (id, other) in &self.peers {
            if *id == peer || other.state() != PeerState::Promoted {
                continue;
            }
            if let Err(e) = other.send(payload.clone()) {
                log::warn!("relay to {} failed: {}", id, e);
            }
        }
    }

    fn on_drop(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        log::info!("{} left ({} participants remain)", peer, self.peers.len());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = HostConfig {
        port: cli.port,
        handshake_tag: cli.handshake_tag,
    };
    let provenance = Arc::new(ProvenanceContext::new());
    let controller = RelayController::new(Arc::clone(&provenance));

    let host = SessionHost::start_with_provenance(config, controller, provenance).await?;
    log::info!(
        "relay host on port {} (handshake tag {})",
        host.local_port(),
        cli.handshake_tag
    );

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    host.shutdown().await;

    Ok(())
}
