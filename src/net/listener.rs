//! Listening socket and accept loop
//!
//! Accepts incoming participants, wires each socket into a quarantined
//! connection, and announces the arrival with a Join event.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::event::EventQueue;
use crate::net::peer::spawn_connection;

/// The bound listening socket.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind the listening socket. Failure is fatal to the listen loop and is
    /// surfaced once to the caller; there is no retry. Port 0 picks an
    /// ephemeral port.
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Run the accept loop until `shutdown` fires. Each accepted socket
    /// becomes a quarantined connection announced by a Join event. Shutting
    /// the loop down closes only the listening socket; already-accepted
    /// connections are unaffected.
    pub(crate) async fn run(
        self,
        queue: Arc<EventQueue>,
        handshake_tag: u32,
        shutdown: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    log::info!("listener on {} shutting down", self.local_addr);
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::info!("incoming connection from {}", addr);
                        // Pushes the Join event before its receive loop runs.
                        spawn_connection(stream, addr, Arc::clone(&queue), handshake_tag);
                    }
                    Err(e) => {
                        // Transient; keep accepting.
                        log::error!("accept error: {}", e);
                    }
                }
            }
        }
    }
}
