//! Session host composition
//!
//! Ties the core together: bind the listener, spawn the accept loop and the
//! dispatch pump, and hand the session controller the consumption context.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::dispatch::{spawn_pump, DispatchHandle, SessionController};
use crate::event::EventQueue;
use crate::net::listener::Listener;
use crate::net::peer::PeerRegistry;
use crate::provenance::ProvenanceContext;

/// Errors starting a session host.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to bind listen port: {0}")]
    Bind(#[source] std::io::Error),
}

/// Session host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Port to listen on (0 picks an ephemeral port).
    pub port: u16,
    /// The one packet type tag a quarantined connection may send.
    pub handshake_tag: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: 9377,
            handshake_tag: 1,
        }
    }
}

/// A running session host: listening socket, per-connection tasks, and the
/// dispatch pump feeding one controller.
pub struct SessionHost {
    config: HostConfig,
    local_addr: SocketAddr,
    queue: Arc<EventQueue>,
    registry: Arc<PeerRegistry>,
    provenance: Arc<ProvenanceContext>,
    dispatch: DispatchHandle,
    listener_shutdown: Arc<Notify>,
    listener_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

impl SessionHost {
    /// Start a host with its own provenance context.
    pub async fn start<C: SessionController>(
        config: HostConfig,
        controller: C,
    ) -> Result<Self, HostError> {
        Self::start_with_provenance(config, controller, Arc::new(ProvenanceContext::new())).await
    }

    /// Start a host around a shared provenance context, for controllers that
    /// open host-dump or file-load scopes of their own.
    pub async fn start_with_provenance<C: SessionController>(
        config: HostConfig,
        controller: C,
        provenance: Arc<ProvenanceContext>,
    ) -> Result<Self, HostError> {
        let listener = Listener::bind(config.port).await.map_err(HostError::Bind)?;
        let local_addr = listener.local_addr();

        let queue = Arc::new(EventQueue::new());
        let registry = Arc::new(PeerRegistry::new());

        let (dispatch, pump_task) = spawn_pump(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&provenance),
            controller,
        );

        let listener_shutdown = Arc::new(Notify::new());
        let listener_task = tokio::spawn(listener.run(
            Arc::clone(&queue),
            config.handshake_tag,
            Arc::clone(&listener_shutdown),
        ));

        log::info!("session host started on {}", local_addr);

        Ok(Self {
            config,
            local_addr,
            queue,
            registry,
            provenance,
            dispatch,
            listener_shutdown,
            listener_task,
            pump_task,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Identity bookkeeping for live connections (send, broadcast, promote,
    /// terminate by id).
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn provenance(&self) -> &Arc<ProvenanceContext> {
        &self.provenance
    }

    /// Dispatch control: suspend/resume delivery.
    pub fn dispatch(&self) -> &DispatchHandle {
        &self.dispatch
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Stop accepting, close every live connection, and stop the pump.
    /// Events still queued at this point are not delivered.
    pub async fn shutdown(self) {
        self.listener_shutdown.notify_one();
        self.registry.terminate_all();
        self.dispatch.shutdown().await;

        let _ = self.listener_task.await;
        let _ = self.pump_task.await;
        log::info!("session host on {} stopped", self.local_addr);
    }
}
