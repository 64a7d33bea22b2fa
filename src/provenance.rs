//! Mutation provenance tracking
//!
//! Records *why* the current state mutation is happening — applying a
//! network packet, replaying a bulk host resynchronization, or loading a
//! local file — so that downstream handlers can decide whether a locally
//! observed change should be re-broadcast to peers or applied silently.
//! Without this, a change that arrived from the network would be echoed
//! right back out and amplify forever.
//!
//! Spans are marked with RAII guards over per-kind depth counters, so
//! same-kind scopes nest safely and an early return cannot leave a flag
//! stuck.

use std::sync::atomic::{AtomicUsize, Ordering};

/// The originating cause of a state mutation span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvenanceKind {
    /// Bulk resynchronization pushed by the session host.
    HostDump,
    /// Loading state from a local file.
    FileLoad,
    /// Applying a packet received from the network.
    NetPacket,
}

/// Tracks which provenance kinds are currently active.
///
/// The three kinds are mutually independent; any combination may be active
/// at once. Shared as `Arc<ProvenanceContext>`; spans are opened from the
/// consumption context, predicates may be read anywhere.
#[derive(Debug, Default)]
pub struct ProvenanceContext {
    host_dump: AtomicUsize,
    file_load: AtomicUsize,
    net_packet: AtomicUsize,
}

impl ProvenanceContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: ProvenanceKind) -> &AtomicUsize {
        match kind {
            ProvenanceKind::HostDump => &self.host_dump,
            ProvenanceKind::FileLoad => &self.file_load,
            ProvenanceKind::NetPacket => &self.net_packet,
        }
    }

    /// Open a span of the given kind. The matching flag reads true until
    /// the returned guard (and any nested ones) drop.
    pub fn begin(&self, kind: ProvenanceKind) -> ProvenanceScope<'_> {
        ProvenanceScope::enter(self.counter(kind))
    }

    /// Mark the enclosed span as part of a bulk host resynchronization.
    pub fn begin_host_dump(&self) -> ProvenanceScope<'_> {
        self.begin(ProvenanceKind::HostDump)
    }

    /// Mark the enclosed span as loading state from a local file.
    pub fn begin_file_load(&self) -> ProvenanceScope<'_> {
        self.begin(ProvenanceKind::FileLoad)
    }

    /// Mark the enclosed span as applying a received network packet.
    pub fn begin_net_packet(&self) -> ProvenanceScope<'_> {
        self.begin(ProvenanceKind::NetPacket)
    }

    pub fn is_active(&self, kind: ProvenanceKind) -> bool {
        self.counter(kind).load(Ordering::Relaxed) > 0
    }

    pub fn is_host_dumping(&self) -> bool {
        self.is_active(ProvenanceKind::HostDump)
    }

    pub fn is_file_loading(&self) -> bool {
        self.is_active(ProvenanceKind::FileLoad)
    }

    pub fn is_net_packet(&self) -> bool {
        self.is_active(ProvenanceKind::NetPacket)
    }
}

/// RAII guard for one provenance span.
#[must_use = "the provenance flag clears as soon as this scope is dropped"]
#[derive(Debug)]
pub struct ProvenanceScope<'a> {
    depth: &'a AtomicUsize,
}

impl<'a> ProvenanceScope<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::Relaxed);
        Self { depth }
    }
}

impl Drop for ProvenanceScope<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}
