//! In-process forwarder counters.
//!
//! Counters are relaxed atomics shared by every session of one supervisor.
//! They are never exported; the binary logs a snapshot on exit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use portrelay_networking::Endpoint;
use tracing::debug;

/// Statistics for a forwarder.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    /// Total client connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions with a connected backend and at least one live pump.
    pub sessions_active: AtomicU64,
    /// Sessions fully closed.
    pub sessions_closed: AtomicU64,
    /// Successful backend dials.
    pub backends_connected: AtomicU64,
    /// Individual candidate dial failures.
    pub dial_failures: AtomicU64,
    /// Clients dropped because every candidate failed.
    pub clients_exhausted: AtomicU64,
    /// Listener relaunches after a fault.
    pub supervisor_restarts: AtomicU64,
    /// Bytes relayed client -> backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend -> client.
    pub bytes_from_backend: AtomicU64,
}

impl ForwarderStats {
    /// Copy the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            backends_connected: self.backends_connected.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            clients_exhausted: self.clients_exhausted.load(Ordering::Relaxed),
            supervisor_restarts: self.supervisor_restarts.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend: self.bytes_from_backend.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ForwarderStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub sessions_active: u64,
    pub sessions_closed: u64,
    pub backends_connected: u64,
    pub dial_failures: u64,
    pub clients_exhausted: u64,
    pub supervisor_restarts: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// Marks a session as active until the last pump holding it is dropped.
pub(crate) struct SessionGuard {
    stats: Arc<ForwarderStats>,
    peer_addr: SocketAddr,
    backend: Endpoint,
}

impl SessionGuard {
    pub(crate) fn new(stats: Arc<ForwarderStats>, peer_addr: SocketAddr, backend: Endpoint) -> Self {
        stats.sessions_active.fetch_add(1, Ordering::Relaxed);
        Self {
            stats,
            peer_addr,
            backend,
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
        debug!(
            peer_addr = %self.peer_addr,
            backend = %self.backend,
            "Session closed"
        );
    }
}
