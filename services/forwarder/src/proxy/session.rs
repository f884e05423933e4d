//! Per-client session handling.
//!
//! A session owns one accepted client connection. It dials the rule's
//! candidates and, on success, hands both sockets to a pair of pumps running
//! on their own tasks. The pumps own socket teardown; the session returns as
//! soon as they are spawned.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use portrelay_networking::{configure_keepalive, KeepaliveProfile};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, error, info, Instrument};

use super::dialer::{DialOutcome, FailoverDialer};
use super::pump::{pump, Direction, RelayPolicy, SessionLink};
use super::rule::{EndpointList, ForwardingRule};
use super::stats::{ForwarderStats, SessionGuard};

/// Starts sessions for accepted clients of one forwarding rule.
#[derive(Debug, Clone)]
pub struct SessionManager {
    rule: Arc<ForwardingRule>,
    dialer: FailoverDialer,
    policy: RelayPolicy,
    keepalive: KeepaliveProfile,
    stats: Arc<ForwarderStats>,
}

impl SessionManager {
    /// Create a session manager.
    pub fn new(
        rule: Arc<ForwardingRule>,
        dialer: FailoverDialer,
        policy: RelayPolicy,
        keepalive: KeepaliveProfile,
        stats: Arc<ForwarderStats>,
    ) -> Self {
        Self {
            rule,
            dialer,
            policy,
            keepalive,
            stats,
        }
    }

    /// Dial a backend for `client` and start relaying.
    ///
    /// Returns once the pumps are spawned, or once the client has been
    /// dropped because no candidate was reachable.
    pub async fn start(&self, client: TcpStream, peer_addr: SocketAddr) {
        configure_keepalive(&client, &self.keepalive);

        let (backend, endpoint, attempts) =
            match self.dialer.dial(self.rule.candidates(), peer_addr).await {
                DialOutcome::Connected {
                    stream,
                    endpoint,
                    attempts,
                } => (stream, endpoint, attempts),
                DialOutcome::Exhausted { attempted } => {
                    self.stats.clients_exhausted.fetch_add(1, Ordering::Relaxed);
                    error!(
                        peer_addr = %peer_addr,
                        attempted = %EndpointList(&attempted),
                        "No candidate reachable, dropping client"
                    );
                    return;
                }
            };

        info!(
            peer_addr = %peer_addr,
            backend = %endpoint,
            attempts,
            "Connected to backend"
        );

        let guard = Arc::new(SessionGuard::new(
            Arc::clone(&self.stats),
            peer_addr,
            endpoint,
        ));
        let link = SessionLink::new();
        let (client_read, client_write) = client.into_split();
        let (backend_read, backend_write) = backend.into_split();

        self.spawn_pump(
            client_read,
            backend_write,
            Direction::ClientToBackend,
            link.clone(),
            Arc::clone(&guard),
        );
        self.spawn_pump(
            backend_read,
            client_write,
            Direction::BackendToClient,
            link,
            guard,
        );
    }

    fn spawn_pump(
        &self,
        source: OwnedReadHalf,
        destination: OwnedWriteHalf,
        direction: Direction,
        link: SessionLink,
        guard: Arc<SessionGuard>,
    ) {
        let policy = self.policy;
        let stats = Arc::clone(&self.stats);

        tokio::spawn(
            async move {
                let report = pump(source, destination, direction, policy, link, stats).await;
                debug!(
                    direction = %report.direction,
                    bytes = report.bytes,
                    outcome = ?report.outcome,
                    "Pump stopped"
                );
                drop(guard);
            }
            .in_current_span(),
        );
    }
}
