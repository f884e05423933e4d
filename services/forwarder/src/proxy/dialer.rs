//! Ordered failover dialing.
//!
//! Candidates are tried strictly in order with a bounded per-attempt timeout.
//! The first successful connection wins; there is no load balancing and no
//! retry of the list within one dial.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use portrelay_networking::{configure_keepalive, Endpoint, KeepaliveProfile};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::stats::ForwarderStats;

/// Default per-attempt connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a failover dial.
#[derive(Debug)]
pub enum DialOutcome {
    /// A candidate accepted the connection.
    Connected {
        stream: TcpStream,
        endpoint: Endpoint,
        /// Number of candidates tried, including the one that succeeded.
        attempts: usize,
    },
    /// Every candidate failed. Not an error for the service, only for the client.
    Exhausted { attempted: Vec<Endpoint> },
}

/// Dials an ordered list of candidates.
#[derive(Debug, Clone)]
pub struct FailoverDialer {
    connect_timeout: Duration,
    keepalive: KeepaliveProfile,
    stats: Arc<ForwarderStats>,
}

impl FailoverDialer {
    /// Create a new dialer.
    pub fn new(
        connect_timeout: Duration,
        keepalive: KeepaliveProfile,
        stats: Arc<ForwarderStats>,
    ) -> Self {
        Self {
            connect_timeout,
            keepalive,
            stats,
        }
    }

    /// Try each candidate in order on behalf of `peer_addr`.
    pub async fn dial(&self, candidates: &[Endpoint], peer_addr: SocketAddr) -> DialOutcome {
        for (index, candidate) in candidates.iter().enumerate() {
            match self.try_connect(candidate).await {
                Ok(stream) => {
                    configure_keepalive(&stream, &self.keepalive);
                    self.stats.backends_connected.fetch_add(1, Ordering::Relaxed);
                    return DialOutcome::Connected {
                        stream,
                        endpoint: candidate.clone(),
                        attempts: index + 1,
                    };
                }
                Err(e) => {
                    self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        peer_addr = %peer_addr,
                        candidate = %candidate,
                        error = %e,
                        "Backend connection failed"
                    );
                }
            }
        }

        DialOutcome::Exhausted {
            attempted: candidates.to_vec(),
        }
    }

    /// Attempt to connect to a single candidate.
    async fn try_connect(&self, candidate: &Endpoint) -> io::Result<TcpStream> {
        debug!(candidate = %candidate, "Connecting to backend");

        match timeout(self.connect_timeout, candidate.connect()).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}
