//! Unidirectional relay pumps.
//!
//! A session runs two pumps, one per direction, each on its own task. A pump
//! owns the read half of its source and the write half of its destination.
//!
//! Termination policy:
//! - EOF on the source half-closes this direction only.
//! - An idle source either half-closes this direction or tears down the
//!   whole session, depending on [`RelayPolicy::close_upon_timeout`].
//! - Any other read error and any write error tear down the whole session.
//!
//! Teardown shuts both sockets down in both directions and raises the
//! session's [`SessionLink`], which stops the opposite pump even when it is
//! blocked on a write.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::stats::ForwarderStats;

/// Size of the per-pump copy buffer.
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Default patience before an idle source times out.
pub const DEFAULT_PATIENCE: Duration = Duration::from_secs(60);

/// Timeout behavior for a session's pumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPolicy {
    /// How long a read or write may stall. `None` waits forever.
    pub patience: Option<Duration>,
    /// Tear down the whole session when a source goes idle.
    pub close_upon_timeout: bool,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            patience: Some(DEFAULT_PATIENCE),
            close_upon_timeout: false,
        }
    }
}

/// Which way a pump moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    fn counter(self, stats: &ForwarderStats) -> &AtomicU64 {
        match self {
            Direction::ClientToBackend => &stats.bytes_to_backend,
            Direction::BackendToClient => &stats.bytes_from_backend,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client->backend"),
            Direction::BackendToClient => f.write_str("backend->client"),
        }
    }
}

/// How a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Source reached end of stream; this direction was half-closed.
    Eof,
    /// Source went idle; only this direction was closed.
    IdleHalfClose,
    /// Source went idle and the session was torn down.
    IdleTeardown,
    /// An I/O error tore down the session.
    Failed,
    /// The opposite pump tore down the session.
    Aborted,
}

/// Summary returned when a pump stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub direction: Direction,
    pub bytes: u64,
    pub outcome: PumpOutcome,
}

/// Teardown signal shared by the two pumps of one session.
#[derive(Debug, Clone)]
pub struct SessionLink {
    torn_down: Arc<watch::Sender<bool>>,
}

impl SessionLink {
    /// Create a link for a new session.
    pub fn new() -> Self {
        let (torn_down, _) = watch::channel(false);
        Self {
            torn_down: Arc::new(torn_down),
        }
    }

    /// Whether either pump has torn the session down.
    pub fn is_torn_down(&self) -> bool {
        *self.torn_down.borrow()
    }

    /// Shut both sockets down and signal the opposite pump.
    fn tear_down(&self, source: &OwnedReadHalf, destination: &OwnedWriteHalf) {
        self.torn_down.send_replace(true);

        let streams: [&TcpStream; 2] = [source.as_ref(), destination.as_ref()];
        for stream in streams {
            if let Err(e) = SockRef::from(stream).shutdown(Shutdown::Both) {
                debug!(error = %e, "Socket shutdown failed");
            }
        }
    }

    async fn wait(rx: &mut watch::Receiver<bool>) {
        let _ = rx.wait_for(|torn_down| *torn_down).await;
    }
}

impl Default for SessionLink {
    fn default() -> Self {
        Self::new()
    }
}

enum ReadStep {
    Data(usize),
    Eof,
    Idle,
    Failed(io::Error),
}

/// Copy bytes from `source` to `destination` until the direction ends.
pub async fn pump(
    mut source: OwnedReadHalf,
    mut destination: OwnedWriteHalf,
    direction: Direction,
    policy: RelayPolicy,
    link: SessionLink,
    stats: Arc<ForwarderStats>,
) -> PumpReport {
    let mut teardown = link.torn_down.subscribe();
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let outcome = loop {
        let step = tokio::select! {
            biased;
            _ = SessionLink::wait(&mut teardown) => break PumpOutcome::Aborted,
            step = read_step(&mut source, &mut buf, policy.patience) => step,
        };

        match step {
            ReadStep::Data(n) => {
                let written = tokio::select! {
                    biased;
                    _ = SessionLink::wait(&mut teardown) => break PumpOutcome::Aborted,
                    written = with_patience(policy.patience, destination.write_all(&buf[..n])) => written,
                };

                if let Err(e) = written {
                    warn!(
                        direction = %direction,
                        destination = ?destination.peer_addr().ok(),
                        error = %e,
                        "Relay write failed, closing session"
                    );
                    link.tear_down(&source, &destination);
                    break PumpOutcome::Failed;
                }

                bytes += n as u64;
                direction.counter(&stats).fetch_add(n as u64, Ordering::Relaxed);
            }
            ReadStep::Eof => {
                debug!(direction = %direction, bytes, "End of stream, half-closing");
                half_close(&source, &mut destination).await;
                break PumpOutcome::Eof;
            }
            ReadStep::Idle if policy.close_upon_timeout => {
                warn!(
                    direction = %direction,
                    source = ?source.peer_addr().ok(),
                    destination = ?destination.peer_addr().ok(),
                    "Idle timeout, closing session"
                );
                link.tear_down(&source, &destination);
                break PumpOutcome::IdleTeardown;
            }
            ReadStep::Idle => {
                info!(direction = %direction, "Idle timeout, closing direction");
                half_close(&source, &mut destination).await;
                break PumpOutcome::IdleHalfClose;
            }
            ReadStep::Failed(e) => {
                warn!(
                    direction = %direction,
                    source = ?source.peer_addr().ok(),
                    error = %e,
                    "Relay read failed, closing session"
                );
                link.tear_down(&source, &destination);
                break PumpOutcome::Failed;
            }
        }
    };

    PumpReport {
        direction,
        bytes,
        outcome,
    }
}

async fn read_step(
    source: &mut OwnedReadHalf,
    buf: &mut [u8],
    patience: Option<Duration>,
) -> ReadStep {
    let result = match patience {
        Some(limit) => match timeout(limit, source.read(buf)).await {
            Ok(result) => result,
            Err(_) => return ReadStep::Idle,
        },
        None => source.read(buf).await,
    };

    match result {
        Ok(0) => ReadStep::Eof,
        Ok(n) => ReadStep::Data(n),
        Err(e) => ReadStep::Failed(e),
    }
}

async fn with_patience<F>(patience: Option<Duration>, io: F) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    match patience {
        Some(limit) => match timeout(limit, io).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout")),
        },
        None => io.await,
    }
}

/// Stop reading from `source` and send FIN on `destination`.
async fn half_close(source: &OwnedReadHalf, destination: &mut OwnedWriteHalf) {
    let stream: &TcpStream = source.as_ref();
    if let Err(e) = SockRef::from(stream).shutdown(Shutdown::Read) {
        debug!(error = %e, "Read shutdown failed");
    }
    if let Err(e) = destination.shutdown().await {
        debug!(error = %e, "Write shutdown failed");
    }
}
