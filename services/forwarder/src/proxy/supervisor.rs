//! Self-healing listener supervision.
//!
//! The supervisor binds the rule's listen endpoint, accepts clients and hands
//! each one to a session task. It never gives up:
//!
//! ```text
//! Binding --ok--> Listening --fault--> Cooldown --> Binding
//!    ^   |
//!    +---+ bind failed, sleep bind_retry
//! ```
//!
//! A fault is an accept error that is not attributable to a single client,
//! or an explicit recycle request. The listener is dropped before the
//! cooldown starts, so a relaunch never holds two sockets on the endpoint.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use portrelay_networking::KeepaliveProfile;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn, Instrument};

use super::dialer::{FailoverDialer, DEFAULT_DIAL_TIMEOUT};
use super::pump::{RelayPolicy, DEFAULT_PATIENCE};
use super::rule::{EndpointList, ForwardingRule};
use super::session::SessionManager;
use super::stats::ForwarderStats;

/// Default delay between bind attempts.
pub const DEFAULT_BIND_RETRY: Duration = Duration::from_secs(5);

/// Default delay before relaunching after a fault.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Timing and socket options for a forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderOptions {
    /// Per-candidate connect timeout.
    pub dial_timeout: Duration,
    /// Read/write patience for relayed sockets. `None` disables it.
    pub patience: Option<Duration>,
    /// Delay between bind attempts.
    pub bind_retry: Duration,
    /// Delay before relaunching after a fault.
    pub cooldown: Duration,
    /// Keepalive tuning for client and backend sockets.
    pub keepalive: KeepaliveProfile,
    /// Listen backlog.
    pub backlog: u32,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            patience: Some(DEFAULT_PATIENCE),
            bind_retry: DEFAULT_BIND_RETRY,
            cooldown: DEFAULT_COOLDOWN,
            keepalive: KeepaliveProfile::default(),
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Observable supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Trying to bind the listen endpoint.
    Binding,
    /// Accepting clients on the given address.
    Listening(SocketAddr),
    /// Waiting out the cooldown after a fault.
    Cooldown,
}

/// Why the accept loop stopped.
#[derive(Debug)]
enum Fault {
    Listener(io::Error),
    Recycled,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Listener(e) => write!(f, "listener error: {}", e),
            Fault::Recycled => f.write_str("recycle requested"),
        }
    }
}

/// Owns the listen socket for one forwarding rule.
pub struct ListenerSupervisor {
    rule: Arc<ForwardingRule>,
    options: ForwarderOptions,
    sessions: SessionManager,
    stats: Arc<ForwarderStats>,
    recycle: Arc<Notify>,
    state: watch::Sender<SupervisorState>,
}

impl ListenerSupervisor {
    /// Create a supervisor. Nothing is bound until [`run`](Self::run).
    pub fn new(rule: ForwardingRule, options: ForwarderOptions) -> Self {
        let rule = Arc::new(rule);
        let stats = Arc::new(ForwarderStats::default());

        let dialer = FailoverDialer::new(options.dial_timeout, options.keepalive, Arc::clone(&stats));
        let policy = RelayPolicy {
            patience: options.patience,
            close_upon_timeout: rule.close_upon_timeout(),
        };
        let sessions = SessionManager::new(
            Arc::clone(&rule),
            dialer,
            policy,
            options.keepalive,
            Arc::clone(&stats),
        );
        let (state, _) = watch::channel(SupervisorState::Binding);

        Self {
            rule,
            options,
            sessions,
            stats,
            recycle: Arc::new(Notify::new()),
            state,
        }
    }

    /// Counters shared with every session of this supervisor.
    pub fn stats(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }

    /// Trigger that makes the supervisor drop and rebind its listener.
    ///
    /// A recycle goes through the same cooldown as a listener fault.
    pub fn recycle_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.recycle)
    }

    /// Watch the supervisor's state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Run forever: bind, accept, relaunch after faults.
    pub async fn run(self) {
        loop {
            let listener = self.bind().await;
            let fault = self.serve(&listener).await;
            drop(listener);

            self.stats.supervisor_restarts.fetch_add(1, Ordering::Relaxed);
            self.state.send_replace(SupervisorState::Cooldown);

            match &fault {
                Fault::Recycled => warn!(
                    listen = %self.rule.listen(),
                    cooldown_ms = self.options.cooldown.as_millis() as u64,
                    "Listener recycle requested, relaunching after cooldown"
                ),
                Fault::Listener(e) => error!(
                    listen = %self.rule.listen(),
                    error = %e,
                    cooldown_ms = self.options.cooldown.as_millis() as u64,
                    "Listener fault, relaunching after cooldown"
                ),
            }

            tokio::time::sleep(self.options.cooldown).await;
        }
    }

    /// Bind the listen endpoint, retrying until it succeeds.
    async fn bind(&self) -> TcpListener {
        self.state.send_replace(SupervisorState::Binding);

        loop {
            match self.try_bind().await {
                Ok(listener) => return listener,
                Err(e) => {
                    error!(
                        listen = %self.rule.listen(),
                        error = %e,
                        retry_ms = self.options.bind_retry.as_millis() as u64,
                        "Failed to bind listener"
                    );
                    tokio::time::sleep(self.options.bind_retry).await;
                }
            }
        }
    }

    async fn try_bind(&self) -> io::Result<TcpListener> {
        let addr = self.rule.listen().listen_addr().await?;
        create_listener(addr, self.options.backlog)
    }

    /// Accept clients until the listener faults or a recycle is requested.
    async fn serve(&self, listener: &TcpListener) -> Fault {
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => return Fault::Listener(e),
        };

        self.discard_stale_recycle();

        info!(
            bind_addr = %local_addr,
            candidates = %EndpointList(self.rule.candidates()),
            close_upon_timeout = self.rule.close_upon_timeout(),
            "Listener ready"
        );
        self.state.send_replace(SupervisorState::Listening(local_addr));

        loop {
            tokio::select! {
                _ = self.recycle.notified() => return Fault::Recycled,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.dispatch(stream, peer_addr),
                    Err(e) if is_client_accept_error(&e) => {
                        debug!(error = %e, "Client aborted before accept completed");
                    }
                    Err(e) => return Fault::Listener(e),
                },
            }
        }
    }

    /// Drop a recycle request that arrived while no listener was bound.
    ///
    /// The rebind it asked for is the one that just happened.
    fn discard_stale_recycle(&self) {
        let mut notified = pin!(self.recycle.notified());
        if notified.as_mut().enable() {
            debug!("Discarded recycle request made before the listener was bound");
        }
    }

    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        debug!(peer_addr = %peer_addr, "Accepted client");

        let sessions = self.sessions.clone();
        tokio::spawn(
            async move { sessions.start(stream, peer_addr).await }
                .instrument(tracing::info_span!("session", peer = %peer_addr)),
        );
    }
}

/// Accept errors caused by one client rather than by the listener.
fn is_client_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Create a TCP listener with custom backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    TcpListener::from_std(std::net::TcpListener::from(socket))
}
