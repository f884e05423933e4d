//! Networking utilities for the relay.
//!
//! This library provides helpers for:
//! - Parsing `host:port` endpoints
//! - TCP keepalive tuning with a per-platform capability table
//! - Port reachability probes

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use socket2::SockRef;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The input has no `:` separating host and port.
    #[error("missing ':' in endpoint: {0}")]
    MissingSeparator(String),

    /// A bracketed IPv6 host was never closed.
    #[error("unterminated '[' in endpoint: {0}")]
    UnterminatedBracket(String),

    /// The port is not a base-10 integer in 0..=65535.
    #[error("invalid port '{port}' in endpoint: {input}")]
    InvalidPort { input: String, port: String },
}

// ============================================================================
// Endpoints
// ============================================================================

/// A `host:port` pair identifying one end of a TCP connection.
///
/// An empty host is legal and means "all interfaces" when the endpoint is
/// used as a listen address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host part (hostname or IP literal, without brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when the host is empty, i.e. "any interface".
    pub fn is_any_host(&self) -> bool {
        self.host.is_empty()
    }

    /// Resolve the address to bind a listener on.
    ///
    /// An empty host binds every IPv4 interface; otherwise the first
    /// resolved address wins.
    pub async fn listen_addr(&self) -> io::Result<SocketAddr> {
        if self.is_any_host() {
            return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)));
        }

        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address found for {}", self),
                )
            })
    }

    /// Open a TCP connection to this endpoint.
    ///
    /// Every resolved address is tried in order, as `TcpStream::connect` does.
    pub async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port)).await
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    /// Parse `host:port`, splitting on the first colon.
    ///
    /// `[v6-literal]:port` is accepted as well so IPv6 hosts can be written.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let Some((host, tail)) = rest.split_once(']') else {
                return Err(EndpointError::UnterminatedBracket(input.to_string()));
            };
            let Some(port) = tail.strip_prefix(':') else {
                return Err(EndpointError::MissingSeparator(input.to_string()));
            };
            (host, port)
        } else {
            let Some((host, port)) = input.split_once(':') else {
                return Err(EndpointError::MissingSeparator(input.to_string()));
            };
            (host, port)
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort {
                input: input.to_string(),
                port: port.to_string(),
            })?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// ============================================================================
// TCP keepalive
// ============================================================================

/// Default idle time before the first keepalive probe.
pub const DEFAULT_KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Default interval between keepalive probes.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of unanswered probes before the peer is declared dead.
pub const DEFAULT_KEEPALIVE_PROBES: u32 = 5;

/// Keepalive parameters applied once to every relayed socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveProfile {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Probes sent before giving up.
    pub max_probes: u32,
}

impl Default for KeepaliveProfile {
    fn default() -> Self {
        Self {
            idle: DEFAULT_KEEPALIVE_IDLE,
            interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_probes: DEFAULT_KEEPALIVE_PROBES,
        }
    }
}

/// Which keepalive knobs the current platform exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveCapabilities {
    /// Idle delay before the first probe.
    pub idle: bool,
    /// Interval between probes.
    pub interval: bool,
    /// Probe count.
    pub probes: bool,
}

/// Keepalive capabilities of the target platform.
pub const KEEPALIVE_CAPABILITIES: KeepaliveCapabilities = KeepaliveCapabilities {
    idle: true,
    interval: cfg!(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        windows,
    )),
    probes: cfg!(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
    )),
};

/// Apply a keepalive profile to a connected stream.
///
/// Best effort: the tuning is advisory, so failures are logged at debug level
/// and never reported to the caller. If the fine-grained options are rejected
/// the plain `SO_KEEPALIVE` flag is still attempted.
pub fn configure_keepalive(stream: &TcpStream, profile: &KeepaliveProfile) {
    let sock = SockRef::from(stream);

    if let Err(e) = apply_keepalive(&sock, profile) {
        debug!(error = %e, "Keepalive tuning rejected, falling back to SO_KEEPALIVE");
        if let Err(e) = sock.set_keepalive(true) {
            debug!(error = %e, "SO_KEEPALIVE rejected");
        }
    }
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
))]
fn apply_keepalive(sock: &SockRef<'_>, profile: &KeepaliveProfile) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(profile.idle)
        .with_interval(profile.interval)
        .with_retries(profile.max_probes);
    sock.set_tcp_keepalive(&keepalive)
}

#[cfg(windows)]
fn apply_keepalive(sock: &SockRef<'_>, profile: &KeepaliveProfile) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(profile.idle)
        .with_interval(profile.interval);
    sock.set_tcp_keepalive(&keepalive)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    windows,
)))]
fn apply_keepalive(sock: &SockRef<'_>, profile: &KeepaliveProfile) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(profile.idle);
    sock.set_tcp_keepalive(&keepalive)
}

// ============================================================================
// Reachability
// ============================================================================

/// Check whether something accepts TCP connections on `host:port`.
pub async fn is_port_open(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::net::TcpListener;

    #[rstest]
    #[case("127.0.0.1:8080", "127.0.0.1", 8080)]
    #[case("example.com:443", "example.com", 443)]
    #[case(":9000", "", 9000)]
    #[case("[::1]:22", "::1", 22)]
    #[case("  localhost:0 ", "localhost", 0)]
    #[case("localhost:65535", "localhost", 65535)]
    fn test_endpoint_parse(#[case] input: &str, #[case] host: &str, #[case] port: u16) {
        let endpoint: Endpoint = input.parse().unwrap();
        assert_eq!(endpoint.host(), host);
        assert_eq!(endpoint.port(), port);
    }

    #[rstest]
    #[case("localhost")]
    #[case("[::1]22")]
    #[case("[::1:22")]
    #[case("localhost:65536")]
    #[case("localhost:http")]
    #[case("localhost:")]
    #[case("::1:22")]
    fn test_endpoint_parse_rejects(#[case] input: &str) {
        assert!(input.parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_splits_on_first_colon() {
        let err = "host:80:81".parse::<Endpoint>().unwrap_err();
        assert_eq!(
            err,
            EndpointError::InvalidPort {
                input: "host:80:81".to_string(),
                port: "80:81".to_string(),
            }
        );
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.1", 80).to_string(), "10.0.0.1:80");
        assert_eq!(Endpoint::new("fd00::1", 80).to_string(), "[fd00::1]:80");
        assert_eq!(Endpoint::new("", 80).to_string(), ":80");
    }

    #[tokio::test]
    async fn test_any_host_listen_addr() {
        let endpoint = Endpoint::new("", 4000);
        assert!(endpoint.is_any_host());
        let addr = endpoint.listen_addr().await.unwrap();
        assert_eq!(addr, "0.0.0.0:4000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_configure_keepalive_sets_flag() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        let profile = KeepaliveProfile {
            idle: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            max_probes: 3,
        };
        configure_keepalive(&stream, &profile);

        let sock = SockRef::from(&stream);
        assert!(sock.keepalive().unwrap());

        #[cfg(target_os = "linux")]
        {
            assert_eq!(sock.keepalive_time().unwrap(), Duration::from_secs(30));
            assert_eq!(sock.keepalive_interval().unwrap(), Duration::from_secs(5));
            assert_eq!(sock.keepalive_retries().unwrap(), 3);
        }
    }

    #[test]
    fn test_keepalive_capabilities() {
        #[cfg(target_os = "linux")]
        assert_eq!(
            KEEPALIVE_CAPABILITIES,
            KeepaliveCapabilities {
                idle: true,
                interval: true,
                probes: true,
            }
        );
        #[cfg(windows)]
        assert!(!KEEPALIVE_CAPABILITIES.probes);
    }

    #[test]
    fn test_keepalive_idle_supported_everywhere() {
        assert!(KEEPALIVE_CAPABILITIES.idle);
    }

    #[tokio::test]
    async fn test_is_port_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_open("127.0.0.1", port, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!is_port_open("127.0.0.1", port, Duration::from_secs(1)).await);
    }
}
