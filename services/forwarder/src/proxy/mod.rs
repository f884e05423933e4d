//! L4 TCP forwarding with ordered failover.
//!
//! This module provides:
//! - Forwarding rules (listen endpoint + ordered candidates)
//! - Failover dialing with a per-attempt timeout
//! - Unidirectional relay pumps with half-close and idle-timeout policy
//! - Per-client sessions
//! - A self-healing listener supervisor
//!
//! ## Architecture
//!
//! ```text
//! Client -> ListenerSupervisor -> SessionManager -> FailoverDialer -> Backend
//!                                       |
//!                         pump(client->backend) + pump(backend->client)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ForwarderOptions, ForwardingRule, ListenerSupervisor};
//!
//! let rule = ForwardingRule::parse(":8080", &["10.0.0.1:80", "10.0.0.2:80"], false)?;
//! let supervisor = ListenerSupervisor::new(rule, ForwarderOptions::default());
//! tokio::spawn(supervisor.run());
//! ```

mod dialer;
mod pump;
mod rule;
mod session;
mod stats;
mod supervisor;

pub use dialer::{DialOutcome, FailoverDialer, DEFAULT_DIAL_TIMEOUT};
pub use pump::{
    pump, Direction, PumpOutcome, PumpReport, RelayPolicy, SessionLink, DEFAULT_PATIENCE,
    RELAY_BUFFER_SIZE,
};
pub use rule::{ConfigError, EndpointList, ForwardingRule};
pub use session::SessionManager;
pub use stats::{ForwarderStats, StatsSnapshot};
pub use supervisor::{
    ForwarderOptions, ListenerSupervisor, SupervisorState, DEFAULT_BACKLOG, DEFAULT_BIND_RETRY,
    DEFAULT_COOLDOWN,
};
