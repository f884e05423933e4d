//! Forwarder configuration.
//!
//! Flags and environment variables only; there is no configuration file.

use std::time::Duration;

use clap::Parser;
use portrelay_forwarder::{ConfigError, ForwarderOptions, ForwardingRule, KeepaliveProfile};

/// portrelay - self-healing TCP port forwarder with ordered backend failover.
#[derive(Debug, Clone, Parser)]
#[command(name = "portrelay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on, as host:port (empty host = all interfaces).
    #[arg(long, env = "PORTRELAY_LISTEN")]
    pub listen: String,

    /// Candidate backend as host:port. Repeat for failover, in priority order.
    #[arg(
        long = "connect",
        env = "PORTRELAY_CONNECT",
        value_delimiter = ',',
        required = true
    )]
    pub connect: Vec<String>,

    /// Close the whole connection when either side goes idle.
    #[arg(long, env = "PORTRELAY_CLOSE_UPON_TIMEOUT")]
    pub close_upon_timeout: bool,

    /// Per-candidate connect timeout in seconds.
    #[arg(long, env = "PORTRELAY_DIAL_TIMEOUT_SECS", default_value_t = 60)]
    pub dial_timeout_secs: u64,

    /// Idle patience for relayed sockets in seconds (0 disables it).
    #[arg(long, env = "PORTRELAY_PATIENCE_SECS", default_value_t = 60)]
    pub patience_secs: u64,

    /// Delay between bind attempts in seconds.
    #[arg(long, env = "PORTRELAY_BIND_RETRY_SECS", default_value_t = 5)]
    pub bind_retry_secs: u64,

    /// Delay before relaunching the listener after a fault, in seconds.
    #[arg(long, env = "PORTRELAY_COOLDOWN_SECS", default_value_t = 5)]
    pub cooldown_secs: u64,

    /// Idle time before the first TCP keepalive probe, in seconds.
    #[arg(long, env = "PORTRELAY_KEEPALIVE_IDLE_SECS", default_value_t = 60)]
    pub keepalive_idle_secs: u64,

    /// Interval between TCP keepalive probes, in seconds.
    #[arg(long, env = "PORTRELAY_KEEPALIVE_INTERVAL_SECS", default_value_t = 10)]
    pub keepalive_interval_secs: u64,

    /// Unanswered keepalive probes before the peer is considered dead.
    #[arg(long, env = "PORTRELAY_KEEPALIVE_PROBES", default_value_t = 5)]
    pub keepalive_probes: u32,

    /// Probe every candidate once at startup and log the unreachable ones.
    #[arg(long, env = "PORTRELAY_CHECK")]
    pub check: bool,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "PORTRELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Build the forwarding rule.
    pub fn rule(&self) -> Result<ForwardingRule, ConfigError> {
        ForwardingRule::parse(&self.listen, &self.connect, self.close_upon_timeout)
    }

    /// Build forwarder options. Timeouts below one second are raised to one.
    pub fn options(&self) -> ForwarderOptions {
        let patience = match self.patience_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        ForwarderOptions {
            dial_timeout: Duration::from_secs(self.dial_timeout_secs.max(1)),
            patience,
            bind_retry: Duration::from_secs(self.bind_retry_secs.max(1)),
            cooldown: Duration::from_secs(self.cooldown_secs.max(1)),
            keepalive: KeepaliveProfile {
                idle: Duration::from_secs(self.keepalive_idle_secs.max(1)),
                interval: Duration::from_secs(self.keepalive_interval_secs.max(1)),
                max_probes: self.keepalive_probes.max(1),
            },
            ..ForwarderOptions::default()
        }
    }
}
