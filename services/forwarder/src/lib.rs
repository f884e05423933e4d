//! portrelay forwarder
//!
//! Self-healing TCP port forwarding with ordered backend failover.

pub mod proxy;

pub use portrelay_networking::{Endpoint, EndpointError, KeepaliveProfile};
pub use proxy::{
    ConfigError, DialOutcome, FailoverDialer, ForwarderOptions, ForwarderStats, ForwardingRule,
    ListenerSupervisor, RelayPolicy, SessionManager, StatsSnapshot, SupervisorState,
};

use tokio::runtime::Handle;
use tracing::{Instrument, Span};

/// Start forwarding `listen_config` to the first reachable of `connect_configs`.
///
/// Parses the configuration, spawns the supervisor onto the current tokio
/// runtime and returns immediately. The forwarder runs for the lifetime of
/// the runtime; there is no handle to stop it.
pub fn spawn_forwarder<S: AsRef<str>>(
    listen_config: &str,
    connect_configs: &[S],
    close_upon_timeout: bool,
) -> Result<(), ConfigError> {
    let rule = ForwardingRule::parse(listen_config, connect_configs, close_upon_timeout)?;
    spawn_forwarder_with(rule, ForwarderOptions::default(), None)
}

/// Like [`spawn_forwarder`], with explicit options and logging span.
///
/// Every event of the forwarder is emitted inside `span`; when `None`, a
/// `forwarder` span carrying the listen endpoint is used. Fails with
/// [`ConfigError::NoRuntime`] when called outside a tokio runtime.
pub fn spawn_forwarder_with(
    rule: ForwardingRule,
    options: ForwarderOptions,
    span: Option<Span>,
) -> Result<(), ConfigError> {
    let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
    let span = span.unwrap_or_else(|| tracing::info_span!("forwarder", listen = %rule.listen()));
    let supervisor = ListenerSupervisor::new(rule, options);
    runtime.spawn(supervisor.run().instrument(span));
    Ok(())
}
