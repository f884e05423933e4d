//! Forwarding rules.
//!
//! A rule binds one listen endpoint to an ordered list of candidate backends.
//! Candidate order is dial priority: the first reachable candidate wins.

use std::fmt;

use portrelay_networking::{Endpoint, EndpointError};
use thiserror::Error;

/// Errors raised while building a forwarding rule.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The listen endpoint did not parse.
    #[error("invalid listen endpoint: {0}")]
    Listen(#[source] EndpointError),

    /// A candidate endpoint did not parse.
    #[error("invalid candidate endpoint #{index}: {source}")]
    Candidate {
        index: usize,
        #[source]
        source: EndpointError,
    },

    /// A candidate has nothing to dial.
    #[error("candidate endpoint #{index} has an empty host")]
    EmptyCandidateHost { index: usize },

    /// No candidates were given.
    #[error("at least one candidate endpoint is required")]
    NoCandidates,

    /// The forwarder was started outside a tokio runtime.
    #[error("no tokio runtime to run the forwarder on")]
    NoRuntime,
}

/// One listen address and its failover list.
///
/// Immutable for the lifetime of a supervisor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    listen: Endpoint,
    candidates: Vec<Endpoint>,
    close_upon_timeout: bool,
}

impl ForwardingRule {
    /// Build a rule from already-parsed endpoints.
    pub fn new(
        listen: Endpoint,
        candidates: Vec<Endpoint>,
        close_upon_timeout: bool,
    ) -> Result<Self, ConfigError> {
        if candidates.is_empty() {
            return Err(ConfigError::NoCandidates);
        }

        if let Some(index) = candidates.iter().position(Endpoint::is_any_host) {
            return Err(ConfigError::EmptyCandidateHost { index });
        }

        Ok(Self {
            listen,
            candidates,
            close_upon_timeout,
        })
    }

    /// Parse a rule from `host:port` strings.
    pub fn parse<S: AsRef<str>>(
        listen_config: &str,
        connect_configs: &[S],
        close_upon_timeout: bool,
    ) -> Result<Self, ConfigError> {
        let listen = listen_config.parse().map_err(ConfigError::Listen)?;

        let candidates = connect_configs
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                raw.as_ref()
                    .parse()
                    .map_err(|source| ConfigError::Candidate { index, source })
            })
            .collect::<Result<Vec<Endpoint>, _>>()?;

        Self::new(listen, candidates, close_upon_timeout)
    }

    /// Address the supervisor listens on.
    pub fn listen(&self) -> &Endpoint {
        &self.listen
    }

    /// Candidate backends in dial order.
    pub fn candidates(&self) -> &[Endpoint] {
        &self.candidates
    }

    /// Whether a read timeout tears down the whole session.
    pub fn close_upon_timeout(&self) -> bool {
        self.close_upon_timeout
    }
}

/// Comma-separated endpoint list for log fields.
pub struct EndpointList<'a>(pub &'a [Endpoint]);

impl fmt::Display for EndpointList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, endpoint) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", endpoint)?;
        }
        Ok(())
    }
}
