//! portrelay
//!
//! Self-healing TCP port forwarder.
//!
//! This service:
//! - Listens on one address and rebinds itself after listener faults
//! - Dials an ordered list of candidate backends for each client
//! - Relays bytes in both directions until either side closes or idles out
//! - Recycles its listener on SIGHUP

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portrelay_forwarder::{ForwardingRule, ListenerSupervisor};

mod config;

/// Timeout for each startup reachability probe.
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting portrelay");

    let rule = cli.rule().context("Invalid forwarding configuration")?;
    let options = cli.options();
    info!(
        listen = %rule.listen(),
        candidate_count = rule.candidates().len(),
        close_upon_timeout = rule.close_upon_timeout(),
        dial_timeout_secs = options.dial_timeout.as_secs(),
        patience_secs = options.patience.map(|p| p.as_secs()),
        "Configuration loaded"
    );

    if cli.check {
        check_candidates(&rule).await;
    }

    let span = tracing::info_span!("forwarder", listen = %rule.listen());
    let supervisor = ListenerSupervisor::new(rule, options);
    let stats = supervisor.stats();
    let recycle = supervisor.recycle_handle();
    tokio::spawn(supervisor.run().instrument(span));

    #[cfg(unix)]
    spawn_recycle_on_sighup(recycle)?;
    #[cfg(not(unix))]
    drop(recycle);

    wait_for_shutdown().await?;

    let snapshot = stats.snapshot();
    info!(
        connections_accepted = snapshot.connections_accepted,
        sessions_active = snapshot.sessions_active,
        sessions_closed = snapshot.sessions_closed,
        clients_exhausted = snapshot.clients_exhausted,
        supervisor_restarts = snapshot.supervisor_restarts,
        bytes_to_backend = snapshot.bytes_to_backend,
        bytes_from_backend = snapshot.bytes_from_backend,
        "Shutting down"
    );

    Ok(())
}

/// Log every candidate that does not accept connections right now.
async fn check_candidates(rule: &ForwardingRule) {
    for candidate in rule.candidates() {
        if portrelay_networking::is_port_open(candidate.host(), candidate.port(), CHECK_TIMEOUT)
            .await
        {
            info!(candidate = %candidate, "Candidate reachable");
        } else {
            warn!(candidate = %candidate, "Candidate unreachable at startup");
        }
    }
}

#[cfg(unix)]
fn spawn_recycle_on_sighup(recycle: std::sync::Arc<tokio::sync::Notify>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, recycling listener");
            recycle.notify_one();
        }
    });
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}
