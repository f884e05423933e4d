
use std::net::SocketAddr;
use std::time::Duration;

use harness::{
    free_port, test_options, wait_listening, ForwarderHandle, ScriptedBackend, TEST_TIMEOUT,
};
use portrelay_forwarder::{spawn_forwarder, ConfigError, Endpoint, SupervisorState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

async fn try_roundtrip(addr: SocketAddr, message: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(message).await?;
    let mut buf = vec![0u8; message.len()];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Retry a roundtrip until it succeeds or `TEST_TIMEOUT` passes.
async fn eventually_roundtrip(addr: SocketAddr, message: &[u8]) -> Vec<u8> {
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        match timeout(Duration::from_millis(500), try_roundtrip(addr, message)).await {
            Ok(Ok(data)) => return data,
            _ if Instant::now() < deadline => sleep(Duration::from_millis(50)).await,
            _ => panic!("forwarder on {} never came back", addr),
        }
    }
}

#[tokio::test]
async fn recycled_listener_resumes_on_same_endpoint() {
    let backend = ScriptedBackend::echo().await.unwrap();
    let port = free_port().await;
    let mut forwarder = ForwarderHandle::spawn_on(
        Endpoint::new("127.0.0.1", port),
        vec![backend.endpoint()],
        false,
        test_options(),
    )
    .await;
    assert_eq!(forwarder.listen_addr.port(), port);
    assert_eq!(try_roundtrip(forwarder.listen_addr, b"before").await.unwrap(), b"before");

    // A session opened before the fault survives it.
    let mut survivor = forwarder.connect().await;
    survivor.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    survivor.read_exact(&mut buf).await.unwrap();

    forwarder.recycle.notify_one();
    timeout(
        TEST_TIMEOUT,
        forwarder
            .state
            .wait_for(|s| *s == SupervisorState::Cooldown),
    )
    .await
    .unwrap()
    .unwrap();

    // Rebinding the same port only works if the old listener was closed.
    let rebound = wait_listening(&mut forwarder.state).await;
    assert_eq!(rebound, forwarder.listen_addr);
    assert_eq!(eventually_roundtrip(rebound, b"after").await, b"after");
    assert_eq!(forwarder.stats.snapshot().supervisor_restarts, 1);

    survivor.write_all(b"y").await.unwrap();
    survivor.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"y");
}

#[tokio::test]
async fn recycle_requested_during_cooldown_is_not_replayed() {
    let backend = ScriptedBackend::echo().await.unwrap();
    let port = free_port().await;
    let mut forwarder = ForwarderHandle::spawn_on(
        Endpoint::new("127.0.0.1", port),
        vec![backend.endpoint()],
        false,
        test_options(),
    )
    .await;

    forwarder.recycle.notify_one();
    timeout(
        TEST_TIMEOUT,
        forwarder
            .state
            .wait_for(|s| *s == SupervisorState::Cooldown),
    )
    .await
    .unwrap()
    .unwrap();

    // Arrives while no listener is bound; the pending rebind already covers it.
    forwarder.recycle.notify_one();
    let rebound = wait_listening(&mut forwarder.state).await;
    assert_eq!(rebound, forwarder.listen_addr);

    // Several cooldowns' worth of time.
    sleep(Duration::from_millis(800)).await;
    assert_eq!(forwarder.stats.snapshot().supervisor_restarts, 1);
    assert_eq!(*forwarder.state.borrow(), SupervisorState::Listening(rebound));
    assert_eq!(eventually_roundtrip(rebound, b"once").await, b"once");
}

/// Find this process's listening socket bound to `port`.
#[cfg(target_os = "linux")]
fn listener_fd(port: u16) -> Option<std::os::fd::RawFd> {
    use socket2::SockRef;
    use std::os::fd::BorrowedFd;

    for entry in std::fs::read_dir("/proc/self/fd").ok()?.flatten() {
        let Some(fd) = entry.file_name().to_str().and_then(|name| name.parse().ok()) else {
            continue;
        };
        // SAFETY: only used for getsockopt calls, which fail on stale descriptors.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let sock = SockRef::from(&borrowed);
        let bound_port = sock
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .map(|addr| addr.port());
        if bound_port == Some(port) && sock.is_listener().unwrap_or(false) {
            return Some(fd);
        }
    }
    None
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn invalidated_listener_is_rebound_on_same_endpoint() {
    use socket2::SockRef;
    use std::net::Shutdown;
    use std::os::fd::BorrowedFd;

    let backend = ScriptedBackend::echo().await.unwrap();
    let port = free_port().await;
    let mut forwarder = ForwarderHandle::spawn_on(
        Endpoint::new("127.0.0.1", port),
        vec![backend.endpoint()],
        false,
        test_options(),
    )
    .await;

    let fd = listener_fd(port).expect("listening socket not found");
    // SAFETY: the supervisor keeps the listener open until accept fails.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    SockRef::from(&borrowed).shutdown(Shutdown::Both).unwrap();

    timeout(
        TEST_TIMEOUT,
        forwarder
            .state
            .wait_for(|s| *s == SupervisorState::Cooldown),
    )
    .await
    .unwrap()
    .unwrap();

    let rebound = wait_listening(&mut forwarder.state).await;
    assert_eq!(rebound, forwarder.listen_addr);
    assert_eq!(eventually_roundtrip(rebound, b"hi").await, b"hi");
    assert_eq!(forwarder.stats.snapshot().supervisor_restarts, 1);
}

#[tokio::test]
async fn bind_is_retried_until_endpoint_is_free() {
    let backend = ScriptedBackend::echo().await.unwrap();
    let squatter = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = squatter.local_addr().unwrap();

    let rule_listen = Endpoint::new("127.0.0.1", addr.port());
    let spawn = tokio::spawn(ForwarderHandle::spawn_on(
        rule_listen,
        vec![backend.endpoint()],
        false,
        test_options(),
    ));

    sleep(Duration::from_millis(300)).await;
    assert!(!spawn.is_finished(), "port is still taken");

    drop(squatter);
    let forwarder = timeout(TEST_TIMEOUT, spawn).await.unwrap().unwrap();
    assert_eq!(forwarder.listen_addr, addr);
    assert_eq!(eventually_roundtrip(addr, b"bound").await, b"bound");
}

#[tokio::test]
async fn spawn_forwarder_returns_immediately_and_serves() {
    let backend = ScriptedBackend::echo().await.unwrap();
    let port = free_port().await;
    let listen = format!("127.0.0.1:{}", port);
    let candidates = [
        format!("127.0.0.1:{}", harness::dead_endpoint().await.port()),
        backend.addr.to_string(),
    ];

    spawn_forwarder(&listen, &candidates, false).unwrap();

    let addr: SocketAddr = listen.parse().unwrap();
    assert_eq!(eventually_roundtrip(addr, b"hello").await, b"hello");
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn spawn_forwarder_rejects_bad_configuration() {
    let empty: [&str; 0] = [];
    assert_eq!(
        spawn_forwarder("127.0.0.1:0", &empty, false),
        Err(ConfigError::NoCandidates)
    );
    assert!(matches!(
        spawn_forwarder("127.0.0.1", &["127.0.0.1:1"], false),
        Err(ConfigError::Listen(_))
    ));
}

#[test]
fn spawn_forwarder_outside_runtime_is_rejected() {
    assert_eq!(
        spawn_forwarder("127.0.0.1:0", &["127.0.0.1:1"], false),
        Err(ConfigError::NoRuntime)
    );
}
