use crate::*;

use std::time::Instant;

use gatekeeper_core::{FilterFault, Verdict};

/// Shutdown with a live session ends it, stops accepting, and exits.
#[tokio::test]
async fn test_graceful_shutdown_reaches_exited() {
    let alpha = mock_endpoint("alpha").await;
    let running = start(test_config(), table(&[(ALPHA, &alpha.endpoint)])).await;
    let addr = running.addr;
    let handle = running.handle.clone();

    let mut stream = connect(addr, ALPHA).await.unwrap();
    assert_eq!(read_n(&mut stream, 6).await, b"alpha\n");
    assert!(eventually(|| handle.registry().session_len() == 1).await);

    let states = handle.clone();
    let watcher = tokio::spawn(async move {
        let draining = states.wait_for(Lifecycle::Draining).await;
        let exited = states.wait_for(Lifecycle::Exited).await;
        (draining, exited)
    });

    running.stop().await.unwrap();
    let (draining, exited) = watcher.await.unwrap();
    assert!(draining >= Lifecycle::Draining);
    assert_eq!(exited, Lifecycle::Exited);

    assert!(read_to_close(&mut stream).await.is_empty());
    assert_eq!(handle.registry().tracked(), 0);
    assert!(TcpStream::connect(addr).await.is_err());
}

/// Connections still in their handshake are closed when draining starts.
#[tokio::test]
async fn test_pending_connections_closed_on_shutdown() {
    let alpha = mock_endpoint("alpha").await;
    let running = start(test_config(), table(&[(ALPHA, &alpha.endpoint)])).await;

    let mut stream = TcpStream::connect(running.addr).await.unwrap();
    gatekeeper_relay::handshake::read_public_key(&mut stream)
        .await
        .unwrap();
    let registry = running.handle.registry().clone();
    assert!(eventually(|| registry.pending_len() == 1).await);

    running.stop().await.unwrap();
    assert!(read_to_close(&mut stream).await.is_empty());
    assert_eq!(registry.pending_len(), 0);
    assert_eq!(alpha.connections(), 0);
}

/// A session stuck in non-yielding code cannot hold the listener open.
#[tokio::test]
async fn test_stuck_session_does_not_block_exit() {
    let alpha = mock_endpoint("alpha").await;
    let running = start_with_hook(
        test_config(),
        table(&[(ALPHA, &alpha.endpoint)]),
        |session: &mut Session, _: &str, _: &Endpoint| {
            session.add_filter(|chunk: &[u8]| -> Result<Verdict, FilterFault> {
                if chunk == b"hang\n" {
                    std::thread::sleep(Duration::from_secs(3));
                }
                Ok(Verdict::Pass)
            });
        },
    )
    .await;

    let mut stream = connect(running.addr, ALPHA).await.unwrap();
    assert_eq!(read_n(&mut stream, 6).await, b"alpha\n");
    stream.write_all(b"hang\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    running.stop().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "shutdown waited for the stuck session: {:?}",
        started.elapsed()
    );

    // The stuck worker still holds its sockets, but they are shut down.
    let exited = Instant::now();
    let rest = tokio::time::timeout(Duration::from_secs(1), read_to_close(&mut stream))
        .await
        .expect("client socket stayed open after Exited");
    assert!(rest.is_empty());
    assert!(exited.elapsed() < Duration::from_secs(1));
}

/// A shutdown request before any client arrives still walks every state.
#[tokio::test]
async fn test_idle_shutdown() {
    let running = start(test_config(), MappingTable::default()).await;
    let handle = running.handle.clone();
    assert_eq!(handle.lifecycle(), Lifecycle::Running);
    running.stop().await.unwrap();
    assert_eq!(handle.lifecycle(), Lifecycle::Exited);
    assert!(handle.is_shutting_down());
}
