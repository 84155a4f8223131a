use crate::*;

use gatekeeper_core::crypto::encrypt_for;
use gatekeeper_relay::handshake::{read_public_key, MAX_CIPHERTEXT_READ};

/// Each secret is routed to its own endpoint and nowhere else.
#[tokio::test]
async fn test_matching_secret_reaches_its_endpoint() {
    let alpha = mock_endpoint("alpha").await;
    let beta = mock_endpoint("beta").await;
    let running = start(
        test_config(),
        table(&[(ALPHA, &alpha.endpoint), (BETA, &beta.endpoint)]),
    )
    .await;

    let mut to_beta = connect(running.addr, BETA).await.unwrap();
    assert_eq!(read_n(&mut to_beta, 5).await, b"beta\n");

    let mut to_alpha = connect(running.addr, ALPHA).await.unwrap();
    assert_eq!(read_n(&mut to_alpha, 6).await, b"alpha\n");

    assert_eq!(alpha.connections(), 1);
    assert_eq!(beta.connections(), 1);

    drop(to_alpha);
    drop(to_beta);
    running.stop().await.unwrap();
}

/// A wrong secret gets the key and then nothing but a close.
#[tokio::test]
async fn test_wrong_secret_is_closed_silently() {
    let alpha = mock_endpoint("alpha").await;
    let running = start(test_config(), table(&[(ALPHA, &alpha.endpoint)])).await;

    let mut stream = connect(running.addr, b"not-the-secret").await.unwrap();
    assert!(read_to_close(&mut stream).await.is_empty());
    assert_eq!(alpha.connections(), 0);

    let registry = running.handle.registry().clone();
    assert!(eventually(|| registry.pending_len() == 0 && registry.session_len() == 0).await);

    running.stop().await.unwrap();
}

/// A full buffer of whitespace trims to nothing and fails authentication.
#[tokio::test]
async fn test_whitespace_submission_is_rejected() {
    let alpha = mock_endpoint("alpha").await;
    let running = start(test_config(), table(&[(ALPHA, &alpha.endpoint)])).await;

    let mut stream = TcpStream::connect(running.addr).await.unwrap();
    read_public_key(&mut stream).await.unwrap();
    stream.write_all(&[b' '; MAX_CIPHERTEXT_READ]).await.unwrap();

    assert!(read_to_close(&mut stream).await.is_empty());
    assert_eq!(alpha.connections(), 0);

    running.stop().await.unwrap();
}

/// Bytes flow both ways, in order, and reach the endpoint unchanged.
#[tokio::test]
async fn test_round_trip_preserves_order() {
    let alpha = mock_endpoint("alpha").await;
    let running = start(test_config(), table(&[(ALPHA, &alpha.endpoint)])).await;

    let mut stream = connect(running.addr, ALPHA).await.unwrap();
    assert_eq!(read_n(&mut stream, 6).await, b"alpha\n");

    let registry = running.handle.registry().clone();
    assert!(eventually(|| registry.session_len() == 1).await);

    let mut expected = Vec::new();
    for i in 0..50 {
        let line = format!("line {i}\r\n");
        stream.write_all(line.as_bytes()).await.unwrap();
        expected.extend_from_slice(line.as_bytes());
    }
    assert_eq!(read_n(&mut stream, expected.len()).await, expected);
    assert_eq!(alpha.received(), expected);

    // Large payloads span many relay chunks.
    let big: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    stream.write_all(&big).await.unwrap();
    assert_eq!(read_n(&mut stream, big.len()).await, big);

    // Client close ends the session and the reaper forgets it.
    drop(stream);
    assert!(eventually(|| registry.session_len() == 0).await);

    running.stop().await.unwrap();
}

/// Data sent in the same write as the ciphertext is not lost.
#[tokio::test]
async fn test_data_after_handshake_in_same_write() {
    let alpha = mock_endpoint("alpha").await;
    let running = start(test_config(), table(&[(ALPHA, &alpha.endpoint)])).await;

    let mut stream = TcpStream::connect(running.addr).await.unwrap();
    let pem = read_public_key(&mut stream).await.unwrap();
    let mut msg = encrypt_for(&pem, ALPHA).unwrap();
    msg.extend_from_slice(b"\r\nearly\n");
    stream.write_all(&msg).await.unwrap();

    let reply = read_n(&mut stream, 12).await;
    assert_eq!(reply, b"alpha\nearly\n");

    running.stop().await.unwrap();
}

/// Many clients at once each get their own session.
#[tokio::test]
async fn test_concurrent_clients() {
    let alpha = mock_endpoint("alpha").await;
    let beta = mock_endpoint("beta").await;
    let running = start(
        test_config(),
        table(&[(ALPHA, &alpha.endpoint), (BETA, &beta.endpoint)]),
    )
    .await;
    let addr = running.addr;

    let clients: Vec<_> = (0..8)
        .map(|i| {
            tokio::spawn(async move {
                let (secret, greeting) = if i % 2 == 0 {
                    (ALPHA, b"alpha\n".as_slice())
                } else {
                    (BETA, b"beta\n".as_slice())
                };
                let mut stream = connect(addr, secret).await.unwrap();
                assert_eq!(read_n(&mut stream, greeting.len()).await, greeting);
                let msg = format!("client {i}\n");
                stream.write_all(msg.as_bytes()).await.unwrap();
                assert_eq!(read_n(&mut stream, msg.len()).await, msg.as_bytes());
            })
        })
        .collect();
    for client in clients {
        client.await.unwrap();
    }

    assert_eq!(alpha.connections(), 4);
    assert_eq!(beta.connections(), 4);
    running.stop().await.unwrap();
}
