use crate::*;

use gatekeeper_core::{FilterFault, KeywordIntercept, Verdict};

/// With intercept enabled, a bare keyword ends the session before it reaches
/// the endpoint.
#[tokio::test]
async fn test_keyword_intercept_ends_session() {
    let alpha = mock_endpoint("alpha").await;
    let mut config = test_config();
    config.relay.intercept_keywords = true;
    let running = start(config, table(&[(ALPHA, &alpha.endpoint)])).await;

    let mut stream = connect(running.addr, ALPHA).await.unwrap();
    assert_eq!(read_n(&mut stream, 6).await, b"alpha\n");

    stream.write_all(b"GET key\n").await.unwrap();
    assert_eq!(read_n(&mut stream, 8).await, b"GET key\n");

    stream.write_all(b"Exit\r\n").await.unwrap();
    assert!(read_to_close(&mut stream).await.is_empty());
    assert_eq!(alpha.received(), b"GET key\n");

    running.stop().await.unwrap();
}

/// Keywords are ignored unless intercept is enabled.
#[tokio::test]
async fn test_keywords_pass_when_intercept_disabled() {
    let alpha = mock_endpoint("alpha").await;
    let running = start(test_config(), table(&[(ALPHA, &alpha.endpoint)])).await;

    let mut stream = connect(running.addr, ALPHA).await.unwrap();
    assert_eq!(read_n(&mut stream, 6).await, b"alpha\n");
    stream.write_all(b"quit\n").await.unwrap();
    assert_eq!(read_n(&mut stream, 5).await, b"quit\n");

    running.stop().await.unwrap();
}

/// Carriage returns are stripped on the way to the endpoint only.
#[tokio::test]
async fn test_strip_carriage_returns() {
    let alpha = mock_endpoint("alpha").await;
    let mut config = test_config();
    config.relay.strip_carriage_returns = true;
    let running = start(config, table(&[(ALPHA, &alpha.endpoint)])).await;

    let mut stream = connect(running.addr, ALPHA).await.unwrap();
    assert_eq!(read_n(&mut stream, 6).await, b"alpha\n");
    stream.write_all(b"a\r\nb\r\n").await.unwrap();
    assert_eq!(read_n(&mut stream, 4).await, b"a\nb\n");
    assert_eq!(alpha.received(), b"a\nb\n");

    running.stop().await.unwrap();
}

/// The operator hook sees the digest and endpoint, and its filters apply to
/// client → endpoint data only.
#[tokio::test]
async fn test_filter_hook_per_endpoint() {
    let alpha = mock_endpoint("alpha").await;
    let beta = mock_endpoint("beta").await;
    let alpha_digest = digest_of(ALPHA);

    let running = start_with_hook(
        test_config(),
        table(&[(ALPHA, &alpha.endpoint), (BETA, &beta.endpoint)]),
        move |session: &mut Session, digest: &str, _endpoint: &Endpoint| {
            if digest == alpha_digest {
                session.add_filter(|chunk: &[u8]| -> Result<Verdict, FilterFault> {
                    Ok(Verdict::Replace(chunk.to_ascii_uppercase()))
                });
            }
        },
    )
    .await;

    // The greeting comes back from the endpoint untouched.
    let mut to_alpha = connect(running.addr, ALPHA).await.unwrap();
    assert_eq!(read_n(&mut to_alpha, 6).await, b"alpha\n");
    to_alpha.write_all(b"ping\n").await.unwrap();
    assert_eq!(read_n(&mut to_alpha, 5).await, b"PING\n");

    let mut to_beta = connect(running.addr, BETA).await.unwrap();
    assert_eq!(read_n(&mut to_beta, 5).await, b"beta\n");
    to_beta.write_all(b"ping\n").await.unwrap();
    assert_eq!(read_n(&mut to_beta, 5).await, b"ping\n");

    running.stop().await.unwrap();
}

/// A faulting filter does not end the session; the chunk is relayed as
/// transformed up to the fault.
#[tokio::test]
async fn test_faulting_filter_keeps_session() {
    let alpha = mock_endpoint("alpha").await;
    let running = start_with_hook(
        test_config(),
        table(&[(ALPHA, &alpha.endpoint)]),
        |session: &mut Session, _: &str, _: &Endpoint| {
            session.add_filter(|chunk: &[u8]| -> Result<Verdict, FilterFault> {
                Ok(Verdict::Replace(chunk.to_ascii_uppercase()))
            });
            session.add_filter(|_: &[u8]| -> Result<Verdict, FilterFault> {
                Err(FilterFault::new("broken", "always fails"))
            });
            session.add_filter(KeywordIntercept::default());
        },
    )
    .await;

    let mut stream = connect(running.addr, ALPHA).await.unwrap();
    assert_eq!(read_n(&mut stream, 6).await, b"alpha\n");
    // The keyword filter never runs, so this is not intercepted.
    stream.write_all(b"quit\n").await.unwrap();
    assert_eq!(read_n(&mut stream, 5).await, b"QUIT\n");

    running.stop().await.unwrap();
}
