//! The authentication handshake, both sides.
//!
//! ```text
//! server → client   SPKI PEM public key
//! client → server   RSA-OAEP(SHA-256) ciphertext of the secret, then "\r\n"
//! ```
//!
//! There is no reply. On success the connection silently becomes a relay; on
//! failure the server closes it without sending anything else.

use std::io;

use gatekeeper_core::crypto::{encrypt_for, PUBLIC_KEY_PEM_FOOTER};
use gatekeeper_core::{CryptoError, Endpoint, KeyPair, MappingTable};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Most bytes the server reads while waiting for the ciphertext.
pub const MAX_CIPHERTEXT_READ: usize = 4096;

/// Most bytes the client reads while waiting for the public key.
pub const MAX_PUBLIC_KEY_READ: usize = 8 * 1024;

/// Sent to an authenticated client whose endpoint cannot be reached.
pub const ENDPOINT_ERROR_LINE: &[u8] = b"Error: unable to connect to endpoint.\n";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake I/O: {0}")]
    Io(#[from] io::Error),
    #[error("could not decrypt secret: {0}")]
    Decrypt(CryptoError),
    #[error("no mapping for secret")]
    UnknownSecret,
    #[error("handshake timed out")]
    Timeout,
    #[error("bad public key from server: {0}")]
    BadPublicKey(String),
    #[error("could not encrypt secret: {0}")]
    Encrypt(CryptoError),
}

impl HandshakeError {
    /// True when the peer failed to prove a known secret, as opposed to a
    /// transport problem.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Decrypt(_) | Self::UnknownSecret | Self::Timeout)
    }
}

/// Where an authenticated connection goes.
#[derive(Debug, Clone)]
pub struct Route {
    pub digest: String,
    pub endpoint: Endpoint,
    /// Client bytes that arrived after the ciphertext terminator.
    pub leftover: Vec<u8>,
}

// ── Server side ───────────────────────────────────────────────────────────────

/// Run the server side of the handshake on a freshly accepted connection.
pub async fn accept<S>(
    stream: &mut S,
    keypair: &KeyPair,
    table: &MappingTable,
) -> Result<Route, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(keypair.public_pem().as_bytes()).await?;
    stream.flush().await?;

    let modulus_len = keypair.modulus_len();
    let raw = read_ciphertext(stream, modulus_len).await?;
    let (ciphertext, leftover) = extract_ciphertext(&raw, modulus_len);

    let digest = keypair
        .decrypt_digest(ciphertext)
        .map_err(HandshakeError::Decrypt)?;
    let endpoint = table
        .lookup(&digest)
        .cloned()
        .ok_or(HandshakeError::UnknownSecret)?;

    Ok(Route {
        digest,
        endpoint,
        leftover: leftover.to_vec(),
    })
}

/// Read the client's submission, at most [`MAX_CIPHERTEXT_READ`] bytes.
///
/// Stops at EOF, when the buffer is full, or once a full ciphertext and its
/// line terminator have arrived.
pub async fn read_ciphertext<S>(stream: &mut S, modulus_len: usize) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_CIPHERTEXT_READ];
    let mut filled = 0;

    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if terminated(&buf[..filled], modulus_len) {
            break;
        }
    }

    buf.truncate(filled);
    Ok(buf)
}

fn terminated(buf: &[u8], modulus_len: usize) -> bool {
    buf.get(modulus_len) == Some(&b'\n')
        || buf.get(modulus_len..modulus_len + 2) == Some(b"\r\n".as_slice())
        || (buf.len() > modulus_len && buf.ends_with(b"\n"))
}

/// Split a raw submission into `(ciphertext, leftover)`.
///
/// A modulus-length ciphertext followed by a line terminator is taken
/// verbatim, since its bytes may legitimately look like whitespace. Anything
/// else has one trailing terminator removed and, unless exactly one modulus
/// long, surrounding ASCII whitespace trimmed.
pub fn extract_ciphertext(raw: &[u8], modulus_len: usize) -> (&[u8], &[u8]) {
    if raw.len() > modulus_len {
        let rest = &raw[modulus_len..];
        let after = rest
            .strip_prefix(b"\r\n".as_slice())
            .or_else(|| rest.strip_prefix(b"\n".as_slice()));
        if let Some(after) = after {
            return (&raw[..modulus_len], after);
        }
    }

    let body = raw
        .strip_suffix(b"\r\n".as_slice())
        .or_else(|| raw.strip_suffix(b"\n".as_slice()))
        .unwrap_or(raw);
    if body.len() == modulus_len {
        (body, &[])
    } else {
        (body.trim_ascii(), &[])
    }
}

// ── Client side ───────────────────────────────────────────────────────────────

/// Read the server's PEM public key, up to and including the footer line.
pub async fn read_public_key<S>(stream: &mut S) -> Result<String, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let marker = format!("{PUBLIC_KEY_PEM_FOOTER}\n");
    let marker = marker.as_bytes();
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(pos) = find(&buf, marker) {
            buf.truncate(pos + marker.len());
            break;
        }
        if buf.len() >= MAX_PUBLIC_KEY_READ {
            return Err(HandshakeError::BadPublicKey(format!(
                "no PEM footer within {MAX_PUBLIC_KEY_READ} bytes"
            )));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::BadPublicKey(
                "connection closed before the key was complete".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    String::from_utf8(buf).map_err(|_| HandshakeError::BadPublicKey("key is not UTF-8".into()))
}

/// Run the client side of the handshake. On return the stream is ready to
/// carry relayed traffic.
pub async fn authenticate<S>(stream: &mut S, secret: &[u8]) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pem = read_public_key(stream).await?;
    let mut ciphertext = encrypt_for(&pem, secret).map_err(|e| match e {
        CryptoError::Decode(reason) => HandshakeError::BadPublicKey(reason),
        other => HandshakeError::Encrypt(other),
    })?;
    ciphertext.extend_from_slice(b"\r\n");
    stream.write_all(&ciphertext).await?;
    stream.flush().await?;
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
