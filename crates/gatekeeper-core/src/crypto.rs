//! Cryptographic primitives for Gatekeeper.
//!
//! Provides two things:
//!   1. SHA-256 digests, the key of every mapping entry
//!   2. The per-process RSA key pair used by the handshake
//!
//! The key pair is generated fresh every time a listener starts and is never
//! written anywhere. Clients receive the public half as SPKI PEM and encrypt
//! their secret under it with OAEP/SHA-256.
//!
//! Decrypted secrets live in `Zeroizing` buffers and are wiped as soon as
//! their digest has been computed.

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Default modulus size for a freshly generated key pair.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// PEM footer that terminates the exported public key on the wire.
pub const PUBLIC_KEY_PEM_FOOTER: &str = "-----END PUBLIC KEY-----";

// ── SHA-256 ───────────────────────────────────────────────────────────────────

/// Lowercase hex SHA-256 digest of `secret`.
///
/// This is the form mapping tables are keyed by.
pub fn digest_of(secret: &[u8]) -> String {
    hex::encode(Sha256::digest(secret))
}

/// True if `s` looks like a SHA-256 hex digest (64 hex chars, any case).
pub fn is_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

// ── Key pair ──────────────────────────────────────────────────────────────────

/// A listener's RSA key pair.
///
/// The exported public key is computed once at generation time so every
/// handshake can send it without re-encoding.
pub struct KeyPair {
    private: RsaPrivateKey,
    public_pem: String,
}

impl KeyPair {
    /// Generate a new random key pair of `bits` modulus size.
    ///
    /// This is CPU-heavy; async callers should run it on a blocking thread.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(CryptoError::Rsa)?;
        let mut public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Encode(e.to_string()))?;
        // Clients read up to the footer's newline.
        if !public_pem.ends_with('\n') {
            public_pem.push('\n');
        }
        Ok(Self {
            private,
            public_pem,
        })
    }

    /// The public key as SPKI PEM, exactly as sent to clients.
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// Modulus length in bytes. Every valid ciphertext has exactly this length.
    pub fn modulus_len(&self) -> usize {
        self.private.size()
    }

    /// Decrypt a client's ciphertext.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if ciphertext.is_empty() {
            return Err(CryptoError::Empty);
        }
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(CryptoError::Rsa)
    }

    /// Decrypt a ciphertext and return the digest of the plaintext.
    ///
    /// The plaintext never leaves this function.
    pub fn decrypt_digest(&self, ciphertext: &[u8]) -> Result<String, CryptoError> {
        let plaintext = self.decrypt(ciphertext)?;
        Ok(digest_of(&plaintext))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("modulus_len", &self.modulus_len())
            .finish_non_exhaustive()
    }
}

/// Encrypt `secret` under a PEM-encoded public key received from a listener.
pub fn encrypt_for(public_pem: &str, secret: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let public = RsaPublicKey::from_public_key_pem(public_pem.trim())
        .map_err(|e| CryptoError::Decode(e.to_string()))?;
    public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), secret)
        .map_err(CryptoError::Rsa)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA operation failed: {0}")]
    Rsa(rsa::Error),
    #[error("failed to encode public key: {0}")]
    Encode(String),
    #[error("failed to decode public key: {0}")]
    Decode(String),
    #[error("empty ciphertext")]
    Empty,
}
