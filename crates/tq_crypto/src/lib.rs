//! Session cryptography for the TQ protocol: the CAST5-CFB64 stream
//! contexts both directions of a connection run through, and the
//! Diffie-Hellman exchange that upgrades the fixed bootstrap key to a
//! per-session key.

pub mod cipher;
pub mod dh;

pub use cipher::TqCipher;
pub use dh::DhExchange;
use thiserror::Error;

/// The fixed ASCII key every connection starts with. The initial
/// key-exchange packet is encrypted under it; the session key derived from
/// the exchange replaces it.
pub const BOOTSTRAP_KEY: &[u8; 16] = b"R3Xx97ra5j8D6uZz";

#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum CryptoError {
    #[error("cipher used before a key was generated")]
    NotInitialized,
    #[error("malformed key-exchange response: {0}")]
    BadDhResponse(String),
}
