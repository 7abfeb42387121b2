//! Error types for the chat core.
//!
//! Messages stay generic: protocol errors are routinely logged for frames
//! received from untrusted peers, so they must not echo attacker-controlled
//! detail or key material.

use thiserror::Error;

/// Core error type for protocol, crypto, and transport operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Key material could not be parsed or used.
    #[error("invalid key material")]
    BadKey(String),

    /// A signature did not verify under the purported sender's key.
    #[error("signature verification failed")]
    BadSignature,

    /// An AEAD open failed: wrong key, wrong IV, or tampered ciphertext.
    #[error("ciphertext authentication failed")]
    BadCiphertext,

    /// Cryptographic operation failed for a reason other than the above.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Malformed or disallowed wire input. The offending frame is dropped;
    /// the session stays open.
    #[error("protocol error")]
    Protocol(String),

    /// Encoding or decoding failure (JSON, base64).
    #[error("encoding error")]
    Encoding(String),

    /// Socket-level failure; the session is closed.
    #[error("transport error")]
    Transport(String),

    /// Invalid static configuration.
    #[error("configuration error")]
    Config(String),

    /// A replayed or stale counter was presented.
    #[error("stale counter")]
    StaleCounter,

    /// The requested entity is not known to this node.
    #[error("not found")]
    NotFound(String),
}

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
