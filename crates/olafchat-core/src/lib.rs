//! # OLAF/Neighbourhood Chat Core Library
//!
//! The protocol core of a federated, end-to-end encrypted chat overlay.
//! Home servers form a meshed neighbourhood, exchange client directories,
//! and route signed envelopes between clients without being able to read
//! private payloads.
//!
//! ## Protocol Guarantees
//!
//! - Every application message travels inside a `signed_data` envelope
//!   carrying a per-sender strictly increasing counter (anti-replay)
//! - Private chats use hybrid encryption: AES-256-GCM for the body, the
//!   message key wrapped under each recipient's RSA key with OAEP-SHA256
//! - Servers forward envelopes byte-for-byte and never re-sign
//! - Clients are identified by the fingerprint of their RSA public key
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         server  │  client  │  cli       │
//! ├─────────────────────────────────────────┤
//! │      directory  │  neighbourhood        │
//! ├─────────────────────────────────────────┤
//! │           protocol (envelopes)          │
//! ├─────────────────────────────────────────┤
//! │                 crypto                  │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod client;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum accepted WebSocket frame size in bytes (256 KiB).
///
/// Generous enough for a chat envelope with several wrapped keys; anything
/// larger is treated as malformed input.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Capacity of the per-session outbound frame queue.
///
/// Sends block once the peer stops draining its socket.
pub const SESSION_QUEUE_DEPTH: usize = 64;
