//! Cryptographic primitives for the chat overlay.
//!
//! The protocol fixes the suite:
//!
//! - **RSA-2048** long-term identity keys (public exponent 65537)
//! - **RSA-PSS / SHA-256** envelope signatures
//! - **RSA-OAEP / SHA-256** per-recipient message-key wrapping
//! - **AES-256-GCM** message body encryption
//! - **SHA-256** fingerprints over the DER SubjectPublicKeyInfo
//!
//! All primitives come from audited RustCrypto crates; nothing here rolls
//! its own arithmetic.

mod hybrid;
mod keys;
mod sign;

pub use hybrid::{hybrid_decrypt, hybrid_encrypt, HybridCiphertext, AES_KEY_SIZE, IV_SIZE};
pub use keys::{IdentityKeypair, IdentityPublicKey, KEY_BITS};
pub use sign::{sign, verify};

use rand::RngCore;

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}
