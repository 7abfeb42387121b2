//! Envelope signatures.
//!
//! The scheme is RSA-PSS with SHA-256 (MGF1-SHA256, salt length equal to
//! the digest length). The signing input is the serialised payload bytes
//! followed by the decimal ASCII representation of the counter; binding the
//! counter into the signature is what makes the counter an anti-replay
//! primitive rather than a hint.

use crate::crypto::keys::{IdentityKeypair, IdentityPublicKey};
use crate::error::{Error, Result};
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use sha2::Sha256;

/// Build the byte string that is signed: `data ∥ ascii_decimal(counter)`.
fn signing_input(data: &[u8], counter: u64) -> Vec<u8> {
    let counter_ascii = counter.to_string();
    let mut input = Vec::with_capacity(data.len() + counter_ascii.len());
    input.extend_from_slice(data);
    input.extend_from_slice(counter_ascii.as_bytes());
    input
}

/// Sign `data ∥ ascii_decimal(counter)` with the identity's private key.
///
/// Returns the raw signature bytes (the wire form is base64 of these).
pub fn sign(keypair: &IdentityKeypair, data: &[u8], counter: u64) -> Result<Vec<u8>> {
    let signing_key = SigningKey::<Sha256>::new(keypair.rsa_private().clone());
    let signature = signing_key
        .try_sign_with_rng(&mut rand::rngs::OsRng, &signing_input(data, counter))
        .map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(signature.to_vec())
}

/// Verify a signature over `data ∥ ascii_decimal(counter)`.
///
/// Any failure (malformed signature bytes, wrong key, a flipped bit in
/// `data` or `counter`) yields [`Error::BadSignature`].
pub fn verify(
    public: &IdentityPublicKey,
    data: &[u8],
    counter: u64,
    signature: &[u8],
) -> Result<()> {
    let verifying_key = VerifyingKey::<Sha256>::new(public.rsa().clone());
    let signature = Signature::try_from(signature).map_err(|_| Error::BadSignature)?;
    verifying_key
        .verify(&signing_input(data, counter), &signature)
        .map_err(|_| Error::BadSignature)
}
