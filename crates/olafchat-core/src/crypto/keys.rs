//! RSA identity keys and fingerprints.
//!
//! A client identity is a long-term RSA key pair. On the wire, public keys
//! travel as base64 of the DER-encoded SubjectPublicKeyInfo; the fingerprint
//! is Base64(SHA-256(DER)) and is the canonical client identifier.

use crate::error::{Error, Result};
use crate::logging::ShortFingerprint;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;

/// RSA modulus size in bits for newly generated identities.
pub const KEY_BITS: usize = 2048;

/// Minimum accepted modulus size in bytes when importing a peer's key.
const MIN_MODULUS_BYTES: usize = KEY_BITS / 8;

/// A peer's public identity key.
///
/// Carries the parsed RSA key together with its DER SubjectPublicKeyInfo
/// encoding, so exports and fingerprints are computed from the exact bytes
/// that travelled on the wire.
#[derive(Clone)]
pub struct IdentityPublicKey {
    key: RsaPublicKey,
    der: Vec<u8>,
}

impl IdentityPublicKey {
    /// Wrap an RSA public key, computing its DER encoding.
    pub fn from_rsa(key: RsaPublicKey) -> Result<Self> {
        let der = key
            .to_public_key_der()
            .map_err(|e| Error::BadKey(e.to_string()))?
            .as_bytes()
            .to_vec();
        Ok(Self { key, der })
    }

    /// Import a key from base64-encoded DER SubjectPublicKeyInfo.
    pub fn from_base64_der(encoded: &str) -> Result<Self> {
        let der = BASE64
            .decode(encoded)
            .map_err(|e| Error::BadKey(e.to_string()))?;
        let key = RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| Error::BadKey(e.to_string()))?;
        if key.size() < MIN_MODULUS_BYTES {
            return Err(Error::BadKey(format!(
                "modulus too small: {} bytes",
                key.size()
            )));
        }
        Ok(Self { key, der })
    }

    /// Export as base64-encoded DER SubjectPublicKeyInfo.
    pub fn to_base64_der(&self) -> String {
        BASE64.encode(&self.der)
    }

    /// The fingerprint: Base64(SHA-256(DER SubjectPublicKeyInfo)).
    ///
    /// Stable across sessions; the canonical client identifier.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.der);
        BASE64.encode(digest)
    }

    /// The DER SubjectPublicKeyInfo bytes.
    pub fn der_bytes(&self) -> &[u8] {
        &self.der
    }

    pub(crate) fn rsa(&self) -> &RsaPublicKey {
        &self.key
    }
}

impl PartialEq for IdentityPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for IdentityPublicKey {}

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IdentityPublicKey({})",
            ShortFingerprint(&self.fingerprint())
        )
    }
}

/// A long-term RSA identity key pair.
pub struct IdentityKeypair {
    private: RsaPrivateKey,
    public: IdentityPublicKey,
}

impl IdentityKeypair {
    /// Generate a new RSA-2048 identity.
    ///
    /// Key generation is the one genuinely slow operation in the crate; it
    /// runs once at process start.
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, KEY_BITS)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let public = IdentityPublicKey::from_rsa(RsaPublicKey::from(&private))?;
        Ok(Self { private, public })
    }

    /// The public half of the identity.
    pub fn public_key(&self) -> &IdentityPublicKey {
        &self.public
    }

    /// Fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }

    pub(crate) fn rsa_private(&self) -> &RsaPrivateKey {
        &self.private
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("public", &self.public)
            .field("private", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_export() {
        let kp = IdentityKeypair::generate().expect("should generate");
        let exported = kp.public_key().to_base64_der();

        let imported = IdentityPublicKey::from_base64_der(&exported).expect("should import");
        assert_eq!(imported, *kp.public_key());
        assert_eq!(imported.to_base64_der(), exported);
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let kp = IdentityKeypair::generate().expect("should generate");
        let fp1 = kp.fingerprint();
        let fp2 = IdentityPublicKey::from_base64_der(&kp.public_key().to_base64_der())
            .expect("should import")
            .fingerprint();
        assert_eq!(fp1, fp2);

        // Base64 of a SHA-256 digest is 44 characters.
        assert_eq!(fp1.len(), 44);
    }

    #[test]
    fn test_distinct_keys_distinct_fingerprints() {
        let a = IdentityKeypair::generate().expect("should generate");
        let b = IdentityKeypair::generate().expect("should generate");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_import_rejects_garbage() {
        assert!(IdentityPublicKey::from_base64_der("not base64!!!").is_err());
        assert!(IdentityPublicKey::from_base64_der("AAAA").is_err());
    }
}
