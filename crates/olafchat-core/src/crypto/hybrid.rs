//! Multi-recipient hybrid encryption.
//!
//! One fresh 256-bit AES key and 96-bit IV per message. The body is
//! encrypted once under AES-256-GCM; the AES key is wrapped independently
//! under each recipient's RSA public key with OAEP-SHA256. A recipient
//! tries each wrapped key in order; the GCM tag decides success.

use crate::crypto::keys::{IdentityKeypair, IdentityPublicKey};
use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rsa::Oaep;
use sha2::Sha256;
use zeroize::Zeroizing;

/// AES key size in bytes (256 bits).
pub const AES_KEY_SIZE: usize = 32;

/// GCM IV size in bytes (96 bits).
pub const IV_SIZE: usize = 12;

/// The output of [`hybrid_encrypt`]: one ciphertext, one IV, and one
/// wrapped key per recipient (in recipient order).
#[derive(Debug, Clone)]
pub struct HybridCiphertext {
    /// Random GCM IV.
    pub iv: [u8; IV_SIZE],
    /// AES-256-GCM ciphertext with appended tag.
    pub ciphertext: Vec<u8>,
    /// The message key wrapped under each recipient's RSA-OAEP key.
    pub wrapped_keys: Vec<Vec<u8>>,
}

/// Encrypt `plaintext` for every key in `recipients`.
pub fn hybrid_encrypt(
    recipients: &[&IdentityPublicKey],
    plaintext: &[u8],
) -> Result<HybridCiphertext> {
    if recipients.is_empty() {
        return Err(Error::Crypto("no recipients".into()));
    }

    let mut key = Zeroizing::new([0u8; AES_KEY_SIZE]);
    rand::rngs::OsRng.fill_bytes(key.as_mut());
    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| Error::Crypto("encryption failed".into()))?;

    let mut wrapped_keys = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let wrapped = recipient
            .rsa()
            .encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), key.as_ref())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        wrapped_keys.push(wrapped);
    }

    Ok(HybridCiphertext {
        iv,
        ciphertext,
        wrapped_keys,
    })
}

/// Attempt to decrypt a hybrid ciphertext with this identity's private key.
///
/// Tries each wrapped key in turn; the first unwrap that yields a 256-bit
/// key *and* authenticates the GCM tag wins. Returns
/// [`Error::BadCiphertext`] when no wrapped key works, the usual case for
/// traffic addressed to somebody else.
pub fn hybrid_decrypt(
    keypair: &IdentityKeypair,
    iv: &[u8],
    ciphertext: &[u8],
    wrapped_keys: &[Vec<u8>],
) -> Result<Zeroizing<Vec<u8>>> {
    if iv.len() != IV_SIZE {
        return Err(Error::BadCiphertext);
    }

    for wrapped in wrapped_keys {
        let key = match keypair
            .rsa_private()
            .decrypt(Oaep::new::<Sha256>(), wrapped)
        {
            Ok(key) => Zeroizing::new(key),
            Err(_) => continue,
        };
        if key.len() != AES_KEY_SIZE {
            continue;
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        if let Ok(plaintext) = cipher.decrypt(Nonce::from_slice(iv), ciphertext) {
            return Ok(Zeroizing::new(plaintext));
        }
    }

    Err(Error::BadCiphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_recipient_can_decrypt() {
        let alice = IdentityKeypair::generate().expect("should generate");
        let bob = IdentityKeypair::generate().expect("should generate");
        let plaintext = b"meet at the usual place";

        let sealed = hybrid_encrypt(&[alice.public_key(), bob.public_key()], plaintext)
            .expect("should encrypt");
        assert_eq!(sealed.wrapped_keys.len(), 2);

        for kp in [&alice, &bob] {
            let opened = hybrid_decrypt(kp, &sealed.iv, &sealed.ciphertext, &sealed.wrapped_keys)
                .expect("should decrypt");
            assert_eq!(&*opened, plaintext);
        }
    }

    #[test]
    fn test_non_recipient_gets_bottom() {
        let alice = IdentityKeypair::generate().expect("should generate");
        let eve = IdentityKeypair::generate().expect("should generate");

        let sealed = hybrid_encrypt(&[alice.public_key()], b"secret").expect("should encrypt");
        assert!(matches!(
            hybrid_decrypt(&eve, &sealed.iv, &sealed.ciphertext, &sealed.wrapped_keys),
            Err(Error::BadCiphertext)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let alice = IdentityKeypair::generate().expect("should generate");

        let mut sealed = hybrid_encrypt(&[alice.public_key()], b"secret").expect("should encrypt");
        sealed.ciphertext[0] ^= 0xFF;
        assert!(
            hybrid_decrypt(&alice, &sealed.iv, &sealed.ciphertext, &sealed.wrapped_keys).is_err()
        );
    }

    #[test]
    fn test_bad_iv_length_rejected() {
        let alice = IdentityKeypair::generate().expect("should generate");
        let sealed = hybrid_encrypt(&[alice.public_key()], b"secret").expect("should encrypt");
        assert!(hybrid_decrypt(&alice, &[0u8; 7], &sealed.ciphertext, &sealed.wrapped_keys).is_err());
    }

    #[test]
    fn test_no_recipients_rejected() {
        assert!(hybrid_encrypt(&[], b"anything").is_err());
    }
}
