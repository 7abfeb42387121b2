//! Payload variants carried in the `data` field of a signed envelope.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// The `data` object of a `signed_data` envelope, discriminated by its
/// `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Payload {
    /// First message on a client→server session; introduces the client's
    /// public key.
    #[serde(rename = "hello")]
    Hello {
        /// Base64 DER SubjectPublicKeyInfo of the client's RSA key.
        public_key: String,
    },

    /// First message on a server→server session.
    #[serde(rename = "server_hello")]
    ServerHello {
        /// The dialling server's `host:port` identity.
        sender: String,
    },

    /// Broadcast plaintext chat.
    #[serde(rename = "public_chat")]
    PublicChat {
        /// Fingerprint of the sending client.
        sender: String,
        /// Message text.
        message: String,
    },

    /// Private chat to one or more recipients.
    #[serde(rename = "chat")]
    Chat {
        /// Home servers of the recipients, as `host:port` strings.
        destination_servers: Vec<String>,
        /// Base64 of the 96-bit GCM IV.
        iv: String,
        /// Base64 of the message key wrapped under each recipient's RSA key.
        symm_keys: Vec<String>,
        /// Base64 of the AES-256-GCM ciphertext of the inner [`ChatBody`].
        chat: String,
    },
}

impl Payload {
    /// The wire name of this payload's type, for logging and dispatch.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Hello { .. } => "hello",
            Payload::ServerHello { .. } => "server_hello",
            Payload::PublicChat { .. } => "public_chat",
            Payload::Chat { .. } => "chat",
        }
    }

    /// Structural validation beyond what deserialisation enforces.
    ///
    /// Checks that base64-carrying fields actually decode and that list
    /// fields are non-empty, so later stages can assume well-formed input.
    pub fn validate(&self) -> Result<()> {
        match self {
            Payload::Hello { public_key } => {
                decode_checked(public_key, "public_key")?;
            }
            Payload::ServerHello { sender } => {
                if sender.is_empty() {
                    return Err(Error::Protocol("server_hello with empty sender".into()));
                }
            }
            Payload::PublicChat { sender, .. } => {
                if sender.is_empty() {
                    return Err(Error::Protocol("public_chat with empty sender".into()));
                }
            }
            Payload::Chat {
                destination_servers,
                iv,
                symm_keys,
                chat,
            } => {
                if destination_servers.is_empty() {
                    return Err(Error::Protocol("chat with no destination servers".into()));
                }
                if symm_keys.is_empty() {
                    return Err(Error::Protocol("chat with no wrapped keys".into()));
                }
                decode_checked(iv, "iv")?;
                decode_checked(chat, "chat")?;
                for key in symm_keys {
                    decode_checked(key, "symm_keys")?;
                }
            }
        }
        Ok(())
    }
}

fn decode_checked(encoded: &str, field: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded)
        .map_err(|_| Error::Protocol(format!("malformed base64 in {}", field)))
}

/// The decrypted inner plaintext of a `chat` payload.
///
/// `participants[0]` is the sender's fingerprint; the remainder are the
/// recipients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatBody {
    /// Fingerprints of everyone party to the message, sender first.
    pub participants: Vec<String>,
    /// Message text.
    pub message: String,
}

impl ChatBody {
    /// Serialise to the canonical JSON text that gets encrypted.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }

    /// Parse a decrypted plaintext. Rejects bodies without participants.
    pub fn from_json(text: &[u8]) -> Result<Self> {
        let body: ChatBody = serde_json::from_slice(text)?;
        if body.participants.is_empty() {
            return Err(Error::Protocol("chat body with no participants".into()));
        }
        Ok(body)
    }

    /// The sender's fingerprint (`participants[0]`).
    pub fn sender(&self) -> &str {
        self.participants.first().map(String::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_tagging() {
        let payload = Payload::PublicChat {
            sender: "fp".to_string(),
            message: "hi".to_string(),
        };
        let json = serde_json::to_string(&payload).expect("should serialise");
        assert_eq!(json, r#"{"type":"public_chat","sender":"fp","message":"hi"}"#);

        let back: Payload = serde_json::from_str(&json).expect("should parse");
        assert_eq!(back, payload);
    }

    #[test]
    fn test_unknown_payload_type_rejected() {
        let err = serde_json::from_str::<Payload>(r#"{"type":"ping"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_field_rejected() {
        let err = serde_json::from_str::<Payload>(r#"{"type":"hello"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_chat_validation() {
        let good = Payload::Chat {
            destination_servers: vec!["localhost:4679".to_string()],
            iv: "AAAAAAAAAAAAAAAA".to_string(),
            symm_keys: vec!["AAAA".to_string()],
            chat: "AAAA".to_string(),
        };
        assert!(good.validate().is_ok());

        let bad_iv = Payload::Chat {
            destination_servers: vec!["localhost:4679".to_string()],
            iv: "not base64!!!".to_string(),
            symm_keys: vec!["AAAA".to_string()],
            chat: "AAAA".to_string(),
        };
        assert!(bad_iv.validate().is_err());

        let no_dest = Payload::Chat {
            destination_servers: vec![],
            iv: "AAAA".to_string(),
            symm_keys: vec!["AAAA".to_string()],
            chat: "AAAA".to_string(),
        };
        assert!(no_dest.validate().is_err());
    }

    #[test]
    fn test_chat_body_roundtrip() {
        let body = ChatBody {
            participants: vec!["sender-fp".to_string(), "recipient-fp".to_string()],
            message: "hello".to_string(),
        };
        let json = body.to_json().expect("should serialise");
        let back = ChatBody::from_json(json.as_bytes()).expect("should parse");
        assert_eq!(back, body);
        assert_eq!(back.sender(), "sender-fp");
    }

    #[test]
    fn test_chat_body_requires_participants() {
        assert!(ChatBody::from_json(br#"{"participants":[],"message":"x"}"#).is_err());
        assert!(ChatBody::from_json(b"not json").is_err());
    }
}
