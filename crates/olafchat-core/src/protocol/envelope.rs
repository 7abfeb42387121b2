//! Top-level wire messages and the signed envelope.
//!
//! The envelope keeps the received `data` text as an opaque raw value so
//! that verification and forwarding operate on the exact originator bytes.

use crate::crypto::{self, IdentityKeypair, IdentityPublicKey};
use crate::error::{Error, Result};
use crate::protocol::payload::Payload;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// One `servers[]` entry of a `client_list`: a home server and the clients
/// attached to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerClients {
    /// The server's `host:port` identity.
    pub address: String,
    /// Base64 DER public keys of that server's clients.
    pub clients: Vec<String>,
}

/// The `client_list` message body: the known neighbourhood directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientList {
    /// One entry per known home server.
    pub servers: Vec<ServerClients>,
}

/// A `signed_data` envelope.
///
/// `data` holds the exact JSON text the signature covers; `payload` is the
/// parsed view of the same bytes. The two never diverge: inbound envelopes
/// parse `payload` out of `data`, outbound envelopes serialise `payload`
/// once into `data` before signing.
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    data: Box<RawValue>,
    payload: Payload,
    counter: u64,
    signature_b64: String,
}

impl SignedEnvelope {
    /// Build and sign an envelope for an outbound payload.
    pub fn seal(payload: Payload, counter: u64, keypair: &IdentityKeypair) -> Result<Self> {
        let data_text = serde_json::to_string(&payload)?;
        let signature = crypto::sign(keypair, data_text.as_bytes(), counter)?;
        let data = RawValue::from_string(data_text)?;
        Ok(Self {
            data,
            payload,
            counter,
            signature_b64: BASE64.encode(signature),
        })
    }

    /// The parsed payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The envelope counter.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// The exact `data` bytes the signature covers.
    pub fn data_bytes(&self) -> &[u8] {
        self.data.get().as_bytes()
    }

    /// Verify the signature under `public`.
    pub fn verify(&self, public: &IdentityPublicKey) -> Result<()> {
        let signature = BASE64
            .decode(&self.signature_b64)
            .map_err(|_| Error::BadSignature)?;
        crypto::verify(public, self.data_bytes(), self.counter, &signature)
    }
}

/// A decoded top-level wire message.
#[derive(Debug, Clone)]
pub enum WireMessage {
    /// A signed envelope carrying an application payload.
    SignedData(SignedEnvelope),
    /// Unsigned request for the directory.
    ClientListRequest,
    /// Unsigned directory response / push.
    ClientList(ClientList),
}

/// Raw top-level frame shape used for two-stage decoding. Keeping `data`
/// as a raw value is what preserves the originator's bytes.
#[derive(Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    data: Option<Box<RawValue>>,
    counter: Option<u64>,
    signature: Option<String>,
    servers: Option<Vec<ServerClients>>,
}

#[derive(Serialize)]
struct SignedFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a RawValue,
    counter: u64,
    signature: &'a str,
}

#[derive(Serialize)]
struct BareFrame {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ClientListFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    servers: &'a [ServerClients],
}

impl WireMessage {
    /// Decode one frame of wire text.
    ///
    /// Rejects unknown top-level types, missing required fields, malformed
    /// base64 signatures, and payloads that fail structural validation.
    pub fn decode(text: &str) -> Result<Self> {
        let frame: Frame = serde_json::from_str(text)?;
        match frame.kind.as_str() {
            "signed_data" => {
                let data = frame
                    .data
                    .ok_or_else(|| Error::Protocol("signed_data without data".into()))?;
                let counter = frame
                    .counter
                    .ok_or_else(|| Error::Protocol("signed_data without counter".into()))?;
                let signature_b64 = frame
                    .signature
                    .ok_or_else(|| Error::Protocol("signed_data without signature".into()))?;
                BASE64
                    .decode(&signature_b64)
                    .map_err(|_| Error::Protocol("malformed base64 in signature".into()))?;

                let payload: Payload = serde_json::from_str(data.get())?;
                payload.validate()?;

                Ok(WireMessage::SignedData(SignedEnvelope {
                    data,
                    payload,
                    counter,
                    signature_b64,
                }))
            }
            "client_list_request" => Ok(WireMessage::ClientListRequest),
            "client_list" => {
                let servers = frame
                    .servers
                    .ok_or_else(|| Error::Protocol("client_list without servers".into()))?;
                Ok(WireMessage::ClientList(ClientList { servers }))
            }
            other => Err(Error::Protocol(format!(
                "unknown message type {:?}",
                other
            ))),
        }
    }

    /// Encode to wire text.
    ///
    /// For `signed_data` the `data`, `counter`, and `signature` fields are
    /// emitted exactly as received or sealed, so forwarding a decoded
    /// envelope reproduces the originator's signed bytes.
    pub fn encode(&self) -> Result<String> {
        let text = match self {
            WireMessage::SignedData(envelope) => serde_json::to_string(&SignedFrame {
                kind: "signed_data",
                data: &envelope.data,
                counter: envelope.counter,
                signature: &envelope.signature_b64,
            })?,
            WireMessage::ClientListRequest => serde_json::to_string(&BareFrame {
                kind: "client_list_request",
            })?,
            WireMessage::ClientList(list) => serde_json::to_string(&ClientListFrame {
                kind: "client_list",
                servers: &list.servers,
            })?,
        };
        Ok(text)
    }

    /// The wire name of this message's type, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::SignedData(_) => "signed_data",
            WireMessage::ClientListRequest => "client_list_request",
            WireMessage::ClientList(_) => "client_list",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair() -> IdentityKeypair {
        IdentityKeypair::generate().expect("should generate")
    }

    #[test]
    fn test_seal_verify_roundtrip() {
        let kp = test_keypair();
        let payload = Payload::PublicChat {
            sender: kp.fingerprint(),
            message: "hello neighbourhood".to_string(),
        };

        let envelope = SignedEnvelope::seal(payload, 2, &kp).expect("should seal");
        envelope.verify(kp.public_key()).expect("should verify");

        let text = WireMessage::SignedData(envelope).encode().expect("encode");
        let decoded = WireMessage::decode(&text).expect("decode");
        match decoded {
            WireMessage::SignedData(envelope) => {
                envelope.verify(kp.public_key()).expect("should verify after roundtrip");
                assert_eq!(envelope.counter(), 2);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_forwarding_preserves_unknown_fields() {
        let kp = test_keypair();

        // A sender running a newer protocol revision adds a field we do not
        // know about. The signature covers it; forwarding must keep it.
        let data_text = format!(
            r#"{{"type":"public_chat","sender":"{}","message":"hi","hop_hint":3}}"#,
            kp.fingerprint()
        );
        let signature = crate::crypto::sign(&kp, data_text.as_bytes(), 5).expect("sign");
        let frame = format!(
            r#"{{"type":"signed_data","data":{},"counter":5,"signature":"{}"}}"#,
            data_text,
            BASE64.encode(signature)
        );

        let decoded = WireMessage::decode(&frame).expect("decode");
        let envelope = match &decoded {
            WireMessage::SignedData(envelope) => envelope,
            other => panic!("unexpected message: {:?}", other),
        };
        assert_eq!(envelope.data_bytes(), data_text.as_bytes());
        envelope.verify(kp.public_key()).expect("should verify");

        // Re-encoding (the forwarding path) keeps the data text intact.
        let forwarded = decoded.encode().expect("encode");
        assert!(forwarded.contains(r#""hop_hint":3"#));
        match WireMessage::decode(&forwarded).expect("decode forwarded") {
            WireMessage::SignedData(envelope) => {
                envelope.verify(kp.public_key()).expect("should still verify")
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_top_level_type_rejected() {
        assert!(WireMessage::decode(r#"{"type":"ping"}"#).is_err());
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert!(WireMessage::decode(r#"{"type":"signed_data"}"#).is_err());
        assert!(
            WireMessage::decode(r#"{"type":"signed_data","data":{"type":"hello"},"counter":1}"#)
                .is_err()
        );
        assert!(WireMessage::decode(r#"{"type":"client_list"}"#).is_err());
    }

    #[test]
    fn test_negative_counter_rejected() {
        let frame = r#"{"type":"signed_data","data":{"type":"server_hello","sender":"a:1"},"counter":-1,"signature":"AAAA"}"#;
        assert!(WireMessage::decode(frame).is_err());
    }

    #[test]
    fn test_malformed_signature_base64_rejected() {
        let frame = r#"{"type":"signed_data","data":{"type":"server_hello","sender":"a:1"},"counter":1,"signature":"!!!"}"#;
        assert!(WireMessage::decode(frame).is_err());
    }

    #[test]
    fn test_client_list_roundtrip() {
        let list = ClientList {
            servers: vec![ServerClients {
                address: "localhost:4678".to_string(),
                clients: vec!["AAAA".to_string(), "BBBB".to_string()],
            }],
        };
        let text = WireMessage::ClientList(list.clone()).encode().expect("encode");
        match WireMessage::decode(&text).expect("decode") {
            WireMessage::ClientList(back) => assert_eq!(back, list),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_client_list_request_roundtrip() {
        let text = WireMessage::ClientListRequest.encode().expect("encode");
        assert_eq!(text, r#"{"type":"client_list_request"}"#);
        assert!(matches!(
            WireMessage::decode(&text).expect("decode"),
            WireMessage::ClientListRequest
        ));
    }
}
