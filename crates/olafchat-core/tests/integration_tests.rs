//! Scenario tests for the server state machine and routing, run at the
//! channel level: sessions are registered directly on `ServerNode`s and
//! frames are pumped between nodes by hand, so every assertion is
//! deterministic.

use olafchat_core::config::ServerConfig;
use olafchat_core::crypto::{self, IdentityKeypair};
use olafchat_core::protocol::{ChatBody, Payload, SignedEnvelope, WireMessage};
use olafchat_core::server::{ServerNode, SessionId};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::mpsc;

// ========================================
// Test helpers
// ========================================

fn make_node(port: u16, neighbours: Vec<&str>) -> Arc<ServerNode> {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port,
        neighbours: neighbours.into_iter().map(String::from).collect(),
    };
    let identity = IdentityKeypair::generate().expect("generate server identity");
    ServerNode::new(config, identity).expect("build node")
}

/// A scripted client: owns a key pair and its outbound counter.
struct TestClient {
    kp: IdentityKeypair,
    counter: u64,
}

impl TestClient {
    fn new() -> Self {
        Self {
            kp: IdentityKeypair::generate().expect("generate client identity"),
            counter: 0,
        }
    }

    fn fingerprint(&self) -> String {
        self.kp.fingerprint()
    }

    fn next_counter(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn seal(&self, payload: Payload, counter: u64) -> String {
        let envelope = SignedEnvelope::seal(payload, counter, &self.kp).expect("seal");
        WireMessage::SignedData(envelope).encode().expect("encode")
    }

    fn hello(&mut self) -> String {
        let counter = self.next_counter();
        self.seal(
            Payload::Hello {
                public_key: self.kp.public_key().to_base64_der(),
            },
            counter,
        )
    }

    fn public_chat(&mut self, text: &str) -> String {
        let counter = self.next_counter();
        self.seal(
            Payload::PublicChat {
                sender: self.fingerprint(),
                message: text.to_string(),
            },
            counter,
        )
    }

    fn chat(&mut self, text: &str, recipients: &[&TestClient], destinations: &[&str]) -> String {
        let mut participants = vec![self.fingerprint()];
        participants.extend(recipients.iter().map(|r| r.fingerprint()));
        let body = ChatBody {
            participants,
            message: text.to_string(),
        };
        let plaintext = body.to_json().expect("chat body");

        let mut keys = vec![self.kp.public_key()];
        keys.extend(recipients.iter().map(|r| r.kp.public_key()));
        let sealed = crypto::hybrid_encrypt(&keys, plaintext.as_bytes()).expect("encrypt");

        let counter = self.next_counter();
        self.seal(
            Payload::Chat {
                destination_servers: destinations.iter().map(|d| d.to_string()).collect(),
                iv: BASE64.encode(sealed.iv),
                symm_keys: sealed.wrapped_keys.iter().map(|k| BASE64.encode(k)).collect(),
                chat: BASE64.encode(&sealed.ciphertext),
            },
            counter,
        )
    }

    /// Decrypt a received chat frame, returning the body if addressed to us.
    fn open_chat(&self, frame: &str) -> Option<ChatBody> {
        let WireMessage::SignedData(envelope) = WireMessage::decode(frame).ok()? else {
            return None;
        };
        let Payload::Chat {
            iv,
            symm_keys,
            chat,
            ..
        } = envelope.payload()
        else {
            return None;
        };
        let iv = BASE64.decode(iv).ok()?;
        let ciphertext = BASE64.decode(chat).ok()?;
        let wrapped: Vec<Vec<u8>> = symm_keys
            .iter()
            .filter_map(|k| BASE64.decode(k).ok())
            .collect();
        let plaintext = crypto::hybrid_decrypt(&self.kp, &iv, &ciphertext, &wrapped).ok()?;
        ChatBody::from_json(&plaintext).ok()
    }
}

/// Attach a scripted client to a node: register a session and send hello.
async fn attach(node: &Arc<ServerNode>, client: &mut TestClient) -> (SessionId, mpsc::Receiver<String>) {
    let (session, rx) = node.register_session().await;
    node.handle_frame(session, &client.hello()).await;
    (session, rx)
}

/// Drain everything currently queued for a session.
fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

fn texts_of_public_chats(frames: &[String]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|frame| match WireMessage::decode(frame).ok()? {
            WireMessage::SignedData(envelope) => match envelope.payload() {
                Payload::PublicChat { message, .. } => Some(message.clone()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

/// A bidirectional server↔server link pumped by hand.
struct Link {
    s1: Arc<ServerNode>,
    session_on_s1: SessionId,
    rx_from_s1: mpsc::Receiver<String>,
    s2: Arc<ServerNode>,
    session_on_s2: SessionId,
    rx_from_s2: mpsc::Receiver<String>,
}

impl Link {
    /// Establish the link as if `s1` had dialled `s2`: greeting frames
    /// flow to `s2`, whose replies flow back.
    async fn establish(s1: &Arc<ServerNode>, s2: &Arc<ServerNode>) -> Link {
        let (session_on_s1, rx_from_s1) = s1.register_server_peer(&s2.address()).await;
        let (session_on_s2, rx_from_s2) = s2.register_session().await;
        let mut link = Link {
            s1: Arc::clone(s1),
            session_on_s1,
            rx_from_s1,
            s2: Arc::clone(s2),
            session_on_s2,
            rx_from_s2,
        };
        for frame in s1.greeting_frames().expect("greeting") {
            s2.handle_frame(link.session_on_s2, &frame).await;
        }
        link.pump().await;
        link
    }

    /// Shuttle frames in both directions until nothing moves.
    async fn pump(&mut self) {
        loop {
            let mut moved = false;
            while let Ok(frame) = self.rx_from_s1.try_recv() {
                self.s2.handle_frame(self.session_on_s2, &frame).await;
                moved = true;
            }
            while let Ok(frame) = self.rx_from_s2.try_recv() {
                self.s1.handle_frame(self.session_on_s1, &frame).await;
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }
}

// ========================================
// Scenario 1: single-server public broadcast (+ replay)
// ========================================

#[tokio::test]
async fn test_single_server_public_broadcast_and_replay() {
    let node = make_node(4678, vec![]);
    let mut alice = TestClient::new();
    let mut bob = TestClient::new();
    let mut carol = TestClient::new();

    let (a_session, mut a_rx) = attach(&node, &mut alice).await;
    let (_b_session, mut b_rx) = attach(&node, &mut bob).await;
    let (_c_session, mut c_rx) = attach(&node, &mut carol).await;

    let frame = alice.public_chat("hi");
    node.handle_frame(a_session, &frame).await;

    assert_eq!(texts_of_public_chats(&drain(&mut b_rx)), vec!["hi"]);
    assert_eq!(texts_of_public_chats(&drain(&mut c_rx)), vec!["hi"]);
    // The sender's own session is excluded from the fan-out.
    assert!(texts_of_public_chats(&drain(&mut a_rx)).is_empty());

    // Replaying the identical envelope fails the counter check.
    node.handle_frame(a_session, &frame).await;
    assert!(texts_of_public_chats(&drain(&mut b_rx)).is_empty());
    assert!(texts_of_public_chats(&drain(&mut c_rx)).is_empty());
}

// ========================================
// Scenario 2: private chat across two servers
// ========================================

#[tokio::test]
async fn test_private_chat_cross_server() {
    let s1 = make_node(4678, vec!["127.0.0.1:4679"]);
    let s2 = make_node(4679, vec!["127.0.0.1:4678"]);

    let mut alice = TestClient::new();
    let mut bob = TestClient::new();
    let mut carol = TestClient::new();

    let (a_session, mut _a_rx) = attach(&s1, &mut alice).await;
    let mut link = Link::establish(&s1, &s2).await;
    let (_b_session, mut b_rx) = attach(&s2, &mut bob).await;
    let (_c_session, mut c_rx) = attach(&s2, &mut carol).await;
    link.pump().await;
    drain(&mut b_rx);
    drain(&mut c_rx);

    let frame = alice.chat("meet at noon", &[&bob], &["127.0.0.1:4679"]);
    s1.handle_frame(a_session, &frame).await;
    link.pump().await;

    // Both of S2's clients get the envelope; only Bob can open it.
    let b_frames = drain(&mut b_rx);
    let c_frames = drain(&mut c_rx);
    assert_eq!(b_frames.len(), 1);
    assert_eq!(c_frames.len(), 1);

    let body = bob.open_chat(&b_frames[0]).expect("bob decrypts");
    assert_eq!(body.message, "meet at noon");
    assert_eq!(body.participants, vec![alice.fingerprint(), bob.fingerprint()]);

    assert!(carol.open_chat(&c_frames[0]).is_none());
}

#[tokio::test]
async fn test_chat_to_unknown_server_not_forwarded() {
    let s1 = make_node(4678, vec!["127.0.0.1:4679"]);
    let s2 = make_node(4679, vec!["127.0.0.1:4678"]);

    let mut alice = TestClient::new();
    let mut bob = TestClient::new();

    let (a_session, _a_rx) = attach(&s1, &mut alice).await;
    let mut link = Link::establish(&s1, &s2).await;
    let (_b_session, mut b_rx) = attach(&s2, &mut bob).await;
    link.pump().await;
    drain(&mut b_rx);

    // Destination names a server S1 has no session to.
    let frame = alice.chat("into the void", &[&bob], &["127.0.0.1:9999"]);
    s1.handle_frame(a_session, &frame).await;
    link.pump().await;

    assert!(drain(&mut b_rx).is_empty());
}

// ========================================
// Scenario 3: counter monotonicity
// ========================================

#[tokio::test]
async fn test_counter_monotonicity() {
    let node = make_node(4678, vec![]);
    let mut alice = TestClient::new();
    let mut bob = TestClient::new();

    let (a_session, _a_rx) = attach(&node, &mut alice).await;
    let (_b_session, mut b_rx) = attach(&node, &mut bob).await;

    let first = alice.public_chat("one"); // counter 2
    let second = alice.public_chat("two"); // counter 3
    node.handle_frame(a_session, &first).await;
    node.handle_frame(a_session, &second).await;
    // Counter 2 again: valid signature, stale counter.
    node.handle_frame(a_session, &first).await;

    assert_eq!(texts_of_public_chats(&drain(&mut b_rx)), vec!["one", "two"]);
}

// ========================================
// Scenario 4: directory update on disconnect
// ========================================

#[tokio::test]
async fn test_directory_update_on_disconnect() {
    let s1 = make_node(4678, vec!["127.0.0.1:4679"]);
    let s2 = make_node(4679, vec!["127.0.0.1:4678"]);

    let mut alice = TestClient::new();
    let mut bob = TestClient::new();

    let (a_session, mut a_rx) = attach(&s1, &mut alice).await;
    let mut link = Link::establish(&s1, &s2).await;

    let (b_session, _b_rx) = attach(&s2, &mut bob).await;
    link.pump().await;

    let bob_key = bob.kp.public_key().to_base64_der();
    let list = s1.client_list().await;
    assert!(
        list.servers
            .iter()
            .any(|s| s.address == "127.0.0.1:4679" && s.clients.contains(&bob_key)),
        "S1's aggregate should show Bob via S2"
    );

    // Bob disconnects; S2 pushes the shrunken list to S1.
    s2.handle_disconnect(b_session).await;
    link.pump().await;

    let list = s1.client_list().await;
    assert!(
        !list.servers.iter().any(|s| s.clients.contains(&bob_key)),
        "Bob should be gone after the push"
    );

    // A fresh client_list_request from Alice no longer shows Bob.
    drain(&mut a_rx);
    s1.handle_frame(a_session, r#"{"type":"client_list_request"}"#)
        .await;
    let frames = drain(&mut a_rx);
    assert_eq!(frames.len(), 1);
    match WireMessage::decode(&frames[0]).expect("decode") {
        WireMessage::ClientList(list) => {
            assert!(!list.servers.iter().any(|s| s.clients.contains(&bob_key)));
        }
        other => panic!("expected client_list, got {:?}", other.type_name()),
    }
}

// ========================================
// Scenario 5: unknown-type drop keeps the session
// ========================================

#[tokio::test]
async fn test_unknown_type_dropped_session_survives() {
    let node = make_node(4678, vec![]);
    let mut alice = TestClient::new();
    let (a_session, mut a_rx) = attach(&node, &mut alice).await;

    node.handle_frame(a_session, r#"{"type":"ping"}"#).await;

    // Session still answers.
    s_request(&node, a_session).await;
    let frames = drain(&mut a_rx);
    assert!(frames
        .iter()
        .any(|f| matches!(WireMessage::decode(f), Ok(WireMessage::ClientList(_)))));
}

async fn s_request(node: &Arc<ServerNode>, session: SessionId) {
    node.handle_frame(session, r#"{"type":"client_list_request"}"#)
        .await;
}

// ========================================
// Cross-server public broadcast
// ========================================

#[tokio::test]
async fn test_public_chat_crosses_servers_once() {
    let s1 = make_node(4678, vec!["127.0.0.1:4679"]);
    let s2 = make_node(4679, vec!["127.0.0.1:4678"]);

    let mut alice = TestClient::new();
    let mut bob = TestClient::new();

    let (a_session, mut a_rx) = attach(&s1, &mut alice).await;
    let mut link = Link::establish(&s1, &s2).await;
    let (_b_session, mut b_rx) = attach(&s2, &mut bob).await;
    link.pump().await;
    drain(&mut a_rx);
    drain(&mut b_rx);

    s1.handle_frame(a_session, &alice.public_chat("hello mesh")).await;
    link.pump().await;

    assert_eq!(texts_of_public_chats(&drain(&mut b_rx)), vec!["hello mesh"]);
    // No copy loops back to Alice.
    assert!(texts_of_public_chats(&drain(&mut a_rx)).is_empty());
}

// ========================================
// Boundary: self-addressed chat delivered locally
// ========================================

#[tokio::test]
async fn test_chat_delivered_to_local_recipients() {
    let node = make_node(4678, vec![]);
    let mut alice = TestClient::new();
    let mut bob = TestClient::new();

    let (a_session, _a_rx) = attach(&node, &mut alice).await;
    let (_b_session, mut b_rx) = attach(&node, &mut bob).await;

    let frame = alice.chat("same server", &[&bob], &["127.0.0.1:4678"]);
    node.handle_frame(a_session, &frame).await;

    let frames = drain(&mut b_rx);
    assert_eq!(frames.len(), 1);
    let body = bob.open_chat(&frames[0]).expect("bob decrypts");
    assert_eq!(body.message, "same server");
}
