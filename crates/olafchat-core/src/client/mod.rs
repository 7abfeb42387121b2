//! Client session: connect, identify, and exchange chat.
//!
//! A [`ClientSession`] owns the WebSocket to the home server and runs the
//! client state machine:
//!
//! ```text
//! Connecting → AwaitingDirectory → Ready → Closed
//! ```
//!
//! On connect it emits a signed `hello` (counter 1) followed by a
//! `client_list_request`; receipt of the `client_list` moves it to the
//! steady state. Commands arrive through a [`ClientHandle`]; received
//! messages land in an in-memory inbox and are announced on a broadcast
//! event stream.

use crate::config::ClientConfig;
use crate::crypto::{self, IdentityKeypair, IdentityPublicKey};
use crate::error::{Error, Result};
use crate::logging::ShortFingerprint;
use crate::protocol::{ChatBody, ClientList, Payload, SignedEnvelope, WireMessage};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// A user known from the directory.
#[derive(Debug, Clone)]
pub struct KnownUser {
    /// The user's fingerprint.
    pub fingerprint: String,
    /// Base64 DER public key as advertised.
    pub key_b64: String,
    /// Parsed public key.
    pub public_key: IdentityPublicKey,
    /// `host:port` of the user's home server.
    pub home_server: String,
}

/// A message accepted into the inbox.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Sender fingerprint.
    pub sender: String,
    /// Recipient fingerprints, or `["Public"]` for a broadcast.
    pub recipients: Vec<String>,
    /// Message text.
    pub text: String,
    /// Unix timestamp of local receipt.
    pub received_at: i64,
}

impl StoredMessage {
    /// Whether this was a public broadcast.
    pub fn is_public(&self) -> bool {
        self.recipients.len() == 1 && self.recipients[0] == "Public"
    }
}

/// Events announced on the session's broadcast stream.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The directory arrived; the session reached the steady state.
    Ready,
    /// The directory was refreshed.
    DirectoryUpdated {
        /// Number of users now known.
        users: usize,
    },
    /// A message was accepted into the inbox.
    MessageReceived {
        /// Sender fingerprint.
        sender: String,
        /// Whether it was a public broadcast.
        public: bool,
    },
    /// The session closed.
    Closed,
}

#[derive(Debug)]
enum Command {
    SendPublicChat { text: String },
    SendChat { text: String, recipients: Vec<String> },
    RequestDirectory,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    AwaitingDirectory,
    Ready,
    Closed,
}

struct ClientShared {
    fingerprint: String,
    directory: RwLock<HashMap<String, KnownUser>>,
    inbox: RwLock<Vec<StoredMessage>>,
}

/// Command interface to a running [`ClientSession`].
#[derive(Clone)]
pub struct ClientHandle {
    command_tx: mpsc::Sender<Command>,
    shared: Arc<ClientShared>,
}

impl ClientHandle {
    /// This client's fingerprint.
    pub fn fingerprint(&self) -> String {
        self.shared.fingerprint.clone()
    }

    /// Users currently known from the directory, excluding ourselves.
    pub async fn users(&self) -> Vec<KnownUser> {
        let directory = self.shared.directory.read().await;
        let mut users: Vec<KnownUser> = directory
            .values()
            .filter(|u| u.fingerprint != self.shared.fingerprint)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        users
    }

    /// Snapshot of the inbox, oldest first.
    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.shared.inbox.read().await.clone()
    }

    /// Send a public broadcast.
    pub async fn send_public_chat(&self, text: String) -> Result<()> {
        self.send(Command::SendPublicChat { text }).await
    }

    /// Send a private chat to the given recipient fingerprints.
    pub async fn send_chat(&self, text: String, recipients: Vec<String>) -> Result<()> {
        if recipients.is_empty() {
            return Err(Error::Protocol("chat needs at least one recipient".into()));
        }
        self.send(Command::SendChat { text, recipients }).await
    }

    /// Ask the server for a fresh directory.
    pub async fn request_directory(&self) -> Result<()> {
        self.send(Command::RequestDirectory).await
    }

    /// Close the session.
    pub async fn close(&self) -> Result<()> {
        self.send(Command::Close).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::Transport("client session ended".into()))
    }
}

/// A connected client session.
pub struct ClientSession;

impl ClientSession {
    /// Connect with a freshly generated identity.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(ClientHandle, broadcast::Receiver<ClientEvent>)> {
        let identity = IdentityKeypair::generate()?;
        Self::connect_with_identity(config, identity).await
    }

    /// Connect with an existing identity key pair.
    pub async fn connect_with_identity(
        config: ClientConfig,
        identity: IdentityKeypair,
    ) -> Result<(ClientHandle, broadcast::Receiver<ClientEvent>)> {
        config.validate()?;
        let (stream, _response) = connect_async(format!("ws://{}/", config.server_addr)).await?;

        let fingerprint = identity.fingerprint();
        info!(
            server = %config.server_addr,
            identity = %ShortFingerprint(&fingerprint),
            "connected to home server"
        );

        let shared = Arc::new(ClientShared {
            fingerprint,
            directory: RwLock::new(HashMap::new()),
            inbox: RwLock::new(Vec::new()),
        });
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(64);

        let task = ClientTask {
            identity,
            shared: Arc::clone(&shared),
            event_tx,
            state: SessionState::Connecting,
            counter: 0,
            sender_counters: HashMap::new(),
        };
        tokio::spawn(task.run(stream, command_rx));

        Ok((ClientHandle { command_tx, shared }, event_rx))
    }
}

struct ClientTask {
    identity: IdentityKeypair,
    shared: Arc<ClientShared>,
    event_tx: broadcast::Sender<ClientEvent>,
    state: SessionState,
    counter: u64,
    /// Highest counter accepted per remote sender.
    sender_counters: HashMap<String, u64>,
}

impl ClientTask {
    async fn run(mut self, stream: WsStream, mut command_rx: mpsc::Receiver<Command>) {
        let (mut ws_tx, mut ws_rx) = stream.split();

        if let Err(e) = self.start_handshake(&mut ws_tx).await {
            warn!(error = %e, "handshake failed");
            self.shutdown(&mut ws_tx).await;
            return;
        }

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => {
                        if let Err(e) = self.handle_command(command, &mut ws_tx).await {
                            warn!(error = %e, "send failed, closing session");
                            break;
                        }
                    }
                },
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_inbound(&text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        debug!("ignoring non-text frame");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "transport error");
                        break;
                    }
                },
            }
        }

        self.shutdown(&mut ws_tx).await;
    }

    async fn shutdown(&mut self, ws_tx: &mut WsSink) {
        self.state = SessionState::Closed;
        let _ = ws_tx.close().await;
        let _ = self.event_tx.send(ClientEvent::Closed);
    }

    /// Counter is incremented before signing every outbound envelope; the
    /// hello therefore carries counter 1.
    fn next_counter(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    async fn start_handshake(&mut self, ws_tx: &mut WsSink) -> Result<()> {
        let hello = SignedEnvelope::seal(
            Payload::Hello {
                public_key: self.identity.public_key().to_base64_der(),
            },
            self.next_counter(),
            &self.identity,
        )?;
        ws_tx
            .send(Message::Text(WireMessage::SignedData(hello).encode()?))
            .await?;

        self.state = SessionState::AwaitingDirectory;
        ws_tx
            .send(Message::Text(WireMessage::ClientListRequest.encode()?))
            .await?;
        Ok(())
    }

    async fn handle_command(&mut self, command: Command, ws_tx: &mut WsSink) -> Result<()> {
        match command {
            Command::SendPublicChat { text } => {
                let envelope = SignedEnvelope::seal(
                    Payload::PublicChat {
                        sender: self.shared.fingerprint.clone(),
                        message: text,
                    },
                    self.next_counter(),
                    &self.identity,
                )?;
                ws_tx
                    .send(Message::Text(WireMessage::SignedData(envelope).encode()?))
                    .await?;
            }
            Command::SendChat { text, recipients } => {
                match self.build_chat(text, &recipients).await {
                    Ok(envelope) => {
                        ws_tx
                            .send(Message::Text(WireMessage::SignedData(envelope).encode()?))
                            .await?;
                    }
                    Err(e) => {
                        // A bad recipient list is a user mistake, not a
                        // session failure.
                        warn!(error = %e, "chat not sent");
                    }
                }
            }
            Command::RequestDirectory => {
                ws_tx
                    .send(Message::Text(WireMessage::ClientListRequest.encode()?))
                    .await?;
            }
            Command::Close => {}
        }
        Ok(())
    }

    /// Assemble and sign a private chat for the given recipients.
    async fn build_chat(&mut self, text: String, recipients: &[String]) -> Result<SignedEnvelope> {
        let directory = self.shared.directory.read().await;
        let mut participants = vec![self.shared.fingerprint.clone()];
        let mut recipient_keys: Vec<IdentityPublicKey> = Vec::new();
        let mut destination_servers: Vec<String> = Vec::new();

        for fingerprint in recipients {
            let Some(user) = directory.get(fingerprint) else {
                return Err(Error::NotFound(format!(
                    "recipient {}",
                    ShortFingerprint(fingerprint)
                )));
            };
            participants.push(user.fingerprint.clone());
            recipient_keys.push(user.public_key.clone());
            if !destination_servers.contains(&user.home_server) {
                destination_servers.push(user.home_server.clone());
            }
        }
        drop(directory);

        let body = ChatBody {
            participants,
            message: text,
        };
        let plaintext = body.to_json()?;

        // The sender wraps the key for itself too, so its own copy of the
        // conversation stays decryptable.
        let mut keys: Vec<&IdentityPublicKey> = vec![self.identity.public_key()];
        keys.extend(recipient_keys.iter());
        let sealed = crypto::hybrid_encrypt(&keys, plaintext.as_bytes())?;

        let payload = Payload::Chat {
            destination_servers,
            iv: BASE64.encode(sealed.iv),
            symm_keys: sealed.wrapped_keys.iter().map(|k| BASE64.encode(k)).collect(),
            chat: BASE64.encode(&sealed.ciphertext),
        };
        SignedEnvelope::seal(payload, self.next_counter(), &self.identity)
    }

    async fn handle_inbound(&mut self, text: &str) {
        let message = match WireMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "dropping malformed frame");
                return;
            }
        };

        match message {
            WireMessage::ClientList(list) => {
                let users = self.merge_directory(list).await;
                if self.state == SessionState::AwaitingDirectory {
                    self.state = SessionState::Ready;
                    let _ = self.event_tx.send(ClientEvent::Ready);
                }
                let _ = self.event_tx.send(ClientEvent::DirectoryUpdated { users });
            }
            WireMessage::SignedData(envelope) if self.state == SessionState::Ready => {
                match envelope.payload() {
                    Payload::PublicChat { .. } => self.accept_public_chat(&envelope).await,
                    Payload::Chat { .. } => self.accept_chat(&envelope).await,
                    other => {
                        debug!(kind = other.type_name(), "unexpected payload, dropping");
                    }
                }
            }
            other => {
                debug!(kind = other.type_name(), "unexpected message, dropping");
            }
        }
    }

    /// Rebuild the known-user map from a directory snapshot. The server
    /// sends full aggregates, so a rebuild also handles departures.
    async fn merge_directory(&mut self, list: ClientList) -> usize {
        let mut users = HashMap::new();
        for server in &list.servers {
            for key_b64 in &server.clients {
                match IdentityPublicKey::from_base64_der(key_b64) {
                    Ok(public_key) => {
                        let fingerprint = public_key.fingerprint();
                        users.insert(
                            fingerprint.clone(),
                            KnownUser {
                                fingerprint,
                                key_b64: key_b64.clone(),
                                public_key,
                                home_server: server.address.clone(),
                            },
                        );
                    }
                    Err(e) => {
                        debug!(error = %e, "skipping unparseable directory key");
                    }
                }
            }
        }
        let count = users.len();
        *self.shared.directory.write().await = users;
        debug!(users = count, "directory updated");
        count
    }

    /// Enforce per-sender counter monotonicity for received envelopes.
    fn accept_sender_counter(&mut self, sender: &str, counter: u64) -> bool {
        let last = self.sender_counters.get(sender).copied().unwrap_or(0);
        if counter <= last {
            debug!(
                sender = %ShortFingerprint(sender),
                counter,
                "stale counter, dropping"
            );
            return false;
        }
        self.sender_counters.insert(sender.to_string(), counter);
        true
    }

    async fn accept_public_chat(&mut self, envelope: &SignedEnvelope) {
        let Payload::PublicChat { sender, message } = envelope.payload() else {
            return;
        };
        let sender = sender.clone();
        let message = message.clone();

        let Some(sender_key) = self.lookup_key(&sender).await else {
            debug!(
                sender = %ShortFingerprint(&sender),
                "public chat from unknown sender, dropping"
            );
            return;
        };
        if envelope.verify(&sender_key).is_err() {
            debug!(
                sender = %ShortFingerprint(&sender),
                "bad signature on public chat, dropping"
            );
            return;
        }
        if !self.accept_sender_counter(&sender, envelope.counter()) {
            return;
        }

        self.store(StoredMessage {
            sender: sender.clone(),
            recipients: vec!["Public".to_string()],
            text: message,
            received_at: chrono::Utc::now().timestamp(),
        })
        .await;
        let _ = self.event_tx.send(ClientEvent::MessageReceived {
            sender,
            public: true,
        });
    }

    /// Handle a private chat: trial-decrypt, then authenticate.
    ///
    /// Most arriving chats are not addressed to us; every failure path here
    /// is a silent drop (with a debug log) by design.
    async fn accept_chat(&mut self, envelope: &SignedEnvelope) {
        let Payload::Chat {
            iv,
            symm_keys,
            chat,
            ..
        } = envelope.payload()
        else {
            return;
        };

        // validate() checked these decode; decode them for real now.
        let Ok(iv) = BASE64.decode(iv) else { return };
        let Ok(ciphertext) = BASE64.decode(chat) else {
            return;
        };
        let wrapped: Vec<Vec<u8>> = symm_keys
            .iter()
            .filter_map(|k| BASE64.decode(k).ok())
            .collect();

        let plaintext = match crypto::hybrid_decrypt(&self.identity, &iv, &ciphertext, &wrapped) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                debug!("chat not addressed to us, dropping");
                return;
            }
        };
        let body = match ChatBody::from_json(&plaintext) {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "decrypted chat body is malformed, dropping");
                return;
            }
        };
        if !body
            .participants
            .iter()
            .any(|p| *p == self.shared.fingerprint)
        {
            debug!("decrypted chat does not list us, dropping");
            return;
        }

        let sender = body.sender().to_string();
        if sender == self.shared.fingerprint {
            // Our own message delivered back through the mesh.
            debug!("own chat echo, dropping");
            return;
        }
        let Some(sender_key) = self.lookup_key(&sender).await else {
            debug!(
                sender = %ShortFingerprint(&sender),
                "chat sender not in directory, dropping"
            );
            return;
        };
        if envelope.verify(&sender_key).is_err() {
            debug!(
                sender = %ShortFingerprint(&sender),
                "bad signature on chat, dropping"
            );
            return;
        }
        if !self.accept_sender_counter(&sender, envelope.counter()) {
            return;
        }

        self.store(StoredMessage {
            sender: sender.clone(),
            recipients: body.participants[1..].to_vec(),
            text: body.message,
            received_at: chrono::Utc::now().timestamp(),
        })
        .await;
        let _ = self.event_tx.send(ClientEvent::MessageReceived {
            sender,
            public: false,
        });
    }

    async fn lookup_key(&self, fingerprint: &str) -> Option<IdentityPublicKey> {
        self.shared
            .directory
            .read()
            .await
            .get(fingerprint)
            .map(|u| u.public_key.clone())
    }

    async fn store(&self, message: StoredMessage) {
        self.shared.inbox.write().await.push(message);
    }
}
