//! Server state machine: session classification, validation, and routing.

use crate::config::ServerConfig;
use crate::crypto::IdentityKeypair;
use crate::crypto::IdentityPublicKey;
use crate::directory::{Directory, KeySource};
use crate::error::Result;
use crate::logging::ShortFingerprint;
use crate::protocol::{ClientList, Payload, SignedEnvelope, WireMessage};
use crate::SESSION_QUEUE_DEPTH;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Identifies one attached session (client or server, inbound or dialled).
pub type SessionId = u64;

/// The role a session has been classified into.
///
/// Every inbound session starts `Unverified`; its first signed envelope
/// decides whether it is a client (`hello`) or a neighbour server
/// (`server_hello`). Dialled sessions are servers by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRole {
    /// No valid hello seen yet.
    Unverified,
    /// A client identified by its key fingerprint.
    Client {
        /// Fingerprint of the key presented in the client's `hello`.
        fingerprint: String,
    },
    /// A neighbour server identified by its `host:port`.
    Server {
        /// The neighbour's wire identity.
        address: String,
    },
}

struct Session {
    outbound: mpsc::Sender<String>,
    role: PeerRole,
}

struct NodeState {
    directory: Directory,
    sessions: HashMap<SessionId, Session>,
    /// Last accepted counter per remote client (known only through
    /// neighbour advertisements). Local clients are tracked in the
    /// directory itself.
    remote_counters: HashMap<String, u64>,
}

/// Frames to deliver and whether to close the origin session, computed
/// under the state lock and executed after it is released.
#[derive(Default)]
struct Outcome {
    deliveries: Vec<(mpsc::Sender<String>, String)>,
    close_origin: bool,
}

impl Outcome {
    fn push(&mut self, outbound: &mpsc::Sender<String>, frame: String) {
        self.deliveries.push((outbound.clone(), frame));
    }
}

/// A home server's protocol engine.
///
/// Socket tasks interact with the node through three calls:
/// [`register_session`](Self::register_session) (or
/// [`register_server_peer`](Self::register_server_peer) for dialled
/// neighbours), [`handle_frame`](Self::handle_frame), and
/// [`handle_disconnect`](Self::handle_disconnect).
pub struct ServerNode {
    config: ServerConfig,
    identity: IdentityKeypair,
    counter: AtomicU64,
    next_session: AtomicU64,
    state: RwLock<NodeState>,
}

impl ServerNode {
    /// Create a node for the given configuration and identity key.
    pub fn new(config: ServerConfig, identity: IdentityKeypair) -> Result<Arc<Self>> {
        config.validate()?;
        let directory = Directory::new(config.address());
        Ok(Arc::new(Self {
            config,
            identity,
            counter: AtomicU64::new(0),
            next_session: AtomicU64::new(1),
            state: RwLock::new(NodeState {
                directory,
                sessions: HashMap::new(),
                remote_counters: HashMap::new(),
            }),
        }))
    }

    /// This server's static configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// This server's `host:port` wire identity.
    pub fn address(&self) -> String {
        self.config.address()
    }

    fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register an inbound session. Returns its id and the receiver end of
    /// its outbound frame queue; the socket task drains the receiver into
    /// the wire.
    pub async fn register_session(&self) -> (SessionId, mpsc::Receiver<String>) {
        self.register(PeerRole::Unverified).await
    }

    /// Register a dialled neighbour session. The address is trusted because
    /// we dialled it out of our own configuration.
    pub async fn register_server_peer(&self, addr: &str) -> (SessionId, mpsc::Receiver<String>) {
        let (id, rx) = self
            .register(PeerRole::Server {
                address: addr.to_string(),
            })
            .await;
        self.state.write().await.directory.ensure_peer(addr);
        (id, rx)
    }

    async fn register(&self, role: PeerRole) -> (SessionId, mpsc::Receiver<String>) {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let mut state = self.state.write().await;
        state.sessions.insert(id, Session { outbound: tx, role });
        (id, rx)
    }

    /// The frames a dialler sends right after connecting: a signed
    /// `server_hello` followed by a `client_list_request`.
    pub fn greeting_frames(&self) -> Result<Vec<String>> {
        let hello = SignedEnvelope::seal(
            Payload::ServerHello {
                sender: self.address(),
            },
            self.next_counter(),
            &self.identity,
        )?;
        Ok(vec![
            WireMessage::SignedData(hello).encode()?,
            WireMessage::ClientListRequest.encode()?,
        ])
    }

    /// The aggregated directory, as a client would receive it.
    pub async fn client_list(&self) -> ClientList {
        self.state.read().await.directory.full_client_list()
    }

    /// Number of locally-connected clients.
    pub async fn local_client_count(&self) -> usize {
        self.state.read().await.directory.local_count()
    }

    /// Process one received frame from `session`.
    ///
    /// Malformed frames are dropped with a log and the session stays open;
    /// protocol violations on an unverified session close it.
    pub async fn handle_frame(&self, session: SessionId, text: &str) {
        let message = match WireMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(session, error = %e, "dropping malformed frame");
                return;
            }
        };

        let outcome = {
            let mut state = self.state.write().await;
            let Some(role) = state.sessions.get(&session).map(|s| s.role.clone()) else {
                debug!(session, "frame from unknown session");
                return;
            };
            match role {
                PeerRole::Unverified => self.process_unverified(&mut state, session, message),
                PeerRole::Client { fingerprint } => {
                    self.process_client(&mut state, session, &fingerprint, message)
                }
                PeerRole::Server { address } => {
                    self.process_server(&mut state, session, &address, message)
                }
            }
        };

        self.finish(session, outcome).await;
    }

    /// Tear down a session after its socket closed.
    pub async fn handle_disconnect(&self, session: SessionId) {
        let outcome = {
            let mut state = self.state.write().await;
            self.remove_session(&mut state, session)
        };
        for (tx, frame) in outcome.deliveries {
            let _ = tx.send(frame).await;
        }
    }

    async fn finish(&self, session: SessionId, outcome: Outcome) {
        for (tx, frame) in outcome.deliveries {
            if tx.send(frame).await.is_err() {
                debug!("peer outbound queue closed mid-delivery");
            }
        }
        if outcome.close_origin {
            // Dropping the queue sender ends the socket task, which then
            // reports the disconnect; removing the session here makes close
            // idempotent either way.
            self.handle_disconnect(session).await;
        }
    }

    fn remove_session(&self, state: &mut NodeState, session: SessionId) -> Outcome {
        let mut outcome = Outcome::default();
        let Some(removed) = state.sessions.remove(&session) else {
            return outcome;
        };
        match removed.role {
            PeerRole::Client { fingerprint } => {
                if state.directory.remove_local_by_session(session).is_some() {
                    info!(
                        client = %ShortFingerprint(&fingerprint),
                        "client disconnected"
                    );
                    self.push_directory_update(state, &mut outcome);
                }
            }
            PeerRole::Server { address } => {
                let still_connected = state
                    .sessions
                    .values()
                    .any(|s| matches!(&s.role, PeerRole::Server { address: a } if *a == address));
                if !still_connected {
                    state.directory.remove_peer(&address);
                }
                info!(peer = %address, "server session closed");
            }
            PeerRole::Unverified => {
                debug!(session, "unverified session closed");
            }
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Unverified sessions: only hello / server_hello are acceptable.
    // ------------------------------------------------------------------

    fn process_unverified(
        &self,
        state: &mut NodeState,
        session: SessionId,
        message: WireMessage,
    ) -> Outcome {
        let mut outcome = Outcome::default();
        let kind = message.type_name();
        let WireMessage::SignedData(envelope) = message else {
            warn!(
                session,
                kind, "non-hello message on unverified session, closing"
            );
            outcome.close_origin = true;
            return outcome;
        };

        match envelope.payload() {
            Payload::Hello { public_key } => {
                let key = match IdentityPublicKey::from_base64_der(public_key) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(session, error = %e, "hello with unusable key, closing");
                        outcome.close_origin = true;
                        return outcome;
                    }
                };
                if envelope.verify(&key).is_err() {
                    warn!(session, "hello signature does not verify, closing");
                    outcome.close_origin = true;
                    return outcome;
                }
                let fingerprint =
                    state
                        .directory
                        .insert_local(key, envelope.counter(), session);
                if let Some(s) = state.sessions.get_mut(&session) {
                    s.role = PeerRole::Client {
                        fingerprint: fingerprint.clone(),
                    };
                }
                info!(
                    session,
                    client = %ShortFingerprint(&fingerprint),
                    "client connected"
                );
                self.push_directory_update(state, &mut outcome);
            }
            Payload::ServerHello { sender } => {
                if !self.config.neighbours.iter().any(|n| n == sender) {
                    warn!(
                        session,
                        sender = %sender,
                        "server hello from server outside the neighbourhood, closing"
                    );
                    outcome.close_origin = true;
                    return outcome;
                }
                if let Some(s) = state.sessions.get_mut(&session) {
                    s.role = PeerRole::Server {
                        address: sender.clone(),
                    };
                }
                state.directory.ensure_peer(sender);
                info!(session, peer = %sender, "neighbour server connected");
                // Make the link symmetric straight away: advertise our
                // clients and ask for theirs.
                let list = state.directory.local_client_list();
                self.reply(state, session, WireMessage::ClientList(list), &mut outcome);
                self.reply(state, session, WireMessage::ClientListRequest, &mut outcome);
            }
            other => {
                warn!(
                    session,
                    kind = other.type_name(),
                    "payload on unverified session is not a hello, closing"
                );
                outcome.close_origin = true;
            }
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Client sessions: client_list_request, public_chat, chat.
    // ------------------------------------------------------------------

    fn process_client(
        &self,
        state: &mut NodeState,
        session: SessionId,
        fingerprint: &str,
        message: WireMessage,
    ) -> Outcome {
        let mut outcome = Outcome::default();
        match message {
            WireMessage::ClientListRequest => {
                let list = state.directory.full_client_list();
                self.reply(state, session, WireMessage::ClientList(list), &mut outcome);
            }
            WireMessage::SignedData(envelope) => {
                if !self.validate_client_envelope(state, fingerprint, &envelope) {
                    return outcome;
                }
                match envelope.payload() {
                    Payload::PublicChat { sender, .. } => {
                        if sender != fingerprint {
                            debug!(
                                session,
                                "public chat sender does not match session identity, dropping"
                            );
                            return outcome;
                        }
                        self.fan_out(state, session, &envelope, &mut outcome);
                    }
                    Payload::Chat { .. } => {
                        self.route_chat(state, session, &envelope, true, &mut outcome);
                    }
                    other => {
                        debug!(
                            session,
                            kind = other.type_name(),
                            "payload not accepted from a client session, dropping"
                        );
                    }
                }
            }
            WireMessage::ClientList(_) => {
                debug!(session, "client sent a client_list, dropping");
            }
        }
        outcome
    }

    /// Signature and counter checks for an envelope from a local client.
    /// Returns false (after logging) when the envelope must be dropped.
    fn validate_client_envelope(
        &self,
        state: &mut NodeState,
        fingerprint: &str,
        envelope: &SignedEnvelope,
    ) -> bool {
        let Some(client) = state.directory.local_client(fingerprint) else {
            debug!(client = %ShortFingerprint(fingerprint), "session identity vanished");
            return false;
        };
        if envelope.verify(&client.public_key).is_err() {
            debug!(
                client = %ShortFingerprint(fingerprint),
                "bad signature on client envelope, dropping"
            );
            return false;
        }
        if state
            .directory
            .accept_counter(fingerprint, envelope.counter())
            .is_err()
        {
            debug!(
                client = %ShortFingerprint(fingerprint),
                counter = envelope.counter(),
                "stale counter, dropping"
            );
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // Server sessions: directory gossip plus forwarded traffic.
    // ------------------------------------------------------------------

    fn process_server(
        &self,
        state: &mut NodeState,
        session: SessionId,
        peer_addr: &str,
        message: WireMessage,
    ) -> Outcome {
        let mut outcome = Outcome::default();
        match message {
            WireMessage::ClientListRequest => {
                let list = state.directory.local_client_list();
                self.reply(state, session, WireMessage::ClientList(list), &mut outcome);
            }
            WireMessage::ClientList(list) => {
                let Some(entry) = list.servers.iter().find(|s| s.address == peer_addr) else {
                    debug!(
                        peer = %peer_addr,
                        "client_list without an entry for the sending server, dropping"
                    );
                    return outcome;
                };
                let imported = state.directory.set_advertised(peer_addr, &entry.clients);
                debug!(peer = %peer_addr, clients = imported, "advertised directory updated");
            }
            WireMessage::SignedData(envelope) => match envelope.payload() {
                Payload::ServerHello { sender } => {
                    // Idempotent re-hello on an established session.
                    if sender == peer_addr {
                        debug!(peer = %peer_addr, "repeated server hello");
                    } else {
                        debug!(
                            peer = %peer_addr,
                            sender = %sender,
                            "server hello with mismatched sender, dropping"
                        );
                    }
                }
                Payload::PublicChat { sender, .. } => {
                    if self.validate_forwarded_public_chat(state, sender, &envelope) {
                        self.fan_out(state, session, &envelope, &mut outcome);
                    }
                }
                Payload::Chat { .. } => {
                    self.route_chat(state, session, &envelope, false, &mut outcome);
                }
                other => {
                    debug!(
                        session,
                        kind = other.type_name(),
                        "payload not accepted from a server session, dropping"
                    );
                }
            },
        }
        outcome
    }

    /// Validate a `public_chat` that arrived through a neighbour server.
    ///
    /// The originating client's signature travels with the envelope; it is
    /// checked against the key the directory knows for the claimed sender.
    /// Senders nobody advertised are dropped; without a key there is no
    /// way to hold the counter invariant for them.
    fn validate_forwarded_public_chat(
        &self,
        state: &mut NodeState,
        sender: &str,
        envelope: &SignedEnvelope,
    ) -> bool {
        let Some((key, source)) = state.directory.resolve_key(sender) else {
            debug!(
                sender = %ShortFingerprint(sender),
                "forwarded public chat from unknown sender, dropping"
            );
            return false;
        };
        if envelope.verify(key).is_err() {
            debug!(
                sender = %ShortFingerprint(sender),
                "bad signature on forwarded public chat, dropping"
            );
            return false;
        }
        match source {
            KeySource::Local => {
                // Our own client's message came back around the mesh; its
                // counter was consumed when we accepted it directly.
                if state
                    .directory
                    .accept_counter(sender, envelope.counter())
                    .is_err()
                {
                    debug!(
                        sender = %ShortFingerprint(sender),
                        "looped-back public chat, dropping"
                    );
                    return false;
                }
                true
            }
            KeySource::Advertised => {
                let last = state.remote_counters.get(sender).copied().unwrap_or(0);
                if envelope.counter() <= last {
                    debug!(
                        sender = %ShortFingerprint(sender),
                        counter = envelope.counter(),
                        "stale counter on forwarded public chat, dropping"
                    );
                    return false;
                }
                state
                    .remote_counters
                    .insert(sender.to_string(), envelope.counter());
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Broadcast an accepted `public_chat` to every session except the one
    /// it arrived on.
    fn fan_out(
        &self,
        state: &NodeState,
        origin: SessionId,
        envelope: &SignedEnvelope,
        outcome: &mut Outcome,
    ) {
        let frame = match WireMessage::SignedData(envelope.clone()).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to re-encode envelope for fan-out");
                return;
            }
        };
        for (&id, sess) in &state.sessions {
            if id == origin || sess.role == PeerRole::Unverified {
                continue;
            }
            outcome.push(&sess.outbound, frame.clone());
        }
    }

    /// Route an accepted `chat` by its destination servers.
    ///
    /// Entries naming this server deliver a copy to every local client
    /// session (recipients self-filter through decryption). When the chat
    /// came from a local client, entries naming a neighbour get exactly one
    /// forwarded copy; when it came from a neighbour, the originating home
    /// server already forwarded to every destination, so only local
    /// delivery happens here.
    fn route_chat(
        &self,
        state: &NodeState,
        origin: SessionId,
        envelope: &SignedEnvelope,
        from_client: bool,
        outcome: &mut Outcome,
    ) {
        let Payload::Chat {
            destination_servers,
            ..
        } = envelope.payload()
        else {
            return;
        };
        let frame = match WireMessage::SignedData(envelope.clone()).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to re-encode envelope for routing");
                return;
            }
        };

        let own_address = self.address();
        let mut seen: HashSet<&str> = HashSet::new();
        for dest in destination_servers {
            if !seen.insert(dest.as_str()) {
                continue;
            }
            if *dest == own_address {
                for sess in state.sessions.values() {
                    if matches!(sess.role, PeerRole::Client { .. }) {
                        outcome.push(&sess.outbound, frame.clone());
                    }
                }
            } else if from_client {
                let peer = state.sessions.iter().find(|(&id, s)| {
                    id != origin
                        && matches!(&s.role, PeerRole::Server { address } if address == dest)
                });
                match peer {
                    Some((_, sess)) => outcome.push(&sess.outbound, frame.clone()),
                    None => {
                        debug!(destination = %dest, "chat for unknown destination server, dropping");
                    }
                }
            } else {
                debug!(
                    destination = %dest,
                    "third-party destination on a forwarded chat, ignoring"
                );
            }
        }
    }

    fn reply(
        &self,
        state: &NodeState,
        session: SessionId,
        message: WireMessage,
        outcome: &mut Outcome,
    ) {
        let Some(sess) = state.sessions.get(&session) else {
            return;
        };
        match message.encode() {
            Ok(frame) => outcome.push(&sess.outbound, frame),
            Err(e) => warn!(error = %e, "failed to encode reply"),
        }
    }

    /// Push the local client list to every neighbour session; called on
    /// every change to the local client set.
    fn push_directory_update(&self, state: &NodeState, outcome: &mut Outcome) {
        let frame = match WireMessage::ClientList(state.directory.local_client_list()).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode directory update");
                return;
            }
        };
        for sess in state.sessions.values() {
            if matches!(sess.role, PeerRole::Server { .. }) {
                outcome.push(&sess.outbound, frame.clone());
            }
        }
    }
}
