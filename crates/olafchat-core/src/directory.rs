//! The server-side directory: who is attached where.
//!
//! A server tracks its locally-connected clients (public key plus the last
//! accepted counter) and, per neighbour server, the most recent client list
//! that neighbour advertised. The union of the two is what a `client_list`
//! response discloses.
//!
//! The directory is plain data; the server node wraps it in a lock so that
//! every routing decision sees a consistent snapshot and counter updates
//! are atomic with the envelope they validate.

use crate::crypto::IdentityPublicKey;
use crate::error::{Error, Result};
use crate::logging::ShortFingerprint;
use crate::protocol::{ClientList, ServerClients};
use std::collections::HashMap;
use tracing::debug;

/// A locally-connected client.
#[derive(Debug)]
pub struct LocalClient {
    /// The client's public key, as presented in its `hello`.
    pub public_key: IdentityPublicKey,
    /// Highest counter accepted from this client.
    pub last_counter: u64,
    /// Session the client is attached on.
    pub session: u64,
}

/// One client advertised by a neighbour server, with the parsed key cached
/// so routing-time fingerprint lookups need no re-parsing.
#[derive(Debug)]
pub struct AdvertisedClient {
    /// Base64 DER key exactly as advertised.
    pub key_b64: String,
    /// Fingerprint derived from the key.
    pub fingerprint: String,
    /// Parsed key.
    pub public_key: IdentityPublicKey,
}

/// Where a fingerprint was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// A locally-connected client.
    Local,
    /// A client advertised by a neighbour server.
    Advertised,
}

/// The directory of known clients, scoped by home server.
#[derive(Debug)]
pub struct Directory {
    address: String,
    local_clients: HashMap<String, LocalClient>,
    peer_servers: HashMap<String, Vec<AdvertisedClient>>,
}

impl Directory {
    /// Create an empty directory for a server identifying as `address`.
    pub fn new(address: String) -> Self {
        Self {
            address,
            local_clients: HashMap::new(),
            peer_servers: HashMap::new(),
        }
    }

    /// This server's `host:port` identity.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register a locally-connected client.
    ///
    /// A reconnect with the same key replaces the previous entry; the stale
    /// session's disconnect later becomes a no-op because the session id no
    /// longer matches.
    pub fn insert_local(
        &mut self,
        public_key: IdentityPublicKey,
        hello_counter: u64,
        session: u64,
    ) -> String {
        let fingerprint = public_key.fingerprint();
        self.local_clients.insert(
            fingerprint.clone(),
            LocalClient {
                public_key,
                last_counter: hello_counter,
                session,
            },
        );
        fingerprint
    }

    /// Remove the local client attached on `session`, if any.
    pub fn remove_local_by_session(&mut self, session: u64) -> Option<String> {
        let fingerprint = self
            .local_clients
            .iter()
            .find(|(_, client)| client.session == session)
            .map(|(fp, _)| fp.clone())?;
        self.local_clients.remove(&fingerprint);
        Some(fingerprint)
    }

    /// Look up a locally-connected client.
    pub fn local_client(&self, fingerprint: &str) -> Option<&LocalClient> {
        self.local_clients.get(fingerprint)
    }

    /// Number of locally-connected clients.
    pub fn local_count(&self) -> usize {
        self.local_clients.len()
    }

    /// Enforce the counter invariant for a local client and record the new
    /// value.
    ///
    /// The update happens here, before any forwarding, so a replay racing
    /// through a parallel session cannot also pass.
    pub fn accept_counter(&mut self, fingerprint: &str, counter: u64) -> Result<()> {
        let client = self
            .local_clients
            .get_mut(fingerprint)
            .ok_or_else(|| Error::NotFound(format!("client {}", ShortFingerprint(fingerprint))))?;
        if counter <= client.last_counter {
            return Err(Error::StaleCounter);
        }
        client.last_counter = counter;
        Ok(())
    }

    /// Ensure a neighbour server has a (possibly empty) advertised set.
    pub fn ensure_peer(&mut self, addr: &str) {
        self.peer_servers.entry(addr.to_string()).or_default();
    }

    /// Replace the advertised client set for a neighbour server.
    ///
    /// Unparseable keys are skipped with a log; one bad entry does not
    /// discard the rest of the advertisement. Returns the number imported.
    pub fn set_advertised(&mut self, addr: &str, clients: &[String]) -> usize {
        let mut parsed = Vec::with_capacity(clients.len());
        for key_b64 in clients {
            match IdentityPublicKey::from_base64_der(key_b64) {
                Ok(public_key) => parsed.push(AdvertisedClient {
                    key_b64: key_b64.clone(),
                    fingerprint: public_key.fingerprint(),
                    public_key,
                }),
                Err(e) => {
                    debug!(peer = addr, error = %e, "skipping unparseable advertised key");
                }
            }
        }
        let imported = parsed.len();
        self.peer_servers.insert(addr.to_string(), parsed);
        imported
    }

    /// Drop a neighbour server and its advertised clients.
    pub fn remove_peer(&mut self, addr: &str) {
        self.peer_servers.remove(addr);
    }

    /// Resolve a fingerprint to a public key, local clients first.
    pub fn resolve_key(&self, fingerprint: &str) -> Option<(&IdentityPublicKey, KeySource)> {
        if let Some(client) = self.local_clients.get(fingerprint) {
            return Some((&client.public_key, KeySource::Local));
        }
        for advertised in self.peer_servers.values() {
            if let Some(client) = advertised.iter().find(|c| c.fingerprint == fingerprint) {
                return Some((&client.public_key, KeySource::Advertised));
            }
        }
        None
    }

    /// The aggregated directory: own clients plus every neighbour's most
    /// recent advertisement. This is the `client_list` a client receives.
    pub fn full_client_list(&self) -> ClientList {
        let mut servers = vec![self.local_entry()];
        let mut peers: Vec<_> = self.peer_servers.iter().collect();
        peers.sort_by(|a, b| a.0.cmp(b.0));
        for (addr, advertised) in peers {
            servers.push(ServerClients {
                address: addr.clone(),
                clients: advertised.iter().map(|c| c.key_b64.clone()).collect(),
            });
        }
        ClientList { servers }
    }

    /// Only this server's local clients. This is what gets advertised to
    /// neighbour servers; re-advertising aggregates would create ghosts.
    pub fn local_client_list(&self) -> ClientList {
        ClientList {
            servers: vec![self.local_entry()],
        }
    }

    fn local_entry(&self) -> ServerClients {
        let mut clients: Vec<String> = self
            .local_clients
            .values()
            .map(|c| c.public_key.to_base64_der())
            .collect();
        clients.sort();
        ServerClients {
            address: self.address.clone(),
            clients,
        }
    }
}
