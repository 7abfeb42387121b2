//! The home-server side of the protocol.
//!
//! [`node::ServerNode`] owns the shared state (directory, session registry,
//! replay counters) and implements the per-session state machine
//! (`Unverified → Client | Server → Closed`), envelope validation, and
//! routing. It is transport-agnostic: socket tasks register a session,
//! drain its outbound queue into the wire, and feed received frames into
//! [`node::ServerNode::handle_frame`].
//!
//! [`neighbourhood`] owns the outbound half of the mesh: one task per
//! configured neighbour that dials, greets, relays, and reconnects with
//! bounded exponential backoff.

pub mod neighbourhood;
mod node;

pub use node::{PeerRole, ServerNode, SessionId};
