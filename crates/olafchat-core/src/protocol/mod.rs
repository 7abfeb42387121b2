//! Wire protocol: envelopes and payloads.
//!
//! Every frame is one UTF-8 JSON record. Three top-level message kinds
//! exist: `signed_data` (the envelope carrying all application payloads),
//! `client_list_request`, and `client_list`; the latter two are unsigned
//! and carry no counter.
//!
//! ## Canonical form
//!
//! Signatures cover the serialised `data` object concatenated with the
//! decimal ASCII of the counter. The originator serialises its payload
//! exactly once (struct field order, no insignificant whitespace); that
//! byte string is what gets signed and transmitted. On the receive and
//! forwarding path the `data` text is carried as an opaque raw value;
//! nothing between origin and final recipient ever re-serialises it, so
//! signatures survive hops and unknown fields byte-for-byte.
//!
//! ## Rejection rules
//!
//! Decoding rejects unknown top-level types, missing required fields,
//! out-of-range numerics, and undecodable base64 in fields that carry
//! binary. A rejected frame is dropped and logged; the session stays open.

mod envelope;
mod payload;

pub use envelope::{ClientList, ServerClients, SignedEnvelope, WireMessage};
pub use payload::{ChatBody, Payload};
