//! DHT Protocol Messages
//!
//! Queries and custom messages travel as ADNL payloads starting with
//! [`DHT_PREFIX`] followed by a bincode body. Answers carry no prefix.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tonmesh_crypto::{PublicKey, ShortId, Signature};

use crate::error::{DhtError, DhtResult};
use crate::value::{DhtNode, DhtValue};

/// Marker in front of every DHT query and message
pub const DHT_PREFIX: [u8; 4] = [0x7a, 0x44, 0x48, 0x54];

/// A query together with the sender's contact record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtQuery {
    /// Signed record of the querying node; absent for clients that do
    /// not want to be added to routing tables
    pub sender: Option<DhtNode>,
    pub request: DhtRequest,
}

/// DHT request types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtRequest {
    /// Liveness check; echoed back in the pong
    Ping { random_id: u64 },

    /// Store a value
    Store { value: DhtValue },

    /// The `k` nodes closest to `key`
    FindNode { key: ShortId, k: u32 },

    /// The value under `key`, or the `k` nodes closest to it
    FindValue { key: ShortId, k: u32 },

    /// The responder's own signed record
    GetSignedAddressList,

    /// A client behind NAT asks to be reachable through the responder
    RegisterReverseConnection {
        node: PublicKey,
        /// Unix time the registration ends
        ttl: u32,
        signature: Signature,
    },

    /// Ask the responder to make `client` ping `target`
    RequestReversePing {
        target: DhtNode,
        /// Signature of `target` by its own key
        signature: Signature,
        client: ShortId,
        k: u32,
    },
}

/// DHT response types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtResponse {
    Pong { random_id: u64 },
    Stored,
    Nodes { nodes: Vec<DhtNode> },
    ValueFound { value: DhtValue },
    ValueNotFound { nodes: Vec<DhtNode> },
    SignedAddressList { node: DhtNode },
    ReversePingOk,
    /// Client unknown here; closer nodes may know it
    ClientNotFound { nodes: Vec<DhtNode> },
    /// Request understood but refused
    Rejected { reason: String },
}

/// One-way DHT messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtMessage {
    /// Forwarded to a registered client: ping `target`
    ReversePingCont {
        target: DhtNode,
        signature: Signature,
        client: ShortId,
    },
}

/// Signed by a client registering for reverse connections
#[derive(Serialize)]
pub(crate) struct RegisterReverseToSign {
    pub node: ShortId,
    /// The DHT node the registration is for
    pub dht_id: ShortId,
    pub ttl: u32,
}

/// Signed by the node asking for a reverse ping
#[derive(Serialize)]
pub(crate) struct ReversePingToSign<'a> {
    pub target: &'a DhtNode,
    pub client: ShortId,
}

fn encode_prefixed<T: Serialize>(body: &T) -> DhtResult<Bytes> {
    let body = bincode::serialize(body)?;
    let mut buf = BytesMut::with_capacity(DHT_PREFIX.len() + body.len());
    buf.put_slice(&DHT_PREFIX);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

fn decode_prefixed<T: for<'de> Deserialize<'de>>(data: &[u8]) -> DhtResult<T> {
    let body = data
        .strip_prefix(&DHT_PREFIX[..])
        .ok_or_else(|| DhtError::InvalidMessage("missing DHT prefix".into()))?;
    Ok(bincode::deserialize(body)?)
}

pub fn encode_query(query: &DhtQuery) -> DhtResult<Bytes> {
    encode_prefixed(query)
}

pub fn decode_query(data: &[u8]) -> DhtResult<DhtQuery> {
    decode_prefixed(data)
}

pub fn encode_message(message: &DhtMessage) -> DhtResult<Bytes> {
    encode_prefixed(message)
}

pub fn decode_message(data: &[u8]) -> DhtResult<DhtMessage> {
    decode_prefixed(data)
}

pub fn encode_response(response: &DhtResponse) -> DhtResult<Bytes> {
    Ok(Bytes::from(bincode::serialize(response)?))
}

pub fn decode_response(data: &[u8]) -> DhtResult<DhtResponse> {
    Ok(bincode::deserialize(data)?)
}
