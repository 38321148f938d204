//! Messages carried inside packets

use bytes::{BufMut, Bytes, BytesMut};
use tonmesh_crypto::PublicKey;

use crate::codec::{self, Decode, Encode};
use crate::error::{AdnlError, AdnlResult};

pub const TAG_CREATE_CHANNEL: u32 = 0xe673_c3bb;
pub const TAG_CONFIRM_CHANNEL: u32 = 0x60dd_1d69;
pub const TAG_CUSTOM: u32 = 0x2048_18f5;
pub const TAG_NOP: u32 = 0x17f8_dfda;
pub const TAG_REINIT: u32 = 0x10c2_0520;
pub const TAG_QUERY: u32 = 0xb48b_f97a;
pub const TAG_ANSWER: u32 = 0x0fac_8416;
pub const TAG_PART: u32 = 0xfd45_2d39;

/// Random id correlating a query with its answer
pub type QueryId = [u8; 32];

/// A unit of application or control data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Proposes a channel; `key` is the sender's ephemeral channel key
    CreateChannel { key: PublicKey, date: u32 },
    /// Accepts a channel proposed with `peer_key`
    ConfirmChannel {
        key: PublicKey,
        peer_key: PublicKey,
        date: u32,
    },
    Custom { data: Bytes },
    Query { query_id: QueryId, data: Bytes },
    Answer { query_id: QueryId, data: Bytes },
    /// Fragment of a larger encoded message whose SHA-256 is `hash`
    Part {
        hash: [u8; 32],
        total_size: u32,
        offset: u32,
        data: Bytes,
    },
    /// Peer restarted at `date`; reset the session
    Reinit { date: u32 },
    Nop,
}

impl Message {
    /// Size budget this message takes in a packet
    pub fn serialized_size(&self) -> usize {
        match self {
            Message::CreateChannel { .. } => 40,
            Message::ConfirmChannel { .. } => 72,
            Message::Custom { data } => data.len() + 12,
            Message::Query { data, .. } | Message::Answer { data, .. } => data.len() + 44,
            Message::Part { data, .. } => data.len() + 48,
            Message::Reinit { .. } => 8,
            Message::Nop => 4,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::CreateChannel { .. } => "createChannel",
            Message::ConfirmChannel { .. } => "confirmChannel",
            Message::Custom { .. } => "custom",
            Message::Query { .. } => "query",
            Message::Answer { .. } => "answer",
            Message::Part { .. } => "part",
            Message::Reinit { .. } => "reinit",
            Message::Nop => "nop",
        }
    }
}

impl Encode for Message {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Message::CreateChannel { key, date } => {
                buf.put_u32_le(TAG_CREATE_CHANNEL);
                buf.put_slice(key.as_bytes());
                buf.put_u32_le(*date);
            }
            Message::ConfirmChannel {
                key,
                peer_key,
                date,
            } => {
                buf.put_u32_le(TAG_CONFIRM_CHANNEL);
                buf.put_slice(key.as_bytes());
                buf.put_slice(peer_key.as_bytes());
                buf.put_u32_le(*date);
            }
            Message::Custom { data } => {
                buf.put_u32_le(TAG_CUSTOM);
                codec::put_bytes(buf, data);
            }
            Message::Query { query_id, data } => {
                buf.put_u32_le(TAG_QUERY);
                buf.put_slice(query_id);
                codec::put_bytes(buf, data);
            }
            Message::Answer { query_id, data } => {
                buf.put_u32_le(TAG_ANSWER);
                buf.put_slice(query_id);
                codec::put_bytes(buf, data);
            }
            Message::Part {
                hash,
                total_size,
                offset,
                data,
            } => {
                buf.put_u32_le(TAG_PART);
                buf.put_slice(hash);
                buf.put_u32_le(*total_size);
                buf.put_u32_le(*offset);
                codec::put_bytes(buf, data);
            }
            Message::Reinit { date } => {
                buf.put_u32_le(TAG_REINIT);
                buf.put_u32_le(*date);
            }
            Message::Nop => buf.put_u32_le(TAG_NOP),
        }
    }
}

fn get_key(buf: &mut Bytes) -> AdnlResult<PublicKey> {
    Ok(PublicKey::from_bytes(codec::get_int256(buf)?)?)
}

impl Decode for Message {
    fn decode(buf: &mut Bytes) -> AdnlResult<Self> {
        let message = match codec::get_u32(buf)? {
            TAG_CREATE_CHANNEL => Message::CreateChannel {
                key: get_key(buf)?,
                date: codec::get_u32(buf)?,
            },
            TAG_CONFIRM_CHANNEL => Message::ConfirmChannel {
                key: get_key(buf)?,
                peer_key: get_key(buf)?,
                date: codec::get_u32(buf)?,
            },
            TAG_CUSTOM => Message::Custom {
                data: codec::get_bytes(buf)?,
            },
            TAG_QUERY => Message::Query {
                query_id: codec::get_int256(buf)?,
                data: codec::get_bytes(buf)?,
            },
            TAG_ANSWER => Message::Answer {
                query_id: codec::get_int256(buf)?,
                data: codec::get_bytes(buf)?,
            },
            TAG_PART => Message::Part {
                hash: codec::get_int256(buf)?,
                total_size: codec::get_u32(buf)?,
                offset: codec::get_u32(buf)?,
                data: codec::get_bytes(buf)?,
            },
            TAG_REINIT => Message::Reinit {
                date: codec::get_u32(buf)?,
            },
            TAG_NOP => Message::Nop,
            tag => {
                return Err(AdnlError::Decode(format!(
                    "unknown message tag 0x{:08x}",
                    tag
                )))
            }
        };
        Ok(message)
    }
}
