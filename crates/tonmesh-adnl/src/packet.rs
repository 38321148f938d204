//! Packet contents
//!
//! Wire format (all optional fields gated by `flags`):
//! [tag][rand1][flags][from][from_short][message | messages][address]
//! [priority_address][seqno][confirm_seqno][recv_addr_list_version]
//! [recv_priority_addr_list_version][reinit_date dst_reinit_date]
//! [signature][rand2]
//!
//! Setters keep `flags` in sync with the fields, so a packet never claims a
//! field it does not carry.

use bytes::{BufMut, Bytes, BytesMut};
use rand::{Rng, RngCore};
use tonmesh_crypto::{PrivateKey, PublicKey, ShortId, Signature};

use crate::address::AddressList;
use crate::codec::{self, Decode, Encode};
use crate::error::{AdnlError, AdnlResult};
use crate::message::Message;

pub const TAG_PACKET_CONTENTS: u32 = 0xd142_cd89;

/// Optional field bits
pub mod flags {
    pub const FROM: u32 = 0x1;
    pub const FROM_SHORT: u32 = 0x2;
    pub const ONE_MESSAGE: u32 = 0x4;
    pub const MULTIPLE_MESSAGES: u32 = 0x8;
    pub const ADDRESS: u32 = 0x10;
    pub const PRIORITY_ADDRESS: u32 = 0x20;
    pub const SEQNO: u32 = 0x40;
    pub const CONFIRM_SEQNO: u32 = 0x80;
    pub const RECV_ADDR_VERSION: u32 = 0x100;
    pub const RECV_PRIORITY_ADDR_VERSION: u32 = 0x200;
    pub const REINIT_DATE: u32 = 0x400;
    pub const SIGNATURE: u32 = 0x800;
    pub const PRIORITY: u32 = 0x1000;
    pub const ALL: u32 = 0x1fff;
}

/// Random padding length bounds
pub const MIN_RAND_LEN: usize = 7;
pub const MAX_RAND_LEN: usize = 14;

/// A decrypted datagram payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    rand1: Bytes,
    flags: u32,
    from: Option<PublicKey>,
    from_short: Option<ShortId>,
    message: Option<Message>,
    messages: Option<Vec<Message>>,
    address: Option<AddressList>,
    priority_address: Option<AddressList>,
    seqno: Option<u64>,
    confirm_seqno: Option<u64>,
    recv_addr_list_version: Option<i32>,
    recv_priority_addr_list_version: Option<i32>,
    reinit_dates: Option<(u32, u32)>,
    signature: Option<Bytes>,
    rand2: Bytes,
}

fn random_padding() -> Bytes {
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; rng.gen_range(MIN_RAND_LEN..=MAX_RAND_LEN)];
    rng.fill_bytes(&mut buf);
    Bytes::from(buf)
}

fn toggle(flags: &mut u32, bit: u32, present: bool) {
    if present {
        *flags |= bit;
    } else {
        *flags &= !bit;
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    /// An empty packet with fresh random padding
    pub fn new() -> Self {
        Self {
            rand1: random_padding(),
            flags: 0,
            from: None,
            from_short: None,
            message: None,
            messages: None,
            address: None,
            priority_address: None,
            seqno: None,
            confirm_seqno: None,
            recv_addr_list_version: None,
            recv_priority_addr_list_version: None,
            reinit_dates: None,
            signature: None,
            rand2: random_padding(),
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn from(&self) -> Option<&PublicKey> {
        self.from.as_ref()
    }

    /// Sender's full key; also sets the short id
    pub fn set_from(&mut self, from: Option<PublicKey>) {
        toggle(&mut self.flags, flags::FROM, from.is_some());
        self.set_from_short(from.map(|key| key.short_id()));
        self.from = from;
    }

    pub fn from_short(&self) -> Option<&ShortId> {
        self.from_short.as_ref()
    }

    pub fn set_from_short(&mut self, from_short: Option<ShortId>) {
        toggle(&mut self.flags, flags::FROM_SHORT, from_short.is_some());
        self.from_short = from_short;
    }

    /// Sender short id from whichever source field is present
    pub fn source_id(&self) -> Option<ShortId> {
        self.from
            .map(|key| key.short_id())
            .or(self.from_short)
    }

    /// Store messages, using the single-message field when there is one
    pub fn set_messages(&mut self, mut messages: Vec<Message>) {
        self.flags &= !(flags::ONE_MESSAGE | flags::MULTIPLE_MESSAGES);
        self.message = None;
        self.messages = None;
        match messages.len() {
            0 => {}
            1 => {
                self.flags |= flags::ONE_MESSAGE;
                self.message = messages.pop();
            }
            _ => {
                self.flags |= flags::MULTIPLE_MESSAGES;
                self.messages = Some(messages);
            }
        }
    }

    /// Contained messages in wire order
    pub fn messages(&self) -> Vec<&Message> {
        match (&self.message, &self.messages) {
            (Some(message), _) => vec![message],
            (None, Some(messages)) => messages.iter().collect(),
            (None, None) => Vec::new(),
        }
    }

    /// Take ownership of the contained messages
    pub fn take_messages(&mut self) -> Vec<Message> {
        let out = match (self.message.take(), self.messages.take()) {
            (Some(message), _) => vec![message],
            (None, Some(messages)) => messages,
            (None, None) => Vec::new(),
        };
        self.flags &= !(flags::ONE_MESSAGE | flags::MULTIPLE_MESSAGES);
        out
    }

    pub fn address(&self) -> Option<&AddressList> {
        self.address.as_ref()
    }

    pub fn set_address(&mut self, address: Option<AddressList>) {
        toggle(&mut self.flags, flags::ADDRESS, address.is_some());
        self.address = address;
    }

    pub fn priority_address(&self) -> Option<&AddressList> {
        self.priority_address.as_ref()
    }

    pub fn set_priority_address(&mut self, address: Option<AddressList>) {
        toggle(&mut self.flags, flags::PRIORITY_ADDRESS, address.is_some());
        self.priority_address = address;
    }

    pub fn seqno(&self) -> Option<u64> {
        self.seqno
    }

    pub fn set_seqno(&mut self, seqno: Option<u64>) {
        toggle(&mut self.flags, flags::SEQNO, seqno.is_some());
        self.seqno = seqno;
    }

    pub fn confirm_seqno(&self) -> Option<u64> {
        self.confirm_seqno
    }

    pub fn set_confirm_seqno(&mut self, seqno: Option<u64>) {
        toggle(&mut self.flags, flags::CONFIRM_SEQNO, seqno.is_some());
        self.confirm_seqno = seqno;
    }

    pub fn recv_addr_list_version(&self) -> Option<i32> {
        self.recv_addr_list_version
    }

    pub fn set_recv_addr_list_version(&mut self, version: Option<i32>) {
        toggle(&mut self.flags, flags::RECV_ADDR_VERSION, version.is_some());
        self.recv_addr_list_version = version;
    }

    pub fn recv_priority_addr_list_version(&self) -> Option<i32> {
        self.recv_priority_addr_list_version
    }

    pub fn set_recv_priority_addr_list_version(&mut self, version: Option<i32>) {
        toggle(
            &mut self.flags,
            flags::RECV_PRIORITY_ADDR_VERSION,
            version.is_some(),
        );
        self.recv_priority_addr_list_version = version;
    }

    /// `(reinit_date, dst_reinit_date)`: the sender's own reinit date and
    /// the one it believes the receiver has
    pub fn reinit_dates(&self) -> Option<(u32, u32)> {
        self.reinit_dates
    }

    pub fn set_reinit_dates(&mut self, dates: Option<(u32, u32)>) {
        toggle(&mut self.flags, flags::REINIT_DATE, dates.is_some());
        self.reinit_dates = dates;
    }

    pub fn signature(&self) -> Option<&Bytes> {
        self.signature.as_ref()
    }

    pub fn set_signature(&mut self, signature: Option<Bytes>) {
        toggle(&mut self.flags, flags::SIGNATURE, signature.is_some());
        self.signature = signature;
    }

    /// Sign the whole packet with `key`, which also becomes the sender
    pub fn sign(&mut self, key: &PrivateKey) {
        self.set_signature(None);
        self.set_from(Some(key.public_key()));
        let signature = key.sign(&self.to_bytes());
        self.set_signature(Some(Bytes::from(signature.to_vec())));
    }

    /// Verify the signature against `key`
    pub fn verify_signature(&self, key: &PublicKey) -> AdnlResult<()> {
        let signature = self.signature.as_ref().ok_or(AdnlError::InvalidSignature)?;
        let signature =
            Signature::try_from_slice(signature).map_err(|_| AdnlError::InvalidSignature)?;

        let mut unsigned = self.clone();
        unsigned.set_signature(None);
        key.verify(&unsigned.to_bytes(), &signature)
            .map_err(|_| AdnlError::InvalidSignature)
    }

    /// Verify the signature against the packet's own `from` key
    pub fn check_signature(&self) -> AdnlResult<()> {
        let from = self.from.ok_or(AdnlError::UnknownSource)?;
        self.verify_signature(&from)
    }
}

impl Encode for Packet {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(TAG_PACKET_CONTENTS);
        codec::put_bytes(buf, &self.rand1);
        buf.put_u32_le(self.flags);
        if let Some(from) = &self.from {
            codec::put_public_key(buf, from);
        }
        if let Some(from_short) = &self.from_short {
            buf.put_slice(from_short.as_bytes());
        }
        if let Some(message) = &self.message {
            message.encode(buf);
        }
        if let Some(messages) = &self.messages {
            buf.put_u32_le(messages.len() as u32);
            for message in messages {
                message.encode(buf);
            }
        }
        if let Some(address) = &self.address {
            address.encode(buf);
        }
        if let Some(address) = &self.priority_address {
            address.encode(buf);
        }
        if let Some(seqno) = self.seqno {
            buf.put_u64_le(seqno);
        }
        if let Some(seqno) = self.confirm_seqno {
            buf.put_u64_le(seqno);
        }
        if let Some(version) = self.recv_addr_list_version {
            buf.put_i32_le(version);
        }
        if let Some(version) = self.recv_priority_addr_list_version {
            buf.put_i32_le(version);
        }
        if let Some((reinit_date, dst_reinit_date)) = self.reinit_dates {
            buf.put_u32_le(reinit_date);
            buf.put_u32_le(dst_reinit_date);
        }
        if let Some(signature) = &self.signature {
            codec::put_bytes(buf, signature);
        }
        codec::put_bytes(buf, &self.rand2);
    }
}

impl Decode for Packet {
    fn decode(buf: &mut Bytes) -> AdnlResult<Self> {
        codec::expect_tag(buf, TAG_PACKET_CONTENTS, "packet")?;
        let rand1 = codec::get_bytes(buf)?;
        let flags = codec::get_u32(buf)?;

        if flags & !flags::ALL != 0 {
            return Err(AdnlError::Decode(format!("unknown flags 0x{:x}", flags)));
        }
        if flags & flags::ONE_MESSAGE != 0 && flags & flags::MULTIPLE_MESSAGES != 0 {
            return Err(AdnlError::Decode("both single and multiple messages".into()));
        }
        let has = |bit: u32| flags & bit != 0;

        let from = if has(flags::FROM) {
            Some(codec::get_public_key(buf)?)
        } else {
            None
        };
        let from_short = if has(flags::FROM_SHORT) {
            Some(codec::get_short_id(buf)?)
        } else {
            None
        };
        let message = if has(flags::ONE_MESSAGE) {
            Some(Message::decode(buf)?)
        } else {
            None
        };
        let messages = if has(flags::MULTIPLE_MESSAGES) {
            let count = codec::get_count(buf, 4)?;
            let mut messages = Vec::with_capacity(count);
            for _ in 0..count {
                messages.push(Message::decode(buf)?);
            }
            Some(messages)
        } else {
            None
        };
        let address = if has(flags::ADDRESS) {
            Some(AddressList::decode(buf)?)
        } else {
            None
        };
        let priority_address = if has(flags::PRIORITY_ADDRESS) {
            Some(AddressList::decode(buf)?)
        } else {
            None
        };
        let seqno = if has(flags::SEQNO) {
            Some(codec::get_u64(buf)?)
        } else {
            None
        };
        let confirm_seqno = if has(flags::CONFIRM_SEQNO) {
            Some(codec::get_u64(buf)?)
        } else {
            None
        };
        let recv_addr_list_version = if has(flags::RECV_ADDR_VERSION) {
            Some(codec::get_i32(buf)?)
        } else {
            None
        };
        let recv_priority_addr_list_version = if has(flags::RECV_PRIORITY_ADDR_VERSION) {
            Some(codec::get_i32(buf)?)
        } else {
            None
        };
        let reinit_dates = if has(flags::REINIT_DATE) {
            Some((codec::get_u32(buf)?, codec::get_u32(buf)?))
        } else {
            None
        };
        let signature = if has(flags::SIGNATURE) {
            Some(codec::get_bytes(buf)?)
        } else {
            None
        };
        let rand2 = codec::get_bytes(buf)?;

        if let (Some(from), Some(from_short)) = (&from, &from_short) {
            if from.short_id() != *from_short {
                return Err(AdnlError::Decode("from and from_short disagree".into()));
            }
        }

        Ok(Self {
            rand1,
            flags,
            from,
            from_short,
            message,
            messages,
            address,
            priority_address,
            seqno,
            confirm_seqno,
            recv_addr_list_version,
            recv_priority_addr_list_version,
            reinit_dates,
            signature,
            rand2,
        })
    }
}
