//! Wire codec
//!
//! Every structure on the wire starts with a 4-byte constructor tag. Integers
//! are little endian. Byte strings carry a 1-byte length (or `0xFE` followed
//! by a 3-byte length when 254 bytes or longer) and are zero padded to a
//! multiple of 4. Vectors are a `u32` count followed by the elements.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tonmesh_crypto::constants::KEY_TAG_ED25519;
use tonmesh_crypto::{PublicKey, ShortId};

use crate::error::{AdnlError, AdnlResult};

/// Longest byte string the codec can express
pub const MAX_BYTES_LEN: usize = 0x00FF_FFFF;

/// A type with a wire encoding
pub trait Encode {
    fn encode(&self, buf: &mut BytesMut);

    /// Encode into a fresh buffer
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// A type that can be read back from the wire
pub trait Decode: Sized {
    fn decode(buf: &mut Bytes) -> AdnlResult<Self>;

    /// Decode a complete buffer, rejecting trailing bytes
    fn from_bytes(mut bytes: Bytes) -> AdnlResult<Self> {
        let value = Self::decode(&mut bytes)?;
        if bytes.has_remaining() {
            return Err(AdnlError::Decode(format!(
                "{} trailing bytes",
                bytes.remaining()
            )));
        }
        Ok(value)
    }
}

fn ensure(buf: &Bytes, needed: usize) -> AdnlResult<()> {
    if buf.remaining() < needed {
        return Err(AdnlError::Decode(format!(
            "need {} bytes, {} left",
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_u32(buf: &mut Bytes) -> AdnlResult<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn get_i32(buf: &mut Bytes) -> AdnlResult<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub fn get_u64(buf: &mut Bytes) -> AdnlResult<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn get_int256(buf: &mut Bytes) -> AdnlResult<[u8; 32]> {
    ensure(buf, 32)?;
    let mut out = [0u8; 32];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn get_short_id(buf: &mut Bytes) -> AdnlResult<ShortId> {
    Ok(ShortId::from_bytes(get_int256(buf)?))
}

/// Read a tag and check it
pub fn expect_tag(buf: &mut Bytes, tag: u32, what: &str) -> AdnlResult<()> {
    let actual = get_u32(buf)?;
    if actual != tag {
        return Err(AdnlError::Decode(format!(
            "bad {} tag 0x{:08x}",
            what, actual
        )));
    }
    Ok(())
}

fn padding(prefix: usize, len: usize) -> usize {
    (4 - (prefix + len) % 4) % 4
}

/// Bytes used by a byte string of `len` bytes, prefix and padding included
pub fn bytes_len(len: usize) -> usize {
    let prefix = if len < 254 { 1 } else { 4 };
    prefix + len + padding(prefix, len)
}

pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    debug_assert!(data.len() <= MAX_BYTES_LEN);
    let prefix = if data.len() < 254 {
        buf.put_u8(data.len() as u8);
        1
    } else {
        buf.put_u8(0xFE);
        let len = (data.len() as u32).to_le_bytes();
        buf.put_slice(&len[..3]);
        4
    };
    buf.put_slice(data);
    buf.put_bytes(0, padding(prefix, data.len()));
}

pub fn get_bytes(buf: &mut Bytes) -> AdnlResult<Bytes> {
    ensure(buf, 1)?;
    let first = buf.get_u8();
    let (prefix, len) = if first < 254 {
        (1, first as usize)
    } else if first == 0xFE {
        ensure(buf, 3)?;
        let mut len = [0u8; 4];
        buf.copy_to_slice(&mut len[..3]);
        (4, u32::from_le_bytes(len) as usize)
    } else {
        return Err(AdnlError::Decode("bad byte string prefix 0xff".into()));
    };

    let pad = padding(prefix, len);
    ensure(buf, len + pad)?;
    let data = buf.split_to(len);
    buf.advance(pad);
    Ok(data)
}

pub fn put_public_key(buf: &mut BytesMut, key: &PublicKey) {
    buf.put_u32_le(KEY_TAG_ED25519);
    buf.put_slice(key.as_bytes());
}

pub fn get_public_key(buf: &mut Bytes) -> AdnlResult<PublicKey> {
    expect_tag(buf, KEY_TAG_ED25519, "public key")?;
    let bytes = get_int256(buf)?;
    Ok(PublicKey::from_bytes(bytes)?)
}

/// Read a vector count, refusing counts the buffer cannot possibly hold
pub fn get_count(buf: &mut Bytes, min_item_size: usize) -> AdnlResult<usize> {
    let count = get_u32(buf)? as usize;
    if count.saturating_mul(min_item_size.max(1)) > buf.remaining() {
        return Err(AdnlError::Decode(format!("vector of {} items overruns buffer", count)));
    }
    Ok(count)
}
