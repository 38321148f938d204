//! Node addresses
//!
//! A node advertises an ordered list of endpoints. The list is replaced
//! wholesale on update and only ever moves forward: version and reinit date
//! must not decrease.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::codec::{self, Decode, Encode};
use crate::error::{AdnlError, AdnlResult};

pub const TAG_ADDRESS_UDP: u32 = 0x670d_a6e7;
pub const TAG_ADDRESS_UDP6: u32 = 0xe31d_63fa;
pub const TAG_ADDRESS_REVERSE: u32 = 0xe8d2_5d71;
pub const TAG_ADDRESS_LIST: u32 = 0x2227_e658;

/// How far into the future a peer's reinit date may be
pub const MAX_REINIT_DATE_SKEW: u32 = 60;

/// A single reachable endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    Udp { ip: u32, port: u16 },
    Udp6 { ip: [u8; 16], port: u16 },
    /// Reachable only through a reverse connection; cannot be dialled
    Reverse,
}

/// A node's advertised endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressList {
    pub addresses: Vec<Address>,
    pub version: i32,
    pub reinit_date: u32,
    pub priority: i32,
    /// Unix time after which the list is stale; 0 means never
    pub expire_at: u32,
}

impl Address {
    /// Socket address to send to
    pub fn to_socket_addr(&self) -> AdnlResult<SocketAddr> {
        match *self {
            Address::Udp { ip, port } => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)),
            Address::Udp6 { ip, port } => Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)),
            Address::Reverse => Err(AdnlError::UnsupportedAddress("reverse".into())),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::Udp {
                ip: u32::from(*v4.ip()),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Address::Udp6 {
                ip: v6.ip().octets(),
                port: v6.port(),
            },
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_socket_addr() {
            Ok(addr) => write!(f, "{}", addr),
            Err(_) => write!(f, "reverse"),
        }
    }
}

impl Encode for Address {
    fn encode(&self, buf: &mut BytesMut) {
        match *self {
            Address::Udp { ip, port } => {
                buf.put_u32_le(TAG_ADDRESS_UDP);
                buf.put_u32_le(ip);
                buf.put_i32_le(port as i32);
            }
            Address::Udp6 { ip, port } => {
                buf.put_u32_le(TAG_ADDRESS_UDP6);
                buf.put_slice(&ip);
                buf.put_i32_le(port as i32);
            }
            Address::Reverse => buf.put_u32_le(TAG_ADDRESS_REVERSE),
        }
    }
}

fn get_port(buf: &mut Bytes) -> AdnlResult<u16> {
    let port = codec::get_i32(buf)?;
    u16::try_from(port).map_err(|_| AdnlError::Decode(format!("bad port {}", port)))
}

impl Decode for Address {
    fn decode(buf: &mut Bytes) -> AdnlResult<Self> {
        match codec::get_u32(buf)? {
            TAG_ADDRESS_UDP => {
                let ip = codec::get_u32(buf)?;
                let port = get_port(buf)?;
                Ok(Address::Udp { ip, port })
            }
            TAG_ADDRESS_UDP6 => {
                let hi = codec::get_u64(buf)?.to_le_bytes();
                let lo = codec::get_u64(buf)?.to_le_bytes();
                let mut ip = [0u8; 16];
                ip[..8].copy_from_slice(&hi);
                ip[8..].copy_from_slice(&lo);
                let port = get_port(buf)?;
                Ok(Address::Udp6 { ip, port })
            }
            TAG_ADDRESS_REVERSE => Ok(Address::Reverse),
            tag => Err(AdnlError::Decode(format!("unknown address tag 0x{:08x}", tag))),
        }
    }
}

impl AddressList {
    pub fn new(addresses: Vec<Address>, version: i32, reinit_date: u32) -> Self {
        Self {
            addresses,
            version,
            reinit_date,
            priority: 0,
            expire_at: 0,
        }
    }

    /// A list with a single observed endpoint
    pub fn single(addr: SocketAddr) -> Self {
        Self::new(vec![Address::from(addr)], 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.expire_at != 0 && self.expire_at < now
    }

    /// A random dialable address
    pub fn pick(&self) -> Option<&Address> {
        let dialable: Vec<&Address> = self
            .addresses
            .iter()
            .filter(|a| !matches!(a, Address::Reverse))
            .collect();
        dialable.choose(&mut rand::thread_rng()).copied()
    }

    /// Whether `update` may replace this list at time `now`
    pub fn accepts_update(&self, update: &AddressList, now: u32) -> bool {
        if update.is_empty() {
            return false;
        }
        if update.reinit_date > now.saturating_add(MAX_REINIT_DATE_SKEW) {
            return false;
        }
        update.reinit_date >= self.reinit_date && update.version >= self.version
    }
}

impl Encode for AddressList {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(TAG_ADDRESS_LIST);
        buf.put_u32_le(self.addresses.len() as u32);
        for address in &self.addresses {
            address.encode(buf);
        }
        buf.put_i32_le(self.version);
        buf.put_u32_le(self.reinit_date);
        buf.put_i32_le(self.priority);
        buf.put_u32_le(self.expire_at);
    }
}

impl Decode for AddressList {
    fn decode(buf: &mut Bytes) -> AdnlResult<Self> {
        codec::expect_tag(buf, TAG_ADDRESS_LIST, "address list")?;
        let count = codec::get_count(buf, 4)?;
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            addresses.push(Address::decode(buf)?);
        }
        Ok(Self {
            addresses,
            version: codec::get_i32(buf)?,
            reinit_date: codec::get_u32(buf)?,
            priority: codec::get_i32(buf)?,
            expire_at: codec::get_u32(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AddressList {
        let mut list = AddressList::new(
            vec![
                Address::from("10.0.0.1:3000".parse::<SocketAddr>().unwrap()),
                Address::from("[::1]:3001".parse::<SocketAddr>().unwrap()),
                Address::Reverse,
            ],
            7,
            1_700_000_000,
        );
        list.priority = 2;
        list.expire_at = 1_800_000_000;
        list
    }

    #[test]
    fn test_address_list_roundtrip() {
        let list = sample();
        let decoded = AddressList::from_bytes(list.to_bytes()).unwrap();
        assert_eq!(list, decoded);
    }

    #[test]
    fn test_socket_addr_conversion() {
        let addr: SocketAddr = "192.168.1.20:30303".parse().unwrap();
        assert_eq!(Address::from(addr).to_socket_addr().unwrap(), addr);

        let addr6: SocketAddr = "[2001:db8::5]:443".parse().unwrap();
        assert_eq!(Address::from(addr6).to_socket_addr().unwrap(), addr6);

        assert!(Address::Reverse.to_socket_addr().is_err());
    }

    #[test]
    fn test_pick_skips_reverse() {
        let list = AddressList::new(vec![Address::Reverse], 0, 0);
        assert!(list.pick().is_none());

        let list = sample();
        for _ in 0..20 {
            assert_ne!(list.pick(), Some(&Address::Reverse));
        }
    }

    #[test]
    fn test_update_rules() {
        let now = 1_700_000_100;
        let current = sample();

        let mut newer = sample();
        newer.version = 8;
        assert!(current.accepts_update(&newer, now));

        let mut older = sample();
        older.version = 6;
        assert!(!current.accepts_update(&older, now));

        let mut stale_reinit = sample();
        stale_reinit.reinit_date -= 1;
        assert!(!current.accepts_update(&stale_reinit, now));

        let mut future = sample();
        future.reinit_date = now + MAX_REINIT_DATE_SKEW + 1;
        assert!(!current.accepts_update(&future, now));

        let empty = AddressList::new(vec![], 100, now);
        assert!(!current.accepts_update(&empty, now));
    }

    #[test]
    fn test_unknown_address_tag() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0x1234_5678);
        assert!(Address::from_bytes(buf.freeze()).is_err());
    }
}
