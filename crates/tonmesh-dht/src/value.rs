//! DHT values and node records

use serde::{Deserialize, Serialize};
use tonmesh_adnl::AddressList;
use tonmesh_crypto::{PrivateKey, PublicKey, ShortId, Signature};

use crate::error::{DhtError, DhtResult};
use crate::key::DhtKeyDescription;

/// A stored record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtValue {
    pub description: DhtKeyDescription,
    pub value: Vec<u8>,
    /// Unix time after which the value is dead
    pub ttl: u32,
    pub signature: Option<Signature>,
}

impl DhtValue {
    /// An unsigned value
    pub fn new(description: DhtKeyDescription, value: Vec<u8>, ttl: u32) -> Self {
        Self {
            description,
            value,
            ttl,
            signature: None,
        }
    }

    /// Hash of the key this value is stored under
    pub fn key_hash(&self) -> ShortId {
        self.description.key.hash()
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.ttl < now
    }

    pub(crate) fn to_sign(&self) -> DhtResult<Vec<u8>> {
        let unsigned = Self {
            signature: None,
            ..self.clone()
        };
        Ok(bincode::serialize(&unsigned)?)
    }

    /// Sign the value as the key owner
    pub fn sign(&mut self, key: &PrivateKey) -> DhtResult<()> {
        self.signature = None;
        self.signature = Some(key.sign(&self.to_sign()?));
        Ok(())
    }

    /// Full validation: size, expiry, key description and update rule
    pub fn check(&self, now: u32, max_value_size: usize) -> DhtResult<()> {
        if self.value.len() > max_value_size {
            return Err(DhtError::ValueTooLarge {
                size: self.value.len(),
                max: max_value_size,
            });
        }
        if self.is_expired(now) {
            return Err(DhtError::Expired(self.ttl));
        }
        self.description.check()?;
        self.description.update_rule.check_value(self)
    }
}

/// A participant's signed contact record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtNode {
    pub id: PublicKey,
    pub addr_list: AddressList,
    pub version: i32,
    pub signature: Option<Signature>,
}

impl DhtNode {
    /// Record for `key` at `addr_list`, signed by `key`
    pub fn signed(key: &PrivateKey, addr_list: AddressList, version: i32) -> DhtResult<Self> {
        let mut node = Self {
            id: key.public_key(),
            addr_list,
            version,
            signature: None,
        };
        node.signature = Some(key.sign(&node.to_sign()?));
        Ok(node)
    }

    /// Record without a signature, as given for bootstrap nodes
    pub fn unsigned(id: PublicKey, addr_list: AddressList) -> Self {
        Self {
            id,
            addr_list,
            version: 0,
            signature: None,
        }
    }

    pub fn short_id(&self) -> ShortId {
        self.id.short_id()
    }

    fn to_sign(&self) -> DhtResult<Vec<u8>> {
        let unsigned = Self {
            signature: None,
            ..self.clone()
        };
        Ok(bincode::serialize(&unsigned)?)
    }

    pub fn check_signature(&self) -> DhtResult<()> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(DhtError::InvalidSignature("node record"))?;
        self.id
            .verify(&self.to_sign()?, signature)
            .map_err(|_| DhtError::InvalidSignature("node record"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::DhtKey;
    use crate::update_rule::UpdateRule;
    use tonmesh_adnl::Address;

    fn signed_value(owner: &PrivateKey, payload: &[u8], ttl: u32) -> DhtValue {
        let description = DhtKeyDescription::signed(
            DhtKey::address(owner.short_id()),
            owner,
            UpdateRule::Signature,
        )
        .unwrap();
        let mut value = DhtValue::new(description, payload.to_vec(), ttl);
        value.sign(owner).unwrap();
        value
    }

    #[test]
    fn test_value_check() {
        let owner = PrivateKey::generate();
        let value = signed_value(&owner, b"hello", 1000);
        assert!(value.check(500, 768).is_ok());
        assert!(matches!(value.check(1001, 768), Err(DhtError::Expired(1000))));
        assert!(matches!(
            value.check(500, 3),
            Err(DhtError::ValueTooLarge { size: 5, max: 3 })
        ));
    }

    #[test]
    fn test_decoded_key_is_revalidated() {
        let owner = PrivateKey::generate();
        for key in [
            DhtKey { id: owner.short_id(), name: "n".repeat(300), idx: 0 },
            DhtKey { id: owner.short_id(), name: "address".to_string(), idx: 99 },
        ] {
            let description =
                DhtKeyDescription::signed(key, &owner, UpdateRule::Signature).unwrap();
            let mut value = DhtValue::new(description, b"x".to_vec(), 1000);
            value.sign(&owner).unwrap();
            let bytes = bincode::serialize(&value).unwrap();
            let back: DhtValue = bincode::deserialize(&bytes).unwrap();
            assert!(matches!(back.check(500, 768), Err(DhtError::InvalidKey(_))));
        }

        // Lengths past one byte are hashed in full
        let short = DhtKey { id: owner.short_id(), name: "n".repeat(44), idx: 0 };
        let long = DhtKey { id: owner.short_id(), name: "n".repeat(300), idx: 0 };
        assert_ne!(short.hash(), long.hash());
    }

    #[test]
    fn test_value_by_non_owner() {
        let owner = PrivateKey::generate();
        let mallory = PrivateKey::generate();
        let mut value = signed_value(&owner, b"hello", 1000);
        value.sign(&mallory).unwrap();
        assert!(matches!(
            value.check(500, 768),
            Err(DhtError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_node_record_signature() {
        let key = PrivateKey::generate();
        let addr_list = AddressList::new(vec![Address::Udp { ip: 1, port: 2 }], 1, 1);
        let node = DhtNode::signed(&key, addr_list, 7).unwrap();
        assert!(node.check_signature().is_ok());

        let mut moved = node.clone();
        moved.addr_list.addresses[0] = Address::Udp { ip: 6, port: 6 };
        assert!(moved.check_signature().is_err());

        let bare = DhtNode::unsigned(key.public_key(), node.addr_list.clone());
        assert!(bare.check_signature().is_err());
    }

    #[test]
    fn test_records_survive_bincode() {
        let key = PrivateKey::generate();
        let node = DhtNode::signed(&key, AddressList::default(), 1).unwrap();
        let bytes = bincode::serialize(&node).unwrap();
        let back: DhtNode = bincode::deserialize(&bytes).unwrap();
        assert!(back.check_signature().is_ok());

        let value = signed_value(&key, b"x", 10);
        let bytes = bincode::serialize(&value).unwrap();
        let back: DhtValue = bincode::deserialize(&bytes).unwrap();
        assert!(back.check(1, 768).is_ok());
    }
}
