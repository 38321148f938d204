//! DHT keys and key descriptions
//!
//! A key is `(owner id, name, index)`. Its hash places the record in the
//! id space. The description binds the key to its owner and to the update
//! rule that decides who may write the value.

use serde::{Deserialize, Serialize};
use tonmesh_crypto::constants::KEY_TAG_OVERLAY;
use tonmesh_crypto::{PrivateKey, PublicKey, ShortId, Signature};

use crate::error::{DhtError, DhtResult};
use crate::update_rule::UpdateRule;

/// Longest key name in bytes
pub const MAX_NAME_LEN: usize = 127;

/// Highest key index
pub const MAX_KEY_INDEX: u32 = 15;

/// Name under which nodes publish their address lists
pub const ADDRESS_KEY_NAME: &str = "address";

/// Name under which overlay member lists are stored
pub const OVERLAY_NODES_KEY_NAME: &str = "nodes";

/// A DHT record name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DhtKey {
    /// Hash of the owner
    pub id: ShortId,
    pub name: String,
    pub idx: u32,
}

impl DhtKey {
    pub fn new(id: ShortId, name: impl Into<String>, idx: u32) -> DhtResult<Self> {
        let key = Self {
            id,
            name: name.into(),
            idx,
        };
        key.validate()?;
        Ok(key)
    }

    /// Key a node publishes its address list under
    pub fn address(id: ShortId) -> Self {
        Self {
            id,
            name: ADDRESS_KEY_NAME.to_string(),
            idx: 0,
        }
    }

    pub fn validate(&self) -> DhtResult<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(DhtError::InvalidKey(format!(
                "name length {} outside 1..={}",
                self.name.len(),
                MAX_NAME_LEN
            )));
        }
        if self.idx > MAX_KEY_INDEX {
            return Err(DhtError::InvalidKey(format!(
                "index {} above {}",
                self.idx, MAX_KEY_INDEX
            )));
        }
        Ok(())
    }

    /// Position of the record in the id space
    pub fn hash(&self) -> ShortId {
        // id ‖ name length ‖ name ‖ idx; the length is not truncated for
        // decoded keys that have not been validated yet
        let name_len = u32::try_from(self.name.len()).unwrap_or(u32::MAX);
        let mut buf = Vec::with_capacity(32 + 4 + self.name.len() + 4);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&self.idx.to_le_bytes());
        ShortId::hash(&buf)
    }
}

/// Who a key belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtKeyOwner {
    /// A node identity; writes are signed with this key
    Ed25519(PublicKey),
    /// A named overlay; nobody signs, members sign their own entries
    Overlay { name: Vec<u8> },
}

impl DhtKeyOwner {
    /// The id keys of this owner must carry
    pub fn id(&self) -> ShortId {
        match self {
            DhtKeyOwner::Ed25519(key) => key.short_id(),
            DhtKeyOwner::Overlay { name } => overlay_id(name),
        }
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        match self {
            DhtKeyOwner::Ed25519(key) => Some(key),
            DhtKeyOwner::Overlay { .. } => None,
        }
    }
}

/// Id of the overlay called `name`
pub fn overlay_id(name: &[u8]) -> ShortId {
    ShortId::from_tagged(KEY_TAG_OVERLAY, name)
}

/// A key bound to its owner and update rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtKeyDescription {
    pub key: DhtKey,
    pub owner: DhtKeyOwner,
    pub update_rule: UpdateRule,
    pub signature: Option<Signature>,
}

impl DhtKeyDescription {
    /// Description of `key` owned and signed by `owner`
    pub fn signed(key: DhtKey, owner: &PrivateKey, update_rule: UpdateRule) -> DhtResult<Self> {
        let mut description = Self {
            key,
            owner: DhtKeyOwner::Ed25519(owner.public_key()),
            update_rule,
            signature: None,
        };
        description.signature = Some(owner.sign(&description.to_sign()?));
        Ok(description)
    }

    /// Description of the member list of the overlay called `name`
    pub fn overlay(name: &[u8]) -> Self {
        Self {
            key: DhtKey {
                id: overlay_id(name),
                name: OVERLAY_NODES_KEY_NAME.to_string(),
                idx: 0,
            },
            owner: DhtKeyOwner::Overlay {
                name: name.to_vec(),
            },
            update_rule: UpdateRule::OverlayNodes,
            signature: None,
        }
    }

    fn to_sign(&self) -> DhtResult<Vec<u8>> {
        let unsigned = Self {
            signature: None,
            ..self.clone()
        };
        Ok(bincode::serialize(&unsigned)?)
    }

    /// Check the key, its binding to the owner and the owner's signature
    pub fn check(&self) -> DhtResult<()> {
        self.key.validate()?;
        if self.key.id != self.owner.id() {
            return Err(DhtError::InvalidKey(format!(
                "key id {} does not match owner {}",
                self.key.id,
                self.owner.id()
            )));
        }

        match (&self.owner, self.update_rule) {
            (DhtKeyOwner::Ed25519(key), UpdateRule::Signature | UpdateRule::AnyBody) => {
                let signature = self
                    .signature
                    .as_ref()
                    .ok_or(DhtError::InvalidSignature("key description"))?;
                key.verify(&self.to_sign()?, signature)
                    .map_err(|_| DhtError::InvalidSignature("key description"))
            }
            (DhtKeyOwner::Overlay { .. }, UpdateRule::OverlayNodes) => {
                if self.signature.is_some() {
                    return Err(DhtError::InvalidSignature("overlay key description"));
                }
                Ok(())
            }
            (owner, rule) => Err(DhtError::InvalidKey(format!(
                "rule {:?} cannot apply to owner {:?}",
                rule, owner
            ))),
        }
    }
}
