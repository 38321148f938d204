//! Update rules
//!
//! The rule in a key description decides which values are acceptable for
//! the key and how a new value is combined with the one already stored.

use serde::{Deserialize, Serialize};
use tonmesh_crypto::{PrivateKey, PublicKey, ShortId, Signature};

use crate::error::{DhtError, DhtResult};
use crate::value::DhtValue;

/// Write policy for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRule {
    /// Only the owner may write; values are signed by the owner
    Signature,
    /// Anyone may write; values are unsigned
    AnyBody,
    /// Value is a list of overlay members, each signing its own entry
    OverlayNodes,
}

/// One member entry of an overlay node list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayNode {
    pub id: PublicKey,
    pub overlay: ShortId,
    pub version: i32,
    pub signature: Signature,
}

#[derive(Serialize)]
struct OverlayNodeToSign {
    id: ShortId,
    overlay: ShortId,
    version: i32,
}

impl OverlayNode {
    /// Member entry for `key` in `overlay`, signed by `key`
    pub fn signed(key: &PrivateKey, overlay: ShortId, version: i32) -> DhtResult<Self> {
        let id = key.public_key();
        let to_sign = bincode::serialize(&OverlayNodeToSign {
            id: id.short_id(),
            overlay,
            version,
        })?;
        Ok(Self {
            id,
            overlay,
            version,
            signature: key.sign(&to_sign),
        })
    }

    pub fn check(&self) -> DhtResult<()> {
        let to_sign = bincode::serialize(&OverlayNodeToSign {
            id: self.id.short_id(),
            overlay: self.overlay,
            version: self.version,
        })?;
        self.id
            .verify(&to_sign, &self.signature)
            .map_err(|_| DhtError::InvalidSignature("overlay node"))
    }
}

/// Encode a member list as a value payload
pub fn encode_overlay_nodes(nodes: &[OverlayNode]) -> DhtResult<Vec<u8>> {
    Ok(bincode::serialize(nodes)?)
}

/// Decode a value payload as a member list
pub fn decode_overlay_nodes(payload: &[u8]) -> DhtResult<Vec<OverlayNode>> {
    Ok(bincode::deserialize(payload)?)
}

impl UpdateRule {
    /// Values under this rule must be stored again before they expire
    pub fn needs_republish(&self) -> bool {
        matches!(self, UpdateRule::Signature)
    }

    /// Check `value` against this rule
    pub fn check_value(&self, value: &DhtValue) -> DhtResult<()> {
        match self {
            UpdateRule::Signature => {
                let owner = value
                    .description
                    .owner
                    .public_key()
                    .ok_or_else(|| DhtError::InvalidValue("signed value without owner key".into()))?;
                let signature = value
                    .signature
                    .as_ref()
                    .ok_or(DhtError::InvalidSignature("value"))?;
                owner
                    .verify(&value.to_sign()?, signature)
                    .map_err(|_| DhtError::InvalidSignature("value"))
            }
            UpdateRule::AnyBody => {
                if value.signature.is_some() {
                    return Err(DhtError::InvalidValue("anybody value carries a signature".into()));
                }
                Ok(())
            }
            UpdateRule::OverlayNodes => {
                if value.signature.is_some() {
                    return Err(DhtError::InvalidValue("overlay value carries a signature".into()));
                }
                let overlay = value.description.key.id;
                for node in decode_overlay_nodes(&value.value)? {
                    if node.overlay != overlay {
                        return Err(DhtError::InvalidValue(format!(
                            "node {} belongs to overlay {}",
                            node.id.short_id(),
                            node.overlay
                        )));
                    }
                    node.check()?;
                }
                Ok(())
            }
        }
    }

    /// Combine an incoming, already checked value with the stored one.
    ///
    /// Returns the value to store, or `None` to keep what is stored.
    pub fn merge(
        &self,
        stored: Option<&DhtValue>,
        incoming: DhtValue,
        max_value_size: usize,
    ) -> DhtResult<Option<DhtValue>> {
        let Some(stored) = stored else {
            return Ok(Some(incoming));
        };

        match self {
            UpdateRule::Signature => {
                if incoming.ttl > stored.ttl {
                    Ok(Some(incoming))
                } else {
                    Ok(None)
                }
            }
            UpdateRule::AnyBody => Ok(Some(incoming)),
            UpdateRule::OverlayNodes => {
                let mut nodes = decode_overlay_nodes(&stored.value)?;
                for node in decode_overlay_nodes(&incoming.value)? {
                    match nodes.iter_mut().find(|n| n.id == node.id) {
                        Some(existing) if existing.version < node.version => *existing = node,
                        Some(_) => {}
                        None => nodes.push(node),
                    }
                }

                let merged = encode_overlay_nodes(&nodes)?;
                if merged.len() > max_value_size {
                    // Too many members for one value; take the newcomer as is
                    return Ok(Some(incoming));
                }
                Ok(Some(DhtValue {
                    value: merged,
                    ttl: stored.ttl.max(incoming.ttl),
                    ..incoming
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{overlay_id, DhtKey, DhtKeyDescription};

    fn overlay_value(name: &[u8], nodes: &[OverlayNode], ttl: u32) -> DhtValue {
        DhtValue::new(
            DhtKeyDescription::overlay(name),
            encode_overlay_nodes(nodes).unwrap(),
            ttl,
        )
    }

    #[test]
    fn test_signature_rule() {
        let owner = PrivateKey::generate();
        let description = DhtKeyDescription::signed(
            DhtKey::address(owner.short_id()),
            &owner,
            UpdateRule::Signature,
        )
        .unwrap();

        let mut value = DhtValue::new(description, b"payload".to_vec(), 100);
        assert!(UpdateRule::Signature.check_value(&value).is_err());

        value.sign(&owner).unwrap();
        assert!(UpdateRule::Signature.check_value(&value).is_ok());

        value.value = b"changed".to_vec();
        assert!(matches!(
            UpdateRule::Signature.check_value(&value),
            Err(DhtError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_signature_rule_keeps_later_ttl() {
        let owner = PrivateKey::generate();
        let description = DhtKeyDescription::signed(
            DhtKey::address(owner.short_id()),
            &owner,
            UpdateRule::Signature,
        )
        .unwrap();
        let old = DhtValue::new(description.clone(), b"old".to_vec(), 200);
        let new = DhtValue::new(description, b"new".to_vec(), 100);

        let merged = UpdateRule::Signature.merge(Some(&old), new.clone(), 768).unwrap();
        assert!(merged.is_none());
        let merged = UpdateRule::Signature.merge(Some(&new), old.clone(), 768).unwrap();
        assert_eq!(merged.unwrap().value, b"old");
    }

    #[test]
    fn test_anybody_rule() {
        let owner = PrivateKey::generate();
        let description = DhtKeyDescription::signed(
            DhtKey::new(owner.short_id(), "board", 1).unwrap(),
            &owner,
            UpdateRule::AnyBody,
        )
        .unwrap();
        let mut value = DhtValue::new(description, b"anyone".to_vec(), 100);
        assert!(UpdateRule::AnyBody.check_value(&value).is_ok());

        value.sign(&owner).unwrap();
        assert!(UpdateRule::AnyBody.check_value(&value).is_err());
    }

    #[test]
    fn test_overlay_nodes_rule() {
        let overlay = overlay_id(b"shard");
        let member = PrivateKey::generate();
        let node = OverlayNode::signed(&member, overlay, 1).unwrap();
        let value = overlay_value(b"shard", &[node.clone()], 100);
        assert!(UpdateRule::OverlayNodes.check_value(&value).is_ok());

        // Entry for another overlay
        let stray = OverlayNode::signed(&member, overlay_id(b"other"), 1).unwrap();
        let value = overlay_value(b"shard", &[stray], 100);
        assert!(UpdateRule::OverlayNodes.check_value(&value).is_err());

        // Version bumped without re-signing
        let mut forged = node;
        forged.version = 2;
        let value = overlay_value(b"shard", &[forged], 100);
        assert!(UpdateRule::OverlayNodes.check_value(&value).is_err());
    }

    #[test]
    fn test_overlay_nodes_merge() {
        let overlay = overlay_id(b"shard");
        let a = PrivateKey::generate();
        let b = PrivateKey::generate();

        let stored = overlay_value(
            b"shard",
            &[
                OverlayNode::signed(&a, overlay, 5).unwrap(),
                OverlayNode::signed(&b, overlay, 1).unwrap(),
            ],
            300,
        );
        let incoming = overlay_value(
            b"shard",
            &[
                OverlayNode::signed(&a, overlay, 3).unwrap(),
                OverlayNode::signed(&b, overlay, 2).unwrap(),
            ],
            200,
        );

        let merged = UpdateRule::OverlayNodes
            .merge(Some(&stored), incoming, 768)
            .unwrap()
            .unwrap();
        assert_eq!(merged.ttl, 300);

        let nodes = decode_overlay_nodes(&merged.value).unwrap();
        assert_eq!(nodes.len(), 2);
        let version_of = |key: &PrivateKey| {
            nodes
                .iter()
                .find(|n| n.id == key.public_key())
                .map(|n| n.version)
        };
        assert_eq!(version_of(&a), Some(5));
        assert_eq!(version_of(&b), Some(2));
        assert!(UpdateRule::OverlayNodes.check_value(&merged).is_ok());
    }
}
