//! TonMesh Distributed Hash Table
//!
//! Kademlia over ADNL: signed node records, keys owned by identities or
//! overlays, update rules deciding who may write a value, beam-search
//! lookups and address resolution for ADNL peers.

pub mod config;
pub mod error;
pub mod key;
pub mod network;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod storage;
pub mod update_rule;
pub mod value;

pub use config::DhtConfig;
pub use error::{DhtError, DhtResult};
pub use key::{overlay_id, DhtKey, DhtKeyDescription, DhtKeyOwner};
pub use network::{Dht, DhtStats, ReversePing, ValueLookup};
pub use node::RemoteNode;
pub use protocol::{DhtMessage, DhtQuery, DhtRequest, DhtResponse, DHT_PREFIX};
pub use routing::{AddOutcome, KBucket, LatencyHistory, RoutingEntry, RoutingTable};
pub use storage::DhtStorage;
pub use update_rule::{OverlayNode, UpdateRule};
pub use value::{DhtNode, DhtValue};
