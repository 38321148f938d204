//! Remote DHT node entries

use std::time::{Duration, Instant};

use tonmesh_crypto::ShortId;

use crate::routing::{LatencyHistory, RoutingEntry};
use crate::value::DhtNode;

/// A peer in the routing table
#[derive(Clone, Debug)]
pub struct RemoteNode {
    /// Last known contact record
    pub node: DhtNode,

    id: ShortId,

    /// Recent ping round trips
    pub latency: LatencyHistory,

    /// When the node was last pinged
    pub last_ping: Option<Instant>,
}

impl RemoteNode {
    pub fn new(node: DhtNode, history: usize) -> Self {
        Self {
            id: node.short_id(),
            node,
            latency: LatencyHistory::new(history),
            last_ping: None,
        }
    }

    /// Record a ping result
    pub fn record_ping(&mut self, rtt: Option<Duration>) {
        self.latency.record(rtt);
        self.last_ping = Some(Instant::now());
    }

    /// Due for a ping when never pinged or not within `ttl`
    pub fn needs_ping(&self, ttl: Duration) -> bool {
        self.last_ping.map_or(true, |at| at.elapsed() >= ttl)
    }

    /// Every one of the last `window` pings failed
    pub fn is_dead(&self, window: usize) -> bool {
        self.latency.len() >= window && self.latency.average().is_none()
    }
}

impl RoutingEntry for RemoteNode {
    fn id(&self) -> &ShortId {
        &self.id
    }

    fn latency(&self) -> Option<Duration> {
        self.latency.average()
    }

    fn refresh(&mut self, newer: Self) {
        // Ping history stays; the record is only replaced by a newer version
        if newer.node.version >= self.node.version {
            self.node = newer.node;
        }
    }
}
