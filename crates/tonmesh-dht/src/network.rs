//! DHT engine
//!
//! Runs the DHT protocol on top of an ADNL local node. Queries to other
//! nodes go through ADNL connections; queries from them arrive through a
//! subscription on [`DHT_PREFIX`].

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future;
use futures::stream::{self, FuturesUnordered, StreamExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tonmesh_adnl::{unix_now, AddressList, AddressResolver, Decode, Encode, LocalNode, Subscriber};
use tonmesh_crypto::{PublicKey, ShortId, Signature};
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::error::{DhtError, DhtResult};
use crate::key::{DhtKey, DhtKeyDescription};
use crate::node::RemoteNode;
use crate::protocol::{
    decode_message, decode_query, decode_response, encode_message, encode_query, encode_response,
    DhtMessage, DhtQuery, DhtRequest, DhtResponse, RegisterReverseToSign, ReversePingToSign,
    DHT_PREFIX,
};
use crate::routing::{AddOutcome, RoutingEntry, RoutingTable};
use crate::storage::DhtStorage;
use crate::update_rule::UpdateRule;
use crate::value::{DhtNode, DhtValue};

/// Answer to a single `FindValue`
#[derive(Debug, Clone)]
pub enum ValueLookup {
    Found(DhtValue),
    /// Not stored there; nodes closer to the key
    Closer(Vec<DhtNode>),
}

/// Answer to a reverse ping request
#[derive(Debug, Clone)]
pub enum ReversePing {
    /// The client was told to ping us
    Sent,
    /// The client is not registered there; nodes closer to it
    ClientNotFound(Vec<DhtNode>),
}

/// Snapshot of DHT state
#[derive(Debug, Clone, Default)]
pub struct DhtStats {
    pub nodes: usize,
    pub values: usize,
    pub reverse_clients: usize,
    pub connections: usize,
}

/// A DHT participant
pub struct Dht {
    this: Weak<Dht>,
    adnl: Arc<LocalNode>,
    id: ShortId,
    config: DhtConfig,
    routing: RwLock<RoutingTable<RemoteNode>>,
    storage: RwLock<DhtStorage>,
    /// Registered reverse clients and when their registration ends
    reverse_clients: DashMap<ShortId, u32>,
    /// Eviction candidates currently being pinged
    probing: DashMap<ShortId, ()>,
}

/// Routes DHT traffic from the local node without keeping the DHT alive
struct DhtSubscriber(Weak<Dht>);

#[async_trait]
impl Subscriber for DhtSubscriber {
    async fn on_message(&self, from: &ShortId, data: Bytes) {
        if let Some(dht) = self.0.upgrade() {
            dht.handle_message(from, &data).await;
        }
    }

    async fn on_query(&self, from: &ShortId, data: Bytes) -> Option<Bytes> {
        let dht = self.0.upgrade()?;
        dht.handle_query(from, &data).await
    }
}

fn unexpected(response: &DhtResponse) -> DhtError {
    DhtError::InvalidMessage(format!("unexpected response {:?}", response))
}

fn secs(duration: Duration) -> u32 {
    u32::try_from(duration.as_secs()).unwrap_or(u32::MAX)
}

/// `signature` is `target`'s own signature over the request for `client`
fn check_reverse_ping(target: &DhtNode, client: ShortId, signature: &Signature) -> DhtResult<()> {
    target.check_signature()?;
    let to_sign = bincode::serialize(&ReversePingToSign { target, client })?;
    target
        .id
        .verify(&to_sign, signature)
        .map_err(|_| DhtError::InvalidSignature("reverse ping request"))
}

impl Dht {
    /// Start a DHT on `adnl` and subscribe to its queries
    pub fn new(adnl: Arc<LocalNode>, config: DhtConfig) -> DhtResult<Arc<Self>> {
        config.validate()?;
        let id = adnl.id();
        let dht = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            routing: RwLock::new(RoutingTable::new(id, config.k)),
            storage: RwLock::new(DhtStorage::new(config.max_values, config.max_value_size)),
            reverse_clients: DashMap::new(),
            probing: DashMap::new(),
            adnl,
            id,
            config,
        });
        dht.adnl.subscribe(
            Bytes::copy_from_slice(&DHT_PREFIX),
            Arc::new(DhtSubscriber(Arc::downgrade(&dht))),
        );
        info!("DHT {} ready, k={} a={}", id, dht.config.k, dht.config.a);
        Ok(dht)
    }

    pub fn id(&self) -> ShortId {
        self.id
    }

    pub fn adnl(&self) -> &Arc<LocalNode> {
        &self.adnl
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Our contact record, signed with the current address list
    pub fn signed_node(&self) -> DhtResult<DhtNode> {
        let addr_list = self.adnl.address_list();
        let version = addr_list.version;
        DhtNode::signed(self.adnl.key(), addr_list, version)
    }

    // ===== Routing =====

    /// Add a node whose record carries a valid signature.
    ///
    /// Returns whether the node is in the routing table afterwards.
    pub async fn add_node(&self, node: DhtNode) -> DhtResult<bool> {
        node.check_signature()?;
        Ok(self.insert_node(node).await)
    }

    /// Add a configured bootstrap node; its record needs no signature
    pub async fn add_bootstrap_node(&self, id: PublicKey, addr_list: AddressList) -> bool {
        self.insert_node(DhtNode::unsigned(id, addr_list)).await
    }

    async fn insert_node(&self, node: DhtNode) -> bool {
        let id = node.short_id();
        if id == self.id || node.addr_list.is_empty() {
            return false;
        }
        let entry = RemoteNode::new(node, self.config.latency_history);
        let outcome = self.routing.write().await.add(entry);
        match outcome {
            AddOutcome::Inserted => {
                debug!("Added DHT node {}", id);
                true
            }
            AddOutcome::Refreshed => true,
            AddOutcome::Full { candidate } => {
                self.spawn_probe(candidate);
                false
            }
            AddOutcome::Ignored => false,
        }
    }

    /// Ping an eviction candidate; replace it only if it does not answer
    fn spawn_probe(&self, candidate: RemoteNode) {
        let id = *candidate.id();
        if self.probing.insert(id, ()).is_some() {
            return;
        }
        let Some(dht) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match dht.ping(&candidate.node).await {
                Ok(Some(rtt)) => trace!("Eviction candidate {} alive ({:?})", id, rtt),
                _ => {
                    if dht.routing.write().await.replace_dead(&id).is_some() {
                        debug!("Evicted unresponsive DHT node {}", id);
                    }
                }
            }
            dht.probing.remove(&id);
        });
    }

    pub async fn contains_node(&self, id: &ShortId) -> bool {
        self.routing.read().await.contains(id)
    }

    pub async fn node_count(&self) -> usize {
        self.routing.read().await.len()
    }

    /// Average ping latency of a routing table entry
    pub async fn node_latency(&self, id: &ShortId) -> Option<Duration> {
        self.routing.read().await.get(id).and_then(|entry| entry.latency())
    }

    async fn record_round_trip(&self, id: &ShortId, rtt: Option<Duration>) {
        let mut routing = self.routing.write().await;
        if let Some(entry) = routing.get_mut(id) {
            entry.record_ping(rtt);
        }
        if rtt.is_some() {
            routing.touch(id);
        }
    }

    /// Signed records of the routing table entries closest to `key`
    async fn nearest_records(&self, key: &ShortId, k: u32) -> Vec<DhtNode> {
        let count = (k as usize).min(self.config.k);
        self.routing
            .read()
            .await
            .nearest(key, count)
            .into_iter()
            .map(|entry| entry.node)
            .filter(|node| node.signature.is_some())
            .collect()
    }

    // ===== Outgoing queries =====

    async fn query(&self, node: &DhtNode, request: DhtRequest) -> DhtResult<Option<DhtResponse>> {
        let id = node.short_id();
        if id == self.id {
            return Err(DhtError::InvalidMessage("query to self".into()));
        }
        let data = encode_query(&DhtQuery {
            sender: Some(self.signed_node()?),
            request,
        })?;

        let connection = self.adnl.connection(node.id, node.addr_list.clone());
        let started = Instant::now();
        let answer = match connection
            .send_query(data, self.config.jittered_timeout())
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                self.record_round_trip(&id, None).await;
                return Err(e.into());
            }
        };
        let rtt = started.elapsed();
        self.record_round_trip(&id, answer.as_ref().map(|_| rtt)).await;

        answer.map(|bytes| decode_response(&bytes)).transpose()
    }

    /// Round trip to `node`; `None` if it did not answer in time
    pub async fn ping(&self, node: &DhtNode) -> DhtResult<Option<Duration>> {
        let random_id: u64 = rand::random();
        let started = Instant::now();
        match self.query(node, DhtRequest::Ping { random_id }).await? {
            Some(DhtResponse::Pong { random_id: echoed }) if echoed == random_id => {
                Ok(Some(started.elapsed()))
            }
            Some(other) => Err(unexpected(&other)),
            None => Ok(None),
        }
    }

    pub async fn find_node(&self, node: &DhtNode, key: &ShortId) -> DhtResult<Option<Vec<DhtNode>>> {
        let request = DhtRequest::FindNode {
            key: *key,
            k: self.config.k as u32,
        };
        match self.query(node, request).await? {
            Some(DhtResponse::Nodes { nodes }) => Ok(Some(nodes)),
            Some(other) => Err(unexpected(&other)),
            None => Ok(None),
        }
    }

    pub async fn find_value(&self, node: &DhtNode, key: &ShortId) -> DhtResult<Option<ValueLookup>> {
        let request = DhtRequest::FindValue {
            key: *key,
            k: self.config.k as u32,
        };
        match self.query(node, request).await? {
            Some(DhtResponse::ValueFound { value }) => Ok(Some(ValueLookup::Found(value))),
            Some(DhtResponse::ValueNotFound { nodes }) => Ok(Some(ValueLookup::Closer(nodes))),
            Some(other) => Err(unexpected(&other)),
            None => Ok(None),
        }
    }

    /// Ask `node` to store `value`; true if it accepted
    pub async fn store_on(&self, node: &DhtNode, value: DhtValue) -> DhtResult<bool> {
        match self.query(node, DhtRequest::Store { value }).await? {
            Some(DhtResponse::Stored) => Ok(true),
            Some(DhtResponse::Rejected { reason }) => {
                debug!("Node {} refused store: {}", node.short_id(), reason);
                Ok(false)
            }
            Some(other) => Err(unexpected(&other)),
            None => Ok(false),
        }
    }

    /// The signed record `node` currently advertises for itself
    pub async fn get_signed_address_list(&self, node: &DhtNode) -> DhtResult<Option<DhtNode>> {
        match self.query(node, DhtRequest::GetSignedAddressList).await? {
            Some(DhtResponse::SignedAddressList { node: record }) => {
                if record.id != node.id {
                    return Err(DhtError::InvalidMessage(format!(
                        "{} answered with the record of {}",
                        node.short_id(),
                        record.short_id()
                    )));
                }
                record.check_signature()?;
                Ok(Some(record))
            }
            Some(other) => Err(unexpected(&other)),
            None => Ok(None),
        }
    }

    /// Register with `node` so others can reach us through it until `ttl`
    pub async fn register_reverse_connection(&self, node: &DhtNode, ttl: u32) -> DhtResult<bool> {
        let to_sign = bincode::serialize(&RegisterReverseToSign {
            node: self.id,
            dht_id: node.short_id(),
            ttl,
        })?;
        let request = DhtRequest::RegisterReverseConnection {
            node: *self.adnl.public_key(),
            ttl,
            signature: self.adnl.key().sign(&to_sign),
        };
        match self.query(node, request).await? {
            Some(DhtResponse::Stored) => Ok(true),
            Some(DhtResponse::Rejected { reason }) => {
                debug!("Node {} refused reverse registration: {}", node.short_id(), reason);
                Ok(false)
            }
            Some(other) => Err(unexpected(&other)),
            None => Ok(false),
        }
    }

    /// Ask `via` to make its registered `client` ping us
    pub async fn request_reverse_ping(
        &self,
        via: &DhtNode,
        client: ShortId,
    ) -> DhtResult<Option<ReversePing>> {
        let target = self.signed_node()?;
        let to_sign = bincode::serialize(&ReversePingToSign {
            target: &target,
            client,
        })?;
        let request = DhtRequest::RequestReversePing {
            signature: self.adnl.key().sign(&to_sign),
            target,
            client,
            k: self.config.k as u32,
        };
        match self.query(via, request).await? {
            Some(DhtResponse::ReversePingOk) => Ok(Some(ReversePing::Sent)),
            Some(DhtResponse::ClientNotFound { nodes }) => Ok(Some(ReversePing::ClientNotFound(nodes))),
            Some(DhtResponse::Rejected { reason }) => Err(DhtError::InvalidMessage(reason)),
            Some(other) => Err(unexpected(&other)),
            None => Ok(None),
        }
    }

    // ===== Lookups =====

    /// Look up the value stored under `key`.
    ///
    /// Checks local storage first, then runs a beam search: every node in
    /// the beam is asked in parallel and the first valid value wins. Nodes
    /// learned from the answers form the next beam.
    pub async fn get(&self, key: &ShortId) -> DhtResult<Option<DhtValue>> {
        if let Some(value) = self.local_value(key).await {
            return Ok(Some(value));
        }

        let mut visited = HashSet::from([self.id]);
        let mut beam: Vec<DhtNode> = self
            .routing
            .read()
            .await
            .nearest(key, 2 * self.config.k)
            .into_iter()
            .map(|entry| entry.node)
            .collect();
        visited.extend(beam.iter().map(DhtNode::short_id));

        let mut round = 0;
        while !beam.is_empty() {
            round += 1;
            trace!("Lookup {} round {}: {} nodes", key, round, beam.len());

            let mut closer = Vec::new();
            {
                let mut replies: FuturesUnordered<_> = beam
                    .iter()
                    .map(|node| async move { (node.short_id(), self.find_value(node, key).await) })
                    .collect();

                while let Some((from, reply)) = replies.next().await {
                    match reply {
                        Ok(Some(ValueLookup::Found(value))) => {
                            if value.key_hash() != *key {
                                warn!("Node {} answered {} with a value for {}", from, key, value.key_hash());
                                continue;
                            }
                            match value.check(unix_now(), self.config.max_value_size) {
                                Ok(()) => {
                                    self.cache_value(value.clone()).await;
                                    return Ok(Some(value));
                                }
                                Err(e) => warn!("Node {} returned invalid value for {}: {}", from, key, e),
                            }
                        }
                        Ok(Some(ValueLookup::Closer(nodes))) => {
                            for node in nodes {
                                let id = node.short_id();
                                if !visited.insert(id) {
                                    continue;
                                }
                                match self.add_node(node.clone()).await {
                                    Ok(_) => closer.push(node),
                                    Err(e) => debug!("Ignoring node {} from {}: {}", id, from, e),
                                }
                            }
                        }
                        Ok(None) => trace!("No answer from {} for {}", from, key),
                        Err(e) => debug!("FindValue {} on {} failed: {}", key, from, e),
                    }
                }
            }

            closer.sort_by_key(|node| key.distance(&node.short_id()));
            closer.truncate(2 * self.config.a);
            beam = closer;
        }

        debug!("Value {} not found after {} rounds", key, round);
        Ok(None)
    }

    async fn cache_value(&self, value: DhtValue) {
        let key = value.key_hash();
        if let Err(e) = self.storage.write().await.store(value, unix_now()) {
            trace!("Not caching {}: {}", key, e);
        }
    }

    /// Live value under `key` in local storage
    pub async fn local_value(&self, key: &ShortId) -> Option<DhtValue> {
        self.storage.read().await.get(key, unix_now()).cloned()
    }

    /// Iterative node lookup: the `k` closest nodes to `key` that answered
    pub async fn find_nodes(&self, key: &ShortId) -> Vec<DhtNode> {
        let k = self.config.k;
        let mut candidates: BTreeMap<[u8; 32], DhtNode> = self
            .routing
            .read()
            .await
            .nearest(key, k)
            .into_iter()
            .map(|entry| (key.distance(entry.id()), entry.node))
            .collect();
        let mut queried = HashSet::from([self.id]);
        let mut result: BTreeMap<[u8; 32], DhtNode> = BTreeMap::new();

        loop {
            let mut batch = Vec::with_capacity(self.config.a);
            while batch.len() < self.config.a {
                let Some((distance, node)) = candidates.pop_first() else {
                    break;
                };
                if queried.insert(node.short_id()) {
                    batch.push((distance, node));
                }
            }
            if batch.is_empty() {
                break;
            }

            let mut replies: FuturesUnordered<_> = batch
                .into_iter()
                .map(|(distance, node)| async move {
                    let reply = self.find_node(&node, key).await;
                    (distance, node, reply)
                })
                .collect();

            while let Some((distance, node, reply)) = replies.next().await {
                let found = match reply {
                    Ok(Some(found)) => found,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("FindNode {} on {} failed: {}", key, node.short_id(), e);
                        continue;
                    }
                };
                result.insert(distance, node);
                for candidate in found {
                    let id = candidate.short_id();
                    if queried.contains(&id) || candidate.check_signature().is_err() {
                        continue;
                    }
                    self.insert_node(candidate.clone()).await;
                    candidates.insert(key.distance(&id), candidate);
                }
            }

            while result.len() > k {
                result.pop_last();
            }
            // Only candidates closer than the current k-th result can improve it
            if result.len() == k {
                if let Some(kth) = result.keys().next_back().copied() {
                    candidates.retain(|distance, _| *distance < kth);
                }
            }
        }

        result.into_values().collect()
    }

    /// Store `value` locally and on the `k` nodes closest to its key.
    ///
    /// Returns the number of remote nodes that accepted it.
    pub async fn set(&self, value: DhtValue) -> DhtResult<usize> {
        let key = value.key_hash();
        self.storage
            .write()
            .await
            .store_owned(value.clone(), unix_now())?;

        let nodes = self.find_nodes(&key).await;
        let stored = stream::iter(nodes)
            .map(|node| {
                let value = value.clone();
                async move { self.store_on(&node, value).await }
            })
            .buffer_unordered(self.config.a)
            .filter(|result| future::ready(matches!(result, Ok(true))))
            .count()
            .await;

        debug!("Stored {} on {} nodes", key, stored);
        Ok(stored)
    }

    // ===== Addresses =====

    /// Publish our address list under `(own id, "address", 0)`
    pub async fn publish_address(&self) -> DhtResult<usize> {
        let key = self.adnl.key();
        let description =
            DhtKeyDescription::signed(DhtKey::address(self.id), key, UpdateRule::Signature)?;
        let ttl = unix_now().saturating_add(secs(self.config.address_ttl));
        let addr_list = self.adnl.address_list().to_bytes();
        let mut value = DhtValue::new(description, addr_list.to_vec(), ttl);
        value.sign(key)?;

        let stored = self.set(value).await?;
        info!("Published address list of {} to {} nodes", self.id, stored);
        Ok(stored)
    }

    /// Key and address list published by `id`
    pub async fn resolve_address(&self, id: &ShortId) -> DhtResult<Option<(PublicKey, AddressList)>> {
        let Some(value) = self.get(&DhtKey::address(*id).hash()).await? else {
            return Ok(None);
        };
        let key = *value
            .description
            .owner
            .public_key()
            .ok_or_else(|| DhtError::InvalidValue("address record without owner key".into()))?;
        if key.short_id() != *id {
            return Err(DhtError::InvalidValue(format!(
                "address record of {} owned by {}",
                id,
                key.short_id()
            )));
        }
        let addr_list = AddressList::from_bytes(Bytes::from(value.value))?;
        Ok(Some((key, addr_list)))
    }

    // ===== Incoming traffic =====

    async fn handle_query(&self, from: &ShortId, data: &[u8]) -> Option<Bytes> {
        let query = match decode_query(data) {
            Ok(query) => query,
            Err(e) => {
                debug!("Malformed DHT query from {}: {}", from, e);
                return None;
            }
        };

        if let Some(sender) = query.sender {
            if sender.short_id() == *from {
                if let Err(e) = self.add_node(sender).await {
                    debug!("Sender record of {} rejected: {}", from, e);
                }
            } else {
                warn!("Query from {} carries the record of {}", from, sender.short_id());
            }
        }

        let response = match self.process_request(from, query.request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("DHT query from {} failed: {}", from, e);
                return None;
            }
        };
        match encode_response(&response) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to encode DHT response: {}", e);
                None
            }
        }
    }

    async fn process_request(&self, from: &ShortId, request: DhtRequest) -> DhtResult<DhtResponse> {
        let response = match request {
            DhtRequest::Ping { random_id } => DhtResponse::Pong { random_id },

            DhtRequest::Store { value } => {
                let key = value.key_hash();
                match self.storage.write().await.store(value, unix_now()) {
                    Ok(changed) => {
                        trace!("Store {} from {}, changed: {}", key, from, changed);
                        DhtResponse::Stored
                    }
                    Err(e) => {
                        debug!("Refused store {} from {}: {}", key, from, e);
                        DhtResponse::Rejected {
                            reason: e.to_string(),
                        }
                    }
                }
            }

            DhtRequest::FindNode { key, k } => DhtResponse::Nodes {
                nodes: self.nearest_records(&key, k).await,
            },

            DhtRequest::FindValue { key, k } => match self.local_value(&key).await {
                Some(value) => DhtResponse::ValueFound { value },
                None => DhtResponse::ValueNotFound {
                    nodes: self.nearest_records(&key, k).await,
                },
            },

            DhtRequest::GetSignedAddressList => DhtResponse::SignedAddressList {
                node: self.signed_node()?,
            },

            DhtRequest::RegisterReverseConnection {
                node,
                ttl,
                signature,
            } => self.register_client(from, node, ttl, &signature)?,

            DhtRequest::RequestReversePing {
                target,
                signature,
                client,
                k,
            } => self.forward_reverse_ping(target, signature, client, k).await?,
        };
        Ok(response)
    }

    fn register_client(
        &self,
        from: &ShortId,
        node: PublicKey,
        ttl: u32,
        signature: &Signature,
    ) -> DhtResult<DhtResponse> {
        let id = node.short_id();
        if id != *from {
            return Ok(DhtResponse::Rejected {
                reason: format!("{} cannot register {}", from, id),
            });
        }
        let now = unix_now();
        if ttl <= now {
            return Ok(DhtResponse::Rejected {
                reason: format!("registration ended at {}", ttl),
            });
        }
        let to_sign = bincode::serialize(&RegisterReverseToSign {
            node: id,
            dht_id: self.id,
            ttl,
        })?;
        if node.verify(&to_sign, signature).is_err() {
            return Ok(DhtResponse::Rejected {
                reason: "bad registration signature".into(),
            });
        }

        let expires = ttl.min(now.saturating_add(secs(self.config.max_reverse_ttl)));
        self.reverse_clients.insert(id, expires);
        debug!("Reverse client {} registered until {}", id, expires);
        Ok(DhtResponse::Stored)
    }

    async fn forward_reverse_ping(
        &self,
        target: DhtNode,
        signature: Signature,
        client: ShortId,
        k: u32,
    ) -> DhtResult<DhtResponse> {
        if let Err(e) = check_reverse_ping(&target, client, &signature) {
            return Ok(DhtResponse::Rejected {
                reason: e.to_string(),
            });
        }

        let now = unix_now();
        let registered = self
            .reverse_clients
            .get(&client)
            .map_or(false, |expires| *expires >= now);
        let connection = if registered {
            self.adnl.get_connection(&client)
        } else {
            None
        };
        let Some(connection) = connection else {
            return Ok(DhtResponse::ClientNotFound {
                nodes: self.nearest_records(&client, k).await,
            });
        };

        let requester = target.short_id();
        let message = encode_message(&DhtMessage::ReversePingCont {
            target,
            signature,
            client,
        })?;
        connection.send_custom(message).await?;
        debug!("Asked reverse client {} to ping {}", client, requester);
        Ok(DhtResponse::ReversePingOk)
    }

    async fn handle_message(&self, from: &ShortId, data: &[u8]) {
        let message = match decode_message(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Malformed DHT message from {}: {}", from, e);
                return;
            }
        };

        match message {
            DhtMessage::ReversePingCont {
                target,
                signature,
                client,
            } => {
                if client != self.id {
                    debug!("Reverse ping for {} relayed to us by {}", client, from);
                    return;
                }
                if let Err(e) = check_reverse_ping(&target, client, &signature) {
                    warn!("Invalid reverse ping relayed by {}: {}", from, e);
                    return;
                }
                let Some(dht) = self.this.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let requester = target.short_id();
                    match dht.ping(&target).await {
                        Ok(Some(rtt)) => debug!("Reverse ping to {} answered in {:?}", requester, rtt),
                        Ok(None) => debug!("Reverse ping to {} timed out", requester),
                        Err(e) => debug!("Reverse ping to {} failed: {}", requester, e),
                    }
                });
            }
        }
    }

    // ===== Maintenance =====

    /// Ping every node not pinged within the ping TTL, one at a time.
    ///
    /// Nodes that failed every ping in their history are replaced.
    pub async fn ping_sweep(&self) -> usize {
        let due: Vec<DhtNode> = self
            .routing
            .read()
            .await
            .iter()
            .filter(|entry| entry.needs_ping(self.config.ping_ttl))
            .map(|entry| entry.node.clone())
            .collect();

        let mut pinged = 0;
        for node in due {
            let id = node.short_id();
            let alive = match self.ping(&node).await {
                Ok(rtt) => rtt.is_some(),
                Err(e) => {
                    trace!("Ping {} failed: {}", id, e);
                    false
                }
            };
            pinged += 1;

            if !alive {
                let mut routing = self.routing.write().await;
                let dead = routing
                    .get(&id)
                    .map_or(false, |entry| entry.is_dead(self.config.latency_history));
                if dead && routing.replace_dead(&id).is_some() {
                    debug!("Dropped dead DHT node {}", id);
                }
            }

            if !self.config.ping_spacing.is_zero() {
                tokio::time::sleep(self.config.ping_spacing).await;
            }
        }
        pinged
    }

    /// Drop expired values, registrations and idle connections
    pub async fn cleanup(&self) {
        let now = unix_now();
        let values = self.storage.write().await.cleanup(now);
        let before = self.reverse_clients.len();
        self.reverse_clients.retain(|_, expires| *expires >= now);
        let clients = before - self.reverse_clients.len();
        let connections = self.adnl.purge_expired();
        if values + clients + connections > 0 {
            debug!(
                "Cleanup: {} values, {} reverse clients, {} connections",
                values, clients, connections
            );
        }
    }

    /// Store our own republishable values on the network again
    pub async fn republish(&self) -> usize {
        let values = self.storage.read().await.republishable(unix_now());
        let mut republished = 0;
        for value in values {
            let key = value.key_hash();
            match self.set(value).await {
                Ok(_) => republished += 1,
                Err(e) => debug!("Republish of {} failed: {}", key, e),
            }
        }
        republished
    }

    /// Run ping sweeps, cleanup and republishing in the background.
    ///
    /// The task ends once the DHT is dropped.
    pub fn start_maintenance(&self) -> JoinHandle<()> {
        let dht = self.this.clone();
        let interval = self.config.maintenance_interval;
        let republish_interval = self.config.republish_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_republish = Instant::now();
            loop {
                ticker.tick().await;
                let Some(dht) = dht.upgrade() else {
                    break;
                };
                let pinged = dht.ping_sweep().await;
                trace!("Ping sweep covered {} nodes", pinged);
                dht.cleanup().await;
                if last_republish.elapsed() >= republish_interval {
                    let count = dht.republish().await;
                    debug!("Republished {} values", count);
                    last_republish = Instant::now();
                }
            }
            debug!("DHT maintenance stopped");
        })
    }

    /// Look ourselves up to fill the routing table around our id
    pub async fn bootstrap(&self) -> usize {
        let near = self.find_nodes(&self.id).await;
        let known = self.node_count().await;
        info!(
            "DHT bootstrap: {} nodes near us, {} in routing table",
            near.len(),
            known
        );
        known
    }

    pub async fn stats(&self) -> DhtStats {
        DhtStats {
            nodes: self.routing.read().await.len(),
            values: self.storage.read().await.len(),
            reverse_clients: self.reverse_clients.len(),
            connections: self.adnl.connection_count(),
        }
    }
}

#[async_trait]
impl AddressResolver for Dht {
    async fn resolve(&self, id: &ShortId) -> Option<(PublicKey, AddressList)> {
        match self.resolve_address(id).await {
            Ok(found) => found,
            Err(e) => {
                debug!("Address lookup for {} failed: {}", id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonmesh_adnl::{AdnlConfig, LoopbackNetwork};
    use tonmesh_crypto::PrivateKey;

    fn test_config() -> DhtConfig {
        DhtConfig {
            query_timeout: Duration::from_millis(400),
            query_jitter: Duration::from_millis(50),
            ping_spacing: Duration::ZERO,
            ..Default::default()
        }
    }

    fn spawn_with(network: &Arc<LoopbackNetwork>, key: PrivateKey, config: DhtConfig) -> Arc<Dht> {
        let (transport, rx) = network.endpoint();
        let address = transport.address();
        let adnl = LocalNode::new(key, transport, vec![address], AdnlConfig::default()).unwrap();
        adnl.start(rx);
        Dht::new(adnl, config).unwrap()
    }

    fn spawn(network: &Arc<LoopbackNetwork>) -> Arc<Dht> {
        spawn_with(network, PrivateKey::generate(), test_config())
    }

    /// A knows B, B knows C
    async fn chain(network: &Arc<LoopbackNetwork>) -> (Arc<Dht>, Arc<Dht>, Arc<Dht>) {
        let (a, b, c) = (spawn(network), spawn(network), spawn(network));
        assert!(a.add_node(b.signed_node().unwrap()).await.unwrap());
        assert!(b.add_node(c.signed_node().unwrap()).await.unwrap());
        (a, b, c)
    }

    fn signed_value(owner: &PrivateKey, name: &str, payload: &[u8]) -> DhtValue {
        let description = DhtKeyDescription::signed(
            DhtKey::new(owner.short_id(), name, 0).unwrap(),
            owner,
            UpdateRule::Signature,
        )
        .unwrap();
        let mut value = DhtValue::new(description, payload.to_vec(), unix_now() + 600);
        value.sign(owner).unwrap();
        value
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_ping_records_latency() {
        let network = LoopbackNetwork::new();
        let a = spawn(&network);
        let b = spawn(&network);
        let b_node = b.signed_node().unwrap();
        a.add_node(b_node.clone()).await.unwrap();

        let rtt = a.ping(&b_node).await.unwrap();
        assert!(rtt.is_some());
        assert!(a.node_latency(&b.id()).await.is_some());

        // B learned A from the query envelope
        assert!(b.contains_node(&a.id()).await);
    }

    #[tokio::test]
    async fn test_unsigned_records_rejected() {
        let network = LoopbackNetwork::new();
        let a = spawn(&network);
        let b = spawn(&network);

        let bare = DhtNode::unsigned(*b.adnl().public_key(), b.adnl().address_list());
        assert!(a.add_node(bare).await.is_err());
        assert!(!a.contains_node(&b.id()).await);

        // Configured bootstrap nodes are trusted without a signature
        assert!(
            a.add_bootstrap_node(*b.adnl().public_key(), b.adnl().address_list())
                .await
        );
        assert!(a.ping(&DhtNode::unsigned(*b.adnl().public_key(), b.adnl().address_list()))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_get_walks_the_chain() {
        let network = LoopbackNetwork::new();
        let (a, _b, c) = chain(&network).await;

        let owner = PrivateKey::generate();
        let value = signed_value(&owner, "greeting", b"hello");
        let key = value.key_hash();
        c.storage.write().await.store(value, unix_now()).unwrap();

        let found = a.get(&key).await.unwrap().unwrap();
        assert_eq!(found.value, b"hello");
        // A learned C on the way and cached the value
        assert!(a.contains_node(&c.id()).await);
        assert!(a.local_value(&key).await.is_some());

        assert!(a.get(&ShortId::random()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_skips_expired_values() {
        let network = LoopbackNetwork::new();
        let (a, _b, c) = chain(&network).await;

        let owner = PrivateKey::generate();
        let mut value = signed_value(&owner, "short-lived", b"soon gone");
        value.ttl = unix_now() + 1;
        value.sign(&owner).unwrap();
        let key = value.key_hash();
        c.storage.write().await.store(value.clone(), unix_now()).unwrap();
        a.storage.write().await.store(value, unix_now()).unwrap();
        assert!(a.local_value(&key).await.is_some());

        tokio::time::sleep(Duration::from_millis(2100)).await;

        // Both copies are still held, neither is returned
        assert_eq!(a.storage.read().await.len(), 1);
        assert_eq!(c.storage.read().await.len(), 1);
        assert!(a.get(&key).await.unwrap().is_none());
        assert!(a.local_value(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_set_replicates() {
        let network = LoopbackNetwork::new();
        let (a, b, c) = chain(&network).await;

        let value = signed_value(a.adnl().key(), "profile", b"data");
        let key = value.key_hash();
        let stored = a.set(value).await.unwrap();
        assert_eq!(stored, 2);

        assert!(a.local_value(&key).await.is_some());
        assert!(b.local_value(&key).await.is_some());
        assert!(c.local_value(&key).await.is_some());
        assert_eq!(a.storage.read().await.republishable(unix_now()).len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_store_refused() {
        let network = LoopbackNetwork::new();
        let a = spawn(&network);
        let b = spawn(&network);
        let b_node = b.signed_node().unwrap();

        let mut forged = signed_value(a.adnl().key(), "profile", b"data");
        forged.value = b"tampered".to_vec();
        assert!(!a.store_on(&b_node, forged.clone()).await.unwrap());
        assert!(b.local_value(&forged.key_hash()).await.is_none());
        assert!(a.set(forged).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_and_resolve_address() {
        let network = LoopbackNetwork::new();
        let (a, b, c) = chain(&network).await;
        assert!(c.add_node(b.signed_node().unwrap()).await.unwrap());

        assert!(c.publish_address().await.unwrap() >= 1);

        let (key, addr_list) = a.resolve_address(&c.id()).await.unwrap().unwrap();
        assert_eq!(key, *c.adnl().public_key());
        assert_eq!(addr_list.addresses, c.adnl().address_list().addresses);

        let connection = a
            .adnl()
            .resolve_connection(&c.id(), a.as_ref())
            .await
            .unwrap();
        assert_eq!(connection.remote_id(), c.id());

        assert!(a.resolve_address(&ShortId::random()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signed_address_list() {
        let network = LoopbackNetwork::new();
        let a = spawn(&network);
        let b = spawn(&network);
        let b_node = b.signed_node().unwrap();

        let record = a.get_signed_address_list(&b_node).await.unwrap().unwrap();
        assert_eq!(record.id, *b.adnl().public_key());
        assert!(record.check_signature().is_ok());
    }

    #[tokio::test]
    async fn test_reverse_ping() {
        let network = LoopbackNetwork::new();
        let requester = spawn(&network);
        let relay = spawn(&network);
        let client = spawn(&network);
        let relay_node = relay.signed_node().unwrap();

        // Not registered yet
        let outcome = requester
            .request_reverse_ping(&relay_node, client.id())
            .await
            .unwrap();
        assert!(matches!(outcome, Some(ReversePing::ClientNotFound(_))));

        assert!(client
            .register_reverse_connection(&relay_node, unix_now() + 600)
            .await
            .unwrap());
        assert_eq!(relay.stats().await.reverse_clients, 1);

        let outcome = requester
            .request_reverse_ping(&relay_node, client.id())
            .await
            .unwrap();
        assert!(matches!(outcome, Some(ReversePing::Sent)));

        // The client pings the requester, which learns it from the envelope
        let client_id = client.id();
        wait_for(|| {
            let requester = requester.clone();
            async move { requester.contains_node(&client_id).await }
        })
        .await;
    }

    #[tokio::test]
    async fn test_expired_registration_refused() {
        let network = LoopbackNetwork::new();
        let relay = spawn(&network);
        let client = spawn(&network);
        let relay_node = relay.signed_node().unwrap();

        assert!(!client
            .register_reverse_connection(&relay_node, unix_now() - 1)
            .await
            .unwrap());
        assert_eq!(relay.stats().await.reverse_clients, 0);
    }

    /// A key whose id lands in the top bucket of `local`
    fn key_in_top_bucket(local: &ShortId) -> PrivateKey {
        loop {
            let key = PrivateKey::generate();
            if local.leading_zeros(&key.short_id()) == 0 {
                return key;
            }
        }
    }

    #[tokio::test]
    async fn test_full_bucket_evicts_only_dead_nodes() {
        let network = LoopbackNetwork::new();
        let config = DhtConfig {
            k: 1,
            a: 1,
            ..test_config()
        };
        let a = spawn_with(&network, PrivateKey::generate(), config);
        let resident = spawn_with(&network, key_in_top_bucket(&a.id()), test_config());
        let newcomer = spawn_with(&network, key_in_top_bucket(&a.id()), test_config());

        assert!(a.add_node(resident.signed_node().unwrap()).await.unwrap());

        // Resident answers the probe and stays
        assert!(!a.add_node(newcomer.signed_node().unwrap()).await.unwrap());
        wait_for(|| {
            let a = a.clone();
            async move { a.probing.is_empty() }
        })
        .await;
        assert!(a.contains_node(&resident.id()).await);
        assert!(!a.contains_node(&newcomer.id()).await);

        // Once it is gone, the newest replacement takes its place
        network.disconnect(&resident.adnl().address_list().addresses[0]);
        a.add_node(newcomer.signed_node().unwrap()).await.unwrap();
        let (resident_id, newcomer_id) = (resident.id(), newcomer.id());
        wait_for(|| {
            let a = a.clone();
            async move { a.contains_node(&newcomer_id).await }
        })
        .await;
        assert!(!a.contains_node(&resident_id).await);
    }

    #[tokio::test]
    async fn test_ping_sweep_drops_dead_nodes() {
        let network = LoopbackNetwork::new();
        let config = DhtConfig {
            latency_history: 1,
            ping_ttl: Duration::ZERO,
            ..test_config()
        };
        let a = spawn_with(&network, PrivateKey::generate(), config);
        let b = spawn(&network);
        let c = spawn(&network);
        a.add_node(b.signed_node().unwrap()).await.unwrap();
        a.add_node(c.signed_node().unwrap()).await.unwrap();

        network.disconnect(&c.adnl().address_list().addresses[0]);
        assert_eq!(a.ping_sweep().await, 2);
        assert!(a.contains_node(&b.id()).await);
        assert!(!a.contains_node(&c.id()).await);
    }

    #[tokio::test]
    async fn test_bootstrap_fills_routing_table() {
        let network = LoopbackNetwork::new();
        let (a, _b, c) = chain(&network).await;
        assert_eq!(a.node_count().await, 1);
        let known = a.bootstrap().await;
        assert_eq!(known, 2);
        assert!(a.contains_node(&c.id()).await);
    }
}
