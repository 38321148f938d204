//! Local node
//!
//! Owns the long-term key, the transport and every connection. Inbound
//! datagrams are routed by their destination id: a registered channel id
//! decrypts with that channel, our own id decrypts with the identity key.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonmesh_crypto::{PrivateKey, PublicKey, ShortId};
use tracing::{debug, info, trace};

use crate::address::{Address, AddressList};
use crate::cache::TtlCache;
use crate::codec::Decode;
use crate::config::AdnlConfig;
use crate::connection::Connection;
use crate::error::{AdnlError, AdnlResult};
use crate::packet::Packet;
use crate::transport::{Datagram, Transport};
use crate::unix_now;

/// Receives application traffic for a message prefix
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// One-way custom message
    async fn on_message(&self, _from: &ShortId, _data: Bytes) {}

    /// Query; returning `None` leaves it unanswered
    async fn on_query(&self, _from: &ShortId, _data: Bytes) -> Option<Bytes> {
        None
    }
}

/// Finds the key and addresses of a peer known only by its short id
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, id: &ShortId) -> Option<(PublicKey, AddressList)>;
}

/// This process's ADNL identity
pub struct LocalNode {
    key: PrivateKey,
    public_key: PublicKey,
    id: ShortId,
    reinit_date: u32,
    config: AdnlConfig,
    transport: Arc<dyn Transport>,
    address_list: RwLock<AddressList>,
    connections: TtlCache<ShortId, Arc<Connection>>,
    channels: TtlCache<ShortId, Arc<Connection>>,
    subscribers: RwLock<Vec<(Bytes, Arc<dyn Subscriber>)>>,
}

impl LocalNode {
    /// Create a node that advertises `addresses`
    pub fn new(
        key: PrivateKey,
        transport: Arc<dyn Transport>,
        addresses: Vec<Address>,
        config: AdnlConfig,
    ) -> AdnlResult<Arc<Self>> {
        config.validate()?;

        let public_key = key.public_key();
        let id = public_key.short_id();
        let reinit_date = unix_now();
        let address_list = AddressList::new(addresses, reinit_date as i32, reinit_date);
        info!("Local node {} started at {}", id, reinit_date);

        Ok(Arc::new(Self {
            key,
            public_key,
            id,
            reinit_date,
            connections: TtlCache::new(config.max_connections, config.connection_ttl),
            channels: TtlCache::new(config.max_connections, config.channel_ttl),
            config,
            transport,
            address_list: RwLock::new(address_list),
            subscribers: RwLock::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> ShortId {
        self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Long-term identity key, for layers that sign their own records
    pub fn key(&self) -> &PrivateKey {
        &self.key
    }

    pub fn reinit_date(&self) -> u32 {
        self.reinit_date
    }

    pub fn config(&self) -> &AdnlConfig {
        &self.config
    }

    /// Addresses we advertise
    pub fn address_list(&self) -> AddressList {
        self.address_list
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the advertised addresses, bumping the list version
    pub fn set_addresses(&self, addresses: Vec<Address>) {
        let mut list = self
            .address_list
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let version = (unix_now() as i32).max(list.version + 1);
        *list = AddressList::new(addresses, version, self.reinit_date);
        debug!("Advertising {} addresses, version {}", list.addresses.len(), version);
    }

    /// Route messages whose payload starts with `prefix` to `subscriber`.
    ///
    /// The first matching subscriber in registration order wins.
    pub fn subscribe(&self, prefix: impl Into<Bytes>, subscriber: Arc<dyn Subscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((prefix.into(), subscriber));
    }

    fn subscriber_for(&self, data: &[u8]) -> Option<Arc<dyn Subscriber>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(prefix, _)| data.starts_with(prefix))
            .map(|(_, subscriber)| subscriber.clone())
    }

    pub(crate) async fn deliver_message(&self, from: &ShortId, data: Bytes) {
        match self.subscriber_for(&data) {
            Some(subscriber) => subscriber.on_message(from, data).await,
            None => trace!("No subscriber for message from {}", from),
        }
    }

    pub(crate) async fn answer_query(&self, from: &ShortId, data: Bytes) -> Option<Bytes> {
        match self.subscriber_for(&data) {
            Some(subscriber) => subscriber.on_query(from, data).await,
            None => {
                trace!("No subscriber for query from {}", from);
                None
            }
        }
    }

    /// Connection to `remote_key`, created if missing.
    ///
    /// A known connection keeps its state; `address_list` is merged in
    /// if it is newer than what we have.
    pub fn connection(self: &Arc<Self>, remote_key: PublicKey, address_list: AddressList) -> Arc<Connection> {
        let id = remote_key.short_id();
        let connection = self.connections.get_or_insert_with(id, || {
            trace!("New connection to {}", id);
            Arc::new(Connection::new(self, remote_key, address_list.clone()))
        });
        connection.update_address_list(&address_list);
        connection
    }

    pub fn get_connection(&self, id: &ShortId) -> Option<Arc<Connection>> {
        self.connections.get(id)
    }

    /// Connection to `id`, asking `resolver` for its key and addresses if needed
    pub async fn resolve_connection(
        self: &Arc<Self>,
        id: &ShortId,
        resolver: &dyn AddressResolver,
    ) -> AdnlResult<Arc<Connection>> {
        if let Some(connection) = self.get_connection(id) {
            if !connection.address_list().is_empty() {
                return Ok(connection);
            }
        }
        let (key, address_list) = resolver
            .resolve(id)
            .await
            .ok_or(AdnlError::NoAddress(*id))?;
        if key.short_id() != *id {
            return Err(AdnlError::UnknownSource);
        }
        Ok(self.connection(key, address_list))
    }

    /// Forget a peer entirely
    pub fn remove_connection(&self, id: &ShortId) -> Option<Arc<Connection>> {
        let connection = self.connections.remove(id)?;
        if let Some(channel) = connection.channel() {
            self.channels.remove(&channel.input_id());
        }
        Some(connection)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn register_channel(&self, input_id: ShortId, connection: Arc<Connection>) {
        self.channels.insert(input_id, connection);
    }

    pub(crate) fn unregister_channel(&self, input_id: &ShortId) {
        self.channels.remove(input_id);
    }

    /// Connection owning the channel with `input_id`
    pub fn connection_by_channel(&self, input_id: &ShortId) -> Option<Arc<Connection>> {
        self.channels.get(input_id).or_else(|| {
            // The index entry may have expired while the connection lives on
            let connection = self.connections.find(|c| {
                c.channel()
                    .map_or(false, |channel| channel.input_id() == *input_id)
            })?;
            self.channels.insert(*input_id, connection.clone());
            Some(connection)
        })
    }

    /// Drop idle connections and stale channel index entries
    pub fn purge_expired(&self) -> usize {
        self.connections.purge_expired() + self.channels.purge_expired()
    }

    pub(crate) async fn send_datagram(
        &self,
        destination: &ShortId,
        address: &Address,
        payload: Bytes,
    ) -> AdnlResult<()> {
        self.transport.send(destination, address, payload).await
    }

    /// Decrypt and dispatch one inbound datagram
    pub async fn handle_datagram(self: &Arc<Self>, datagram: Datagram) -> AdnlResult<()> {
        let Datagram {
            destination,
            source,
            payload,
        } = datagram;

        if let Some(connection) = self.connection_by_channel(&destination) {
            let channel = connection
                .channel()
                .filter(|c| c.input_id() == destination)
                .ok_or(AdnlError::UnknownDestination(destination))?;
            let plaintext = channel.decrypt(&payload)?;
            let packet = Packet::from_bytes(Bytes::from(plaintext))?;
            if let Some(from) = packet.source_id() {
                if from != connection.remote_id() {
                    return Err(AdnlError::UnknownSource);
                }
            }
            return connection
                .handle_packet(packet, Some(destination), source)
                .await;
        }

        if destination != self.id {
            return Err(AdnlError::UnknownDestination(destination));
        }

        let plaintext = self.key.decryptor().decrypt(&payload)?;
        let packet = Packet::from_bytes(Bytes::from(plaintext))?;
        packet.check_signature()?;

        let from = packet.from().copied().ok_or(AdnlError::UnknownSource)?;
        let connection = self.connection(from, AddressList::default());
        connection.handle_packet(packet, None, source).await
    }

    /// Consume datagrams from `rx`, one task per datagram
    pub fn start(self: &Arc<Self>, mut rx: mpsc::Receiver<Datagram>) -> JoinHandle<()> {
        let node = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                let Some(node) = node.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    let destination = datagram.destination;
                    if let Err(e) = node.handle_datagram(datagram).await {
                        trace!("Dropped datagram for {}: {}", destination, e);
                    }
                });
            }
            debug!("Datagram loop stopped");
        })
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("id", &self.id)
            .field("reinit_date", &self.reinit_date)
            .field("connections", &self.connections.len())
            .finish()
    }
}
