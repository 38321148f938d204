//! Per-peer sessions
//!
//! A connection owns the sequence counters, the channel handshake state,
//! the pending query table and the part reassembly cache for one remote
//! identity. Outbound packets are identity encrypted and signed until the
//! channel is ready; after that they go through the channel.

use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tonmesh_crypto::{PrivateKey, PublicKey, ShortId};
use tracing::{debug, info, trace};

use crate::address::{Address, AddressList};
use crate::channel::Channel;
use crate::codec::{Decode, Encode};
use crate::counter::PacketCounter;
use crate::error::{AdnlError, AdnlResult};
use crate::message::{Message, QueryId};
use crate::node::LocalNode;
use crate::packet::Packet;
use crate::transfer::{self, Reassembler};
use crate::{unix_now, MAX_ADNL_MESSAGE};

/// Session state with one remote identity
pub struct Connection {
    node: Weak<LocalNode>,
    local_id: ShortId,
    remote_key: PublicKey,
    remote_id: ShortId,
    address_list: RwLock<AddressList>,

    /// Ephemeral key offered in CreateChannel
    channel_key: PrivateKey,
    channel: RwLock<Option<Arc<Channel>>>,

    /// Our seqno and the peer's reinit date
    send_counter: PacketCounter,
    /// Highest seqno seen from the peer and our reinit date
    recv_counter: PacketCounter,

    queries: DashMap<QueryId, oneshot::Sender<Bytes>>,
    transfers: Reassembler,
    max_message_size: usize,
}

/// Removes a pending query when the waiting future finishes or is dropped
struct PendingQuery<'a> {
    queries: &'a DashMap<QueryId, oneshot::Sender<Bytes>>,
    query_id: QueryId,
}

impl Drop for PendingQuery<'_> {
    fn drop(&mut self) {
        self.queries.remove(&self.query_id);
    }
}

impl Connection {
    pub(crate) fn new(node: &Arc<LocalNode>, remote_key: PublicKey, address_list: AddressList) -> Self {
        let config = node.config();
        Self {
            node: Arc::downgrade(node),
            local_id: node.id(),
            remote_key,
            remote_id: remote_key.short_id(),
            address_list: RwLock::new(address_list),
            channel_key: PrivateKey::generate(),
            channel: RwLock::new(None),
            send_counter: PacketCounter::new(0),
            recv_counter: PacketCounter::new(node.reinit_date()),
            queries: DashMap::new(),
            transfers: Reassembler::new(
                config.max_transfers,
                config.transfer_ttl,
                config.max_message_size,
            ),
            max_message_size: config.max_message_size,
        }
    }

    fn node(&self) -> AdnlResult<Arc<LocalNode>> {
        self.node.upgrade().ok_or(AdnlError::NodeShutdown)
    }

    pub fn remote_id(&self) -> ShortId {
        self.remote_id
    }

    pub fn remote_key(&self) -> &PublicKey {
        &self.remote_key
    }

    pub fn address_list(&self) -> AddressList {
        self.address_list
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the peer's address list if the update moves it forward
    pub fn update_address_list(&self, update: &AddressList) -> bool {
        let mut current = self
            .address_list
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if current.is_empty() || current.accepts_update(update, unix_now()) {
            if update.is_empty() {
                return false;
            }
            trace!(
                "Address list of {} updated to version {}",
                self.remote_id,
                update.version
            );
            *current = update.clone();
            return true;
        }
        false
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_channel(&self) -> bool {
        self.channel().is_some()
    }

    /// Channel usable for output, if any
    pub fn ready_channel(&self) -> Option<Arc<Channel>> {
        self.channel().filter(|channel| channel.is_ready())
    }

    pub fn send_seqno(&self) -> u64 {
        self.send_counter.seqno()
    }

    pub fn recv_seqno(&self) -> u64 {
        self.recv_counter.seqno()
    }

    /// Reinit date we know the peer by
    pub fn peer_reinit_date(&self) -> u32 {
        self.send_counter.reinit_date()
    }

    pub fn pending_queries(&self) -> usize {
        self.queries.len()
    }

    fn set_channel(self: &Arc<Self>, channel: Channel) -> Arc<Channel> {
        let channel = Arc::new(channel);
        let old = self
            .channel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(channel.clone());

        if let Ok(node) = self.node() {
            if let Some(old) = old {
                if old.input_id() != channel.input_id() {
                    node.unregister_channel(&old.input_id());
                }
            }
            node.register_channel(channel.input_id(), self.clone());
        }
        debug!(
            "Channel with {} set up, in {} out {}",
            self.remote_id,
            channel.input_id(),
            channel.output_id()
        );
        channel
    }

    fn clear_channel(&self) {
        let old = self
            .channel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(old), Ok(node)) = (old, self.node()) {
            node.unregister_channel(&old.input_id());
        }
    }

    /// Reset the session after the peer restarted at `date`
    pub fn reinit(&self, date: u32) {
        info!("Peer {} reinitialized at {}", self.remote_id, date);
        self.send_counter.set_reinit_date(date);
        self.send_counter.reset_seqno();
        self.recv_counter.reset_seqno();
        self.clear_channel();
    }

    /// Process a decrypted packet from the peer.
    ///
    /// `via_channel` is the channel id the datagram was addressed to, if any.
    pub async fn handle_packet(
        self: &Arc<Self>,
        mut packet: Packet,
        via_channel: Option<ShortId>,
        source: Address,
    ) -> AdnlResult<()> {
        if let Some((_, dst_date)) = packet.reinit_dates() {
            let ours = self.recv_counter.reinit_date();
            if dst_date != 0 && dst_date != ours {
                return Err(AdnlError::ReinitDateMismatch {
                    date: dst_date,
                    current: ours,
                });
            }
        }
        if let Some(confirm) = packet.confirm_seqno() {
            let sent = self.send_counter.seqno();
            if confirm > sent {
                return Err(AdnlError::ConfirmSeqnoTooNew { confirm, sent });
            }
        }

        // The packet is accepted from here on
        if let Some((peer_date, _)) = packet.reinit_dates() {
            let known = self.send_counter.reinit_date();
            if known == 0 {
                self.send_counter.set_reinit_date(peer_date);
            } else if peer_date > known {
                self.reinit(peer_date);
            }
        }
        if let Some(seqno) = packet.seqno() {
            self.recv_counter.raise_seqno(seqno);
        }

        if let Some(id) = via_channel {
            if let Some(channel) = self.channel().filter(|c| c.input_id() == id) {
                if channel.mark_ready() {
                    debug!("Channel with {} is ready", self.remote_id);
                }
            }
        }

        match packet.address() {
            Some(list) => {
                self.update_address_list(list);
            }
            None => {
                if self.address_list().is_empty() && !matches!(source, Address::Reverse) {
                    self.update_address_list(&AddressList::new(vec![source], 0, 0));
                }
            }
        }

        for message in packet.take_messages() {
            let kind = message.kind();
            if let Err(e) = self.handle_message(message).await {
                debug!("Dropping {} message from {}: {}", kind, self.remote_id, e);
            }
        }
        Ok(())
    }

    /// Dispatch one message; a completed part transfer is dispatched in turn
    pub async fn handle_message(self: &Arc<Self>, message: Message) -> AdnlResult<()> {
        let node = self.node()?;
        let mut next = Some(message);
        let mut reassembled = false;

        while let Some(message) = next.take() {
            trace!("{} message from {}", message.kind(), self.remote_id);
            match message {
                Message::CreateChannel { key, date } => {
                    self.on_create_channel(key, date).await?;
                }
                Message::ConfirmChannel {
                    key,
                    peer_key,
                    date,
                } => {
                    self.on_confirm_channel(key, peer_key, date)?;
                }
                Message::Custom { data } => {
                    node.deliver_message(&self.remote_id, data).await;
                }
                Message::Query { query_id, data } => {
                    if let Some(answer) = node.answer_query(&self.remote_id, data).await {
                        self.send_message(Message::Answer {
                            query_id,
                            data: answer,
                        })
                        .await?;
                    }
                }
                Message::Answer { query_id, data } => match self.queries.remove(&query_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(data);
                    }
                    None => debug!(
                        "Answer from {} for unknown query {}",
                        self.remote_id,
                        hex::encode(&query_id[..4])
                    ),
                },
                Message::Part {
                    hash,
                    total_size,
                    offset,
                    data,
                } => {
                    if reassembled {
                        return Err(AdnlError::InvalidPart("part inside a reassembled message".into()));
                    }
                    if let Some(encoded) = self.transfers.accept(hash, total_size, offset, &data)? {
                        next = Some(Message::from_bytes(encoded)?);
                        reassembled = true;
                    }
                }
                Message::Reinit { date } => {
                    if date > self.send_counter.reinit_date() {
                        self.reinit(date);
                    }
                }
                Message::Nop => {}
            }
        }
        Ok(())
    }

    async fn on_create_channel(self: &Arc<Self>, key: PublicKey, date: u32) -> AdnlResult<()> {
        let existing = self
            .channel()
            .filter(|c| c.remote_key() == &key && c.date() == date);
        if existing.is_none() {
            self.set_channel(Channel::new(
                &self.channel_key,
                &key,
                &self.local_id,
                &self.remote_id,
                date,
            ));
        }

        let confirm = Message::ConfirmChannel {
            key: self.channel_key.public_key(),
            peer_key: key,
            date,
        };
        self.send_messages(vec![confirm]).await
    }

    fn on_confirm_channel(
        self: &Arc<Self>,
        key: PublicKey,
        peer_key: PublicKey,
        date: u32,
    ) -> AdnlResult<()> {
        if peer_key != self.channel_key.public_key() {
            return Err(AdnlError::BadChannelConfirm);
        }

        let channel = match self.channel() {
            Some(channel) if channel.date() == date && channel.remote_key() == &key => channel,
            _ => self.set_channel(Channel::new(
                &self.channel_key,
                &key,
                &self.local_id,
                &self.remote_id,
                date,
            )),
        };
        if channel.mark_ready() {
            debug!("Channel with {} confirmed", self.remote_id);
        }
        Ok(())
    }

    /// Control message that has to ride along until the channel is ready
    fn handshake_message(&self) -> Option<Message> {
        match self.channel() {
            None => Some(Message::CreateChannel {
                key: self.channel_key.public_key(),
                date: unix_now(),
            }),
            Some(channel) if !channel.is_ready() => Some(Message::ConfirmChannel {
                key: self.channel_key.public_key(),
                peer_key: *channel.remote_key(),
                date: channel.date(),
            }),
            Some(_) => None,
        }
    }

    /// Send one message, fragmenting it if it does not fit a packet
    pub async fn send_message(self: &Arc<Self>, message: Message) -> AdnlResult<()> {
        let handshake = self.handshake_message();
        let handshake_size = handshake.as_ref().map_or(0, Message::serialized_size);

        if message.serialized_size() + handshake_size <= MAX_ADNL_MESSAGE {
            let mut messages: Vec<Message> = handshake.into_iter().collect();
            messages.push(message);
            return self.send_messages(messages).await;
        }

        let encoded = message.to_bytes();
        if encoded.len() > self.max_message_size {
            return Err(AdnlError::MessageTooLarge {
                size: encoded.len(),
                max: self.max_message_size,
            });
        }
        let parts = transfer::split(&encoded, transfer::PART_SIZE);
        trace!(
            "Sending {} byte {} to {} in {} parts",
            encoded.len(),
            message.kind(),
            self.remote_id,
            parts.len()
        );
        for part in parts {
            let mut messages: Vec<Message> = self.handshake_message().into_iter().collect();
            messages.push(part);
            self.send_messages(messages).await?;
        }
        Ok(())
    }

    /// Send application data
    pub async fn send_custom(self: &Arc<Self>, data: impl Into<Bytes>) -> AdnlResult<()> {
        self.send_message(Message::Custom { data: data.into() }).await
    }

    /// Send a query and wait for its answer; `None` on timeout
    pub async fn send_query(
        self: &Arc<Self>,
        data: impl Into<Bytes>,
        timeout: Duration,
    ) -> AdnlResult<Option<Bytes>> {
        let query_id: QueryId = rand::random();
        let (tx, rx) = oneshot::channel();
        self.queries.insert(query_id, tx);
        let _pending = PendingQuery {
            queries: &self.queries,
            query_id,
        };

        self.send_message(Message::Query {
            query_id,
            data: data.into(),
        })
        .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => Ok(Some(answer)),
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                debug!("Query to {} timed out after {:?}", self.remote_id, timeout);
                Ok(None)
            }
        }
    }

    /// Build, encrypt and send one packet carrying `messages`
    async fn send_messages(&self, messages: Vec<Message>) -> AdnlResult<()> {
        let node = self.node()?;
        let address = self
            .address_list()
            .pick()
            .copied()
            .ok_or(AdnlError::NoAddress(self.remote_id))?;
        let channel = self.ready_channel();

        let mut packet = Packet::new();
        packet.set_messages(messages);
        packet.set_seqno(Some(self.send_counter.next_seqno()));
        packet.set_confirm_seqno(Some(self.recv_counter.seqno()));
        if channel.is_none() {
            packet.set_address(Some(node.address_list()));
            packet.set_reinit_dates(Some((
                self.recv_counter.reinit_date(),
                self.send_counter.reinit_date(),
            )));
            packet.sign(node.key());
        }

        let plaintext = packet.to_bytes();
        let (destination, payload) = match &channel {
            Some(channel) => (channel.output_id(), channel.encrypt(&plaintext)),
            None => (
                self.remote_id,
                self.remote_key.encryptor().encrypt(&plaintext),
            ),
        };
        trace!(
            "Sending packet {} to {} via {} ({} bytes)",
            packet.seqno().unwrap_or_default(),
            self.remote_id,
            if channel.is_some() { "channel" } else { "identity" },
            payload.len()
        );
        node.send_datagram(&destination, &address, Bytes::from(payload))
            .await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_id", &self.remote_id)
            .field("send_seqno", &self.send_seqno())
            .field("recv_seqno", &self.recv_seqno())
            .field("channel", &self.channel())
            .finish()
    }
}
