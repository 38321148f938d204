//! ADNL transport
//!
//! Encrypted, authenticated datagrams between Ed25519 identities:
//! - Identity encryption for first contact, symmetric channels afterwards
//! - Sequence numbers, reinit dates and address lists per peer
//! - Query/answer with timeouts
//! - Fragmentation of messages larger than one packet
//! - UDP and in-memory loopback transports

pub mod address;
pub mod cache;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod counter;
pub mod error;
pub mod loopback;
pub mod message;
pub mod node;
pub mod packet;
pub mod transfer;
pub mod transport;

pub use address::{Address, AddressList};
pub use channel::Channel;
pub use codec::{Decode, Encode};
pub use config::AdnlConfig;
pub use connection::Connection;
pub use error::{AdnlError, AdnlResult};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use message::{Message, QueryId};
pub use node::{AddressResolver, LocalNode, Subscriber};
pub use packet::Packet;
pub use transport::{Datagram, Transport, UdpTransport, UdpTransportBuilder};

/// Largest serialized message set that is sent without fragmentation
pub const MAX_ADNL_MESSAGE: usize = 1024;

/// Current unix time in seconds
pub fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tonmesh_crypto::{PrivateKey, ShortId};

    /// Records custom messages and echoes queries
    struct Echo {
        seen: mpsc::UnboundedSender<(ShortId, Bytes)>,
    }

    #[async_trait]
    impl Subscriber for Echo {
        async fn on_message(&self, from: &ShortId, data: Bytes) {
            let _ = self.seen.send((*from, data));
        }

        async fn on_query(&self, _from: &ShortId, data: Bytes) -> Option<Bytes> {
            let mut answer = b"re:".to_vec();
            answer.extend_from_slice(&data);
            Some(Bytes::from(answer))
        }
    }

    struct Peer {
        node: Arc<LocalNode>,
        address: Address,
        seen: mpsc::UnboundedReceiver<(ShortId, Bytes)>,
    }

    fn spawn_peer(network: &Arc<LoopbackNetwork>) -> Peer {
        let (transport, rx) = network.endpoint();
        let address = transport.address();
        let node = LocalNode::new(
            PrivateKey::generate(),
            transport,
            vec![address],
            AdnlConfig::default(),
        )
        .unwrap();
        let (tx, seen) = mpsc::unbounded_channel();
        node.subscribe(Bytes::new(), Arc::new(Echo { seen: tx }));
        node.start(rx);
        Peer {
            node,
            address,
            seen,
        }
    }

    fn connect(from: &Peer, to: &Peer) -> Arc<Connection> {
        from.node
            .connection(*to.node.public_key(), to.node.address_list())
    }

    async fn next_message(peer: &mut Peer) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), peer.seen.recv())
            .await
            .expect("message not delivered")
            .expect("subscriber dropped")
            .1
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_custom_message_opens_channel() {
        let network = LoopbackNetwork::new();
        let a = spawn_peer(&network);
        let mut b = spawn_peer(&network);

        let to_b = connect(&a, &b);
        to_b.send_custom(Bytes::from_static(b"first")).await.unwrap();
        assert_eq!(&next_message(&mut b).await[..], b"first");

        // B's ConfirmChannel makes the channel usable on A's side
        wait_until(|| to_b.ready_channel().is_some()).await;
        let output_id = to_b.ready_channel().unwrap().output_id();

        to_b.send_custom(Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(&next_message(&mut b).await[..], b"second");

        let from_a: Vec<_> = network
            .history()
            .into_iter()
            .filter(|d| d.from == a.address && d.to == b.address)
            .collect();
        assert_eq!(from_a.first().unwrap().destination, b.node.id());
        assert_eq!(from_a.last().unwrap().destination, output_id);

        // Traffic over the channel marks it ready on B's side as well
        let to_a = b.node.get_connection(&a.node.id()).unwrap();
        wait_until(|| to_a.ready_channel().is_some()).await;
        let channel = to_a.ready_channel().unwrap();
        assert_eq!(channel.input_id(), output_id);

        // Identity encryption costs 64 bytes, the channel 32
        let first = from_a.first().unwrap();
        let last = from_a.last().unwrap();
        let first_plain = b.node.key().decryptor().decrypt(&first.payload).unwrap();
        let last_plain = channel.decrypt(&last.payload).unwrap();
        let first_overhead = first.len - first_plain.len();
        let last_overhead = last.len - last_plain.len();
        assert_eq!(first_overhead, 64);
        assert_eq!(last_overhead, 32);
        assert_eq!(first_overhead - last_overhead, 32);
    }

    #[tokio::test]
    async fn test_query_answer() {
        let network = LoopbackNetwork::new();
        let a = spawn_peer(&network);
        let b = spawn_peer(&network);

        let to_b = connect(&a, &b);
        for round in 0..3 {
            let question = format!("question {}", round);
            let answer = to_b
                .send_query(question.clone(), Duration::from_secs(2))
                .await
                .unwrap()
                .expect("no answer");
            assert_eq!(answer, Bytes::from(format!("re:{}", question)));
        }
        assert_eq!(to_b.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_query_to_vanished_peer_times_out() {
        let network = LoopbackNetwork::new();
        let a = spawn_peer(&network);
        let b = spawn_peer(&network);
        network.disconnect(&b.address);

        let to_b = connect(&a, &b);
        let answer = to_b
            .send_query(Bytes::from_static(b"hello?"), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(answer.is_none());
        assert_eq!(to_b.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_large_message_is_fragmented_and_delivered_once() {
        let network = LoopbackNetwork::new();
        let a = spawn_peer(&network);
        let mut b = spawn_peer(&network);

        let payload: Vec<u8> = (0..5000).map(|i| (i % 256) as u8).collect();
        let to_b = connect(&a, &b);
        to_b.send_custom(payload.clone()).await.unwrap();

        assert_eq!(&next_message(&mut b).await[..], &payload[..]);
        let again = tokio::time::timeout(Duration::from_millis(200), b.seen.recv()).await;
        assert!(again.is_err(), "message delivered twice");

        let datagrams = network
            .history()
            .into_iter()
            .filter(|d| d.from == a.address)
            .count();
        assert!(datagrams >= 5);
    }

    #[tokio::test]
    async fn test_newer_reinit_date_resets_session() {
        let network = LoopbackNetwork::new();
        let a = spawn_peer(&network);
        let mut b = spawn_peer(&network);

        let to_b = connect(&a, &b);
        to_b.send_custom(Bytes::from_static(b"hi")).await.unwrap();
        next_message(&mut b).await;
        let to_a = b.node.get_connection(&a.node.id()).unwrap();
        let adopted = to_a.peer_reinit_date();
        assert_eq!(adopted, a.node.reinit_date());
        assert!(to_a.has_channel());

        // A newer date does not excuse a confirm seqno we never sent
        let mut bogus = Packet::new();
        bogus.set_seqno(Some(1));
        bogus.set_confirm_seqno(Some(1000));
        bogus.set_reinit_dates(Some((adopted + 10, 0)));
        let result = to_a.handle_packet(bogus, None, a.address).await;
        assert!(matches!(result, Err(AdnlError::ConfirmSeqnoTooNew { confirm: 1000, .. })));
        assert_eq!(to_a.peer_reinit_date(), adopted);
        assert!(to_a.has_channel());

        // A restarted: a newer date and nothing confirmed yet
        let mut packet = Packet::new();
        packet.set_seqno(Some(1));
        packet.set_confirm_seqno(Some(0));
        packet.set_reinit_dates(Some((adopted + 10, 0)));
        to_a.handle_packet(packet, None, a.address).await.unwrap();

        assert_eq!(to_a.peer_reinit_date(), adopted + 10);
        assert!(!to_a.has_channel());
        assert_eq!(to_a.send_seqno(), 0);
        assert_eq!(to_a.recv_seqno(), 1);

        // An older date afterwards is ignored
        let mut stale = Packet::new();
        stale.set_reinit_dates(Some((adopted, 0)));
        to_a.handle_packet(stale, None, a.address).await.unwrap();
        assert_eq!(to_a.peer_reinit_date(), adopted + 10);
    }

    #[tokio::test]
    async fn test_forged_datagrams_are_dropped() {
        let network = LoopbackNetwork::new();
        let b = spawn_peer(&network);
        let mallory = PrivateKey::generate();
        let victim = PrivateKey::generate();
        let source = Address::Udp { ip: 1, port: 1 };

        let seal = |packet: &Packet| {
            Bytes::from(b.node.public_key().encryptor().encrypt(&packet.to_bytes()))
        };
        let datagram = |payload: Bytes| Datagram {
            destination: b.node.id(),
            source,
            payload,
        };

        // Signed by one key, claiming to be another
        let mut packet = Packet::new();
        packet.set_messages(vec![Message::Custom {
            data: Bytes::from_static(b"forged"),
        }]);
        packet.sign(&mallory);
        packet.set_from(Some(victim.public_key()));
        let result = b.node.handle_datagram(datagram(seal(&packet))).await;
        assert!(matches!(result, Err(AdnlError::InvalidSignature)));

        // Unsigned identity packet
        let mut packet = Packet::new();
        packet.set_from(Some(victim.public_key()));
        let result = b.node.handle_datagram(datagram(seal(&packet))).await;
        assert!(matches!(result, Err(AdnlError::InvalidSignature)));

        // Flipped ciphertext byte
        let mut packet = Packet::new();
        packet.sign(&mallory);
        let mut sealed = seal(&packet).to_vec();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        let result = b.node.handle_datagram(datagram(Bytes::from(sealed))).await;
        assert!(matches!(result, Err(AdnlError::Crypto(_))));

        assert_eq!(b.node.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_prefix_routing() {
        struct Tagged(mpsc::UnboundedSender<&'static str>, &'static str);

        #[async_trait]
        impl Subscriber for Tagged {
            async fn on_message(&self, _from: &ShortId, _data: Bytes) {
                let _ = self.0.send(self.1);
            }
        }

        let network = LoopbackNetwork::new();
        let (transport, rx) = network.endpoint();
        let address = transport.address();
        let b = LocalNode::new(
            PrivateKey::generate(),
            transport,
            vec![address],
            AdnlConfig::default(),
        )
        .unwrap();
        let (tx, mut hits) = mpsc::unbounded_channel();
        b.subscribe(&b"dht"[..], Arc::new(Tagged(tx.clone(), "dht")));
        b.subscribe(&b"ovl"[..], Arc::new(Tagged(tx, "ovl")));
        b.start(rx);

        let a = spawn_peer(&network);
        let to_b = a.node.connection(*b.public_key(), b.address_list());
        to_b.send_custom(Bytes::from_static(b"ovl:x")).await.unwrap();
        to_b.send_custom(Bytes::from_static(b"zzz")).await.unwrap();
        to_b.send_custom(Bytes::from_static(b"dht:y")).await.unwrap();

        let mut got = Vec::new();
        for _ in 0..2 {
            got.push(
                tokio::time::timeout(Duration::from_secs(2), hits.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        got.sort();
        assert_eq!(got, vec!["dht", "ovl"]);
    }
}
