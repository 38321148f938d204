//! In-memory transport
//!
//! Every endpoint gets a fake `127.0.0.1` address on a shared network.
//! Datagrams to unknown or disconnected endpoints vanish, like UDP.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tonmesh_crypto::ShortId;
use tracing::trace;

use crate::address::Address;
use crate::error::AdnlResult;
use crate::transport::{Datagram, Transport};

const LOOPBACK_IP: u32 = 0x7f00_0001;

/// Record of one datagram sent over the network
#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub from: Address,
    pub to: Address,
    pub destination: ShortId,
    pub len: usize,
    pub payload: Bytes,
}

/// A shared in-memory network
pub struct LoopbackNetwork {
    endpoints: DashMap<Address, mpsc::Sender<Datagram>>,
    history: Mutex<Vec<SentDatagram>>,
    next_port: AtomicU16,
}

/// One endpoint on a [`LoopbackNetwork`]
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    address: Address,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            history: Mutex::new(Vec::new()),
            next_port: AtomicU16::new(10000),
        })
    }

    /// Attach a new endpoint
    pub fn endpoint(self: &Arc<Self>) -> (Arc<LoopbackTransport>, mpsc::Receiver<Datagram>) {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let address = Address::Udp {
            ip: LOOPBACK_IP,
            port,
        };
        let (tx, rx) = mpsc::channel(1024);
        self.endpoints.insert(address, tx);

        let transport = Arc::new(LoopbackTransport {
            network: self.clone(),
            address,
        });
        (transport, rx)
    }

    /// Detach an endpoint; later datagrams to it are dropped
    pub fn disconnect(&self, address: &Address) {
        self.endpoints.remove(address);
    }

    /// Every datagram sent so far
    pub fn history(&self) -> Vec<SentDatagram> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl LoopbackTransport {
    pub fn address(&self) -> Address {
        self.address
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, destination: &ShortId, address: &Address, payload: Bytes) -> AdnlResult<()> {
        self.network
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentDatagram {
                from: self.address,
                to: *address,
                destination: *destination,
                len: payload.len(),
                payload: payload.clone(),
            });

        let tx = self.network.endpoints.get(address).map(|tx| tx.clone());
        match tx {
            Some(tx) => {
                let datagram = Datagram {
                    destination: *destination,
                    source: self.address,
                    payload,
                };
                if tx.send(datagram).await.is_err() {
                    trace!("Loopback endpoint {} is gone", address);
                }
            }
            None => trace!("No loopback endpoint at {}", address),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_and_history() {
        let network = LoopbackNetwork::new();
        let (a, _rx_a) = network.endpoint();
        let (b, mut rx_b) = network.endpoint();
        assert_ne!(a.address(), b.address());

        let destination = ShortId::random();
        a.send(&destination, &b.address(), Bytes::from_static(b"hi"))
            .await
            .unwrap();

        let datagram = rx_b.recv().await.unwrap();
        assert_eq!(datagram.destination, destination);
        assert_eq!(datagram.source, a.address());

        let history = network.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].len, 2);
        assert_eq!(&history[0].payload[..], b"hi");
    }

    #[tokio::test]
    async fn test_disconnected_endpoint_drops() {
        let network = LoopbackNetwork::new();
        let (a, _rx_a) = network.endpoint();
        let (b, mut rx_b) = network.endpoint();
        network.disconnect(&b.address());

        a.send(&ShortId::random(), &b.address(), Bytes::from_static(b"lost"))
            .await
            .unwrap();
        assert!(rx_b.try_recv().is_err());
    }
}
