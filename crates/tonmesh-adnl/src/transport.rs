//! Datagram transports
//!
//! Wire format of a datagram:
//! [Destination id: 32 bytes][Ciphertext: variable]
//!
//! The destination is either the receiver's short id (identity encryption)
//! or the input id of a channel the receiver holds.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tonmesh_crypto::ShortId;
use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::error::{AdnlError, AdnlResult};

/// Destination prefix length
pub const DESTINATION_SIZE: usize = 32;

/// Largest datagram we read
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// A datagram received from a transport
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Short id the sender addressed
    pub destination: ShortId,

    /// Where the datagram came from
    pub source: Address,

    /// Encrypted packet
    pub payload: Bytes,
}

impl Datagram {
    /// Split a raw datagram into destination and payload
    pub fn parse(mut raw: Bytes, source: Address) -> AdnlResult<Self> {
        if raw.len() < DESTINATION_SIZE {
            return Err(AdnlError::Decode(format!(
                "datagram too short: {} bytes",
                raw.len()
            )));
        }
        let destination = ShortId::try_from_slice(&raw.split_to(DESTINATION_SIZE))?;
        Ok(Self {
            destination,
            source,
            payload: raw,
        })
    }

    /// Prefix `payload` with the destination id
    pub fn frame(destination: &ShortId, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(DESTINATION_SIZE + payload.len());
        buf.extend_from_slice(destination.as_bytes());
        buf.extend_from_slice(payload);
        buf.freeze()
    }
}

/// Outbound half of a transport; inbound datagrams arrive on a channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an encrypted packet addressed to `destination` at `address`
    async fn send(&self, destination: &ShortId, address: &Address, payload: Bytes) -> AdnlResult<()>;
}

/// UDP transport
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Create a new UDP transport bound to the specified address
    pub async fn bind(addr: SocketAddr) -> AdnlResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!("UDP transport bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive one datagram
    pub async fn recv(&self) -> AdnlResult<Datagram> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);

        trace!("Received {} bytes from {}", len, from);
        Datagram::parse(Bytes::from(buf), Address::from(from))
    }

    /// Start receiving datagrams and forward them to a channel
    pub fn spawn_receiver(
        self: Arc<Self>,
        tx: mpsc::Sender<Datagram>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.recv().await {
                    Ok(datagram) => {
                        if tx.send(datagram).await.is_err() {
                            debug!("Receiver channel closed, stopping");
                            break;
                        }
                    }
                    Err(AdnlError::Decode(e)) => {
                        trace!("Dropping malformed datagram: {}", e);
                    }
                    Err(e) => {
                        warn!("Error receiving datagram: {}", e);
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, destination: &ShortId, address: &Address, payload: Bytes) -> AdnlResult<()> {
        let addr = address.to_socket_addr()?;
        let datagram = Datagram::frame(destination, &payload);
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(AdnlError::SendError(format!(
                "datagram too large: {} bytes",
                datagram.len()
            )));
        }

        trace!("Sending {} bytes to {}", datagram.len(), addr);
        self.socket.send_to(&datagram, addr).await?;
        Ok(())
    }
}

/// Builder for UDP transport with custom socket options
pub struct UdpTransportBuilder {
    bind_addr: SocketAddr,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
}

impl UdpTransportBuilder {
    /// Create a new builder
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }

    /// Set receive buffer size
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Set send buffer size
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Build the transport
    pub fn build(self) -> AdnlResult<UdpTransport> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if self.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&self.bind_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket)?;
        let local_addr = tokio_socket.local_addr()?;
        debug!("UDP transport bound to {} with custom options", local_addr);

        Ok(UdpTransport {
            socket: Arc::new(tokio_socket),
            local_addr,
        })
    }
}
