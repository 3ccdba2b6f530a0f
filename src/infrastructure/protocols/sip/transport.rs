//! SIP transport collaborator
//!
//! The engine never touches sockets. It emits [`Outgoing`] items addressed to
//! a [`Destination`]; the runtime hands them to a [`Transport`] and feeds
//! [`TransportEvent`]s back in.

use super::headers::{uri_host_port, uri_param};
use super::message::{SipError, SipMessage};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
            TransportProtocol::Ws => "WS",
            TransportProtocol::Wss => "WSS",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp => 5060,
            TransportProtocol::Tcp => 5060,
            TransportProtocol::Tls => 5061,
            TransportProtocol::Ws => 80,
            TransportProtocol::Wss => 443,
        }
    }

    /// Reliable transports suppress retransmission timers
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportProtocol::Udp)
    }
}

impl FromStr for TransportProtocol {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportProtocol::Udp),
            "tcp" => Ok(TransportProtocol::Tcp),
            "tls" => Ok(TransportProtocol::Tls),
            "ws" => Ok(TransportProtocol::Ws),
            "wss" => Ok(TransportProtocol::Wss),
            other => Err(SipError::TransportError(format!("Unknown transport: {}", other))),
        }
    }
}

/// Where a message should be delivered
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub protocol: TransportProtocol,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16, protocol: TransportProtocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }

    /// Resolve the next hop for a URI (`transport` parameter wins over the default)
    pub fn from_uri(uri: &str, default_protocol: TransportProtocol) -> Option<Self> {
        let (host, port) = uri_host_port(uri)?;
        let protocol = uri_param(uri, "transport")
            .flatten()
            .and_then(|t| TransportProtocol::from_str(&t).ok())
            .unwrap_or(default_protocol);
        Some(Self {
            host,
            port: port.unwrap_or_else(|| protocol.default_port()),
            protocol,
        })
    }

    pub fn from_socket_addr(addr: SocketAddr, protocol: TransportProtocol) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            protocol,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.protocol.is_reliable()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{};transport={}", self.host, self.port, self.protocol.as_str())
    }
}

/// Work item produced by the engine for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Message {
        message: SipMessage,
        destination: Destination,
    },
    /// Tear down any connection or binding towards this destination
    ResetConnection { destination: Destination },
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Notification from the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(IncomingMessage),
    ConnectionClosed(Destination),
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: Destination,
}

/// Transport layer trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start the transport, returning the bound local address
    async fn start(&mut self) -> Result<SocketAddr, SipError>;

    /// Stop the transport
    async fn stop(&mut self) -> Result<(), SipError>;

    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Drop any connection state towards a destination
    async fn reset(&self, destination: &Destination) -> Result<(), SipError>;

    /// Take the receiver for incoming events; returns `None` once taken
    fn take_receiver(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// UDP transport implementation
pub struct UdpTransport {
    bind_addr: SocketAddr,
    pub socket: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<TransportEvent>,
    rx: Option<mpsc::Receiver<TransportEvent>>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            socket: None,
            tx,
            rx: Some(rx),
        }
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<TransportEvent>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    // Keep-alive CRLF pings carry no message
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage {
                                message,
                                source,
                                protocol: TransportProtocol::Udp,
                            };

                            if let Err(e) = tx.send(TransportEvent::Message(incoming)).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn start(&mut self) -> Result<SocketAddr, SipError> {
        info!("Starting UDP transport on {}", self.bind_addr);

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(format!("Failed to read local address: {}", e)))?;
        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        // Start receive loop in background
        let tx = self.tx.clone();
        tokio::spawn(async move {
            Self::receive_loop(socket, tx).await;
        });

        Ok(local_addr)
    }

    async fn stop(&mut self) -> Result<(), SipError> {
        info!("Stopping UDP transport");
        self.socket = None;
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SipError::TransportError("Socket not initialized".to_string()))?;

        let target = tokio::net::lookup_host((message.destination.host.as_str(), message.destination.port))
            .await
            .map_err(|e| {
                SipError::TransportError(format!("Failed to resolve {}: {}", message.destination, e))
            })?
            .next()
            .ok_or_else(|| {
                SipError::TransportError(format!("No address for {}", message.destination))
            })?;

        debug!("Sending {} bytes to {} via UDP", message.data.len(), target);

        socket
            .send_to(&message.data, target)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    async fn reset(&self, destination: &Destination) -> Result<(), SipError> {
        // Datagram transport keeps no per-peer state
        debug!("Reset requested for {} on UDP transport", destination);
        Ok(())
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_from_uri() {
        let dest = Destination::from_uri("sip:bob@192.0.2.4:5080", TransportProtocol::Udp).unwrap();
        assert_eq!(dest, Destination::new("192.0.2.4", 5080, TransportProtocol::Udp));

        let dest = Destination::from_uri("sip:proxy.example.com;transport=tcp;lr", TransportProtocol::Udp).unwrap();
        assert_eq!(dest.port, 5060);
        assert!(dest.is_reliable());
    }

    #[tokio::test]
    async fn test_udp_transport_start() {
        let bind_addr = "127.0.0.1:0".parse().unwrap();
        let mut transport = UdpTransport::new(bind_addr);

        let local = transport.start().await.unwrap();
        assert_ne!(local.port(), 0);
        assert!(transport.take_receiver().is_some());
        assert!(transport.take_receiver().is_none());

        // Clean up
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_transport_loopback() {
        let mut a = UdpTransport::new("127.0.0.1:0".parse().unwrap());
        let mut b = UdpTransport::new("127.0.0.1:0".parse().unwrap());
        a.start().await.unwrap();
        let b_addr = b.start().await.unwrap();
        let mut rx = b.take_receiver().unwrap();

        let data = Bytes::from_static(
            b"OPTIONS sip:b@127.0.0.1 SIP/2.0\r\n\
              Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKloop\r\n\
              From: <sip:a@127.0.0.1>;tag=1\r\n\
              To: <sip:b@127.0.0.1>\r\n\
              Call-ID: loop@127.0.0.1\r\n\
              CSeq: 1 OPTIONS\r\n\
              Content-Length: 0\r\n\r\n",
        );
        a.send(OutgoingMessage {
            data,
            destination: Destination::from_socket_addr(b_addr, TransportProtocol::Udp),
        })
        .await
        .unwrap();

        match rx.recv().await {
            Some(TransportEvent::Message(incoming)) => assert!(incoming.message.is_request()),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
