use bytes::BytesMut;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

/// Type of transport protocol, either UDP or TCP
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportProtocol {
    /// UDP
    #[default]
    UDP,
    /// TCP
    TCP,
}

impl TransportProtocol {
    /// Lower-case protocol name as it appears in candidate lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::UDP => "udp",
            TransportProtocol::TCP => "tcp",
        }
    }
}

/// Transport Context with local address, peer address and protocol
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportContext {
    /// Local socket address, either IPv4 or IPv6
    pub local_addr: SocketAddr,
    /// Peer socket address, either IPv4 or IPv6
    pub peer_addr: SocketAddr,
    /// Type of transport protocol, either UDP or TCP
    pub transport_protocol: TransportProtocol,
    /// Differentiated services code point to set on the packet
    pub dscp: Option<u8>,
}

impl Default for TransportContext {
    fn default() -> Self {
        let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: any,
            peer_addr: any,
            transport_protocol: TransportProtocol::UDP,
            dscp: None,
        }
    }
}

/// A generic transmit with [TransportContext]
#[derive(Debug, Clone)]
pub struct TransportMessage<T> {
    /// Received/Sent time
    pub now: Instant,
    /// A transport context with [local_addr](TransportContext::local_addr) and [peer_addr](TransportContext::peer_addr)
    pub transport: TransportContext,
    /// Message body with generic type
    pub message: T,
}

impl<T> TransportMessage<T> {
    /// Builds a UDP transmit from `local_addr` to `peer_addr`.
    pub fn udp(now: Instant, local_addr: SocketAddr, peer_addr: SocketAddr, message: T) -> Self {
        Self {
            now,
            transport: TransportContext {
                local_addr,
                peer_addr,
                transport_protocol: TransportProtocol::UDP,
                dscp: None,
            },
            message,
        }
    }
}

/// BytesMut type transmit with [TransportContext]
pub type TaggedBytesMut = TransportMessage<BytesMut>;
