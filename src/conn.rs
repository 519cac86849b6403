//! Contracts for the userspace TCP/IP stack's synthesized connections.
//!
//! The stack itself (packet reconstruction, IP/TCP/UDP framing) is an
//! external collaborator; this module only states what it hands to the
//! bridge and what the bridge hands back.

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// A `host:port` pair exactly as the stack hands it up. `host` is not
/// guaranteed to be a numeric IP — a stack that routes by hostname (e.g.
/// under fake-DNS) may hand up a domain name here, which the flow
/// boundary must reject (spec scenario S5).
#[derive(Debug, Clone)]
pub struct RawEndpoint {
    pub host: String,
    pub port: u16,
}

/// A reconstructed TCP connection delivered to [`crate::bridge::Bridge::add`].
pub trait TcpConn: AsyncRead + AsyncWrite + Unpin + Send {
    fn local_endpoint(&self) -> RawEndpoint;
    fn remote_endpoint(&self) -> RawEndpoint;
}

/// A single UDP datagram delivered to
/// [`crate::bridge::Bridge::add_packet`].
///
/// There is deliberately no explicit `drop()` method: the packet is an
/// owned value and Rust drops it exactly once when the last owner releases
/// it, which sidesteps the double-drop ambiguity around this object
/// entirely.
pub trait UdpPacket: Send {
    fn payload(&self) -> &[u8];
    /// The TUN-side source endpoint; this is also the NAT flow key.
    fn source(&self) -> SocketAddr;
    /// The destination the host app addressed this datagram to.
    fn destination(&self) -> SocketAddr;
    /// Deliver a reply datagram back into the TUN. `source` overrides the
    /// apparent sender; `None` means "use whatever the stack originally
    /// addressed the request to" (used for DNS replies).
    fn write_back(&self, data: &[u8], source: Option<SocketAddr>) -> std::io::Result<()>;
}

/// An outbound UDP connection returned by [`crate::proxy::ProxyEngine::dial_udp`].
///
/// One instance is shared by every datagram on a NAT flow key: it accepts
/// a destination per send and labels each received datagram with its
/// sender.
#[async_trait::async_trait]
pub trait PacketConn: Send + Sync {
    async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> std::io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
}
