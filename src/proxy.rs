//! The outbound proxy engine contract and the inbound metadata handed to it.

use crate::conn::{PacketConn, TcpConn};
use crate::uid::AppStatus;
use std::net::SocketAddr;
use std::sync::Arc;

/// `dst` for a TCP dial. UDP dials carry no destination at all — the
/// returned [`PacketConn`] accepts one per datagram.
#[derive(Debug, Clone, Copy)]
pub enum Destination {
    Tcp(SocketAddr),
}

/// The inbound tag attached to a flow, surfaced to the proxy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Socks,
    DnsIn,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Socks => "socks",
            Tag::DnsIn => "dns-in",
        }
    }
}

/// First-bytes protocol sniffing request attached to non-DNS flows when
/// sniffing is enabled.
#[derive(Debug, Clone)]
pub struct SniffRequest {
    pub protocols: Vec<&'static str>,
}

impl SniffRequest {
    pub fn new(fakedns: bool) -> Self {
        let protocols = if fakedns {
            vec!["fakedns", "http", "tls"]
        } else {
            vec!["http", "tls"]
        };
        Self { protocols }
    }
}

/// Inbound metadata passed to the proxy engine for each flow (spec §3).
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub source: SocketAddr,
    pub tag: Tag,
    pub uid: u32,
    pub app_status: AppStatus,
    pub sniff: Option<SniffRequest>,
}

#[async_trait::async_trait]
pub trait ProxyEngine: Send + Sync {
    async fn dial_tcp(
        &self,
        ctx: &InboundContext,
        dst: Destination,
    ) -> std::io::Result<Box<dyn TcpConn>>;

    async fn dial_udp(&self, ctx: &InboundContext) -> std::io::Result<Arc<dyn PacketConn>>;
}
