//! A userspace flow dispatcher for a TUN-backed mobile VPN/proxy client.
//!
//! This crate does not itself read the TUN device or reconstruct IP/TCP/UDP
//! flows from its byte stream — that is a userspace TCP/IP stack supplied by
//! the embedder. What this crate does: given a synthesized [`conn::TcpConn`]
//! or [`conn::UdpPacket`] from that stack, it resolves the flow's owning uid
//! and DNS/sniffing status, dials it out through a pluggable
//! [`proxy::ProxyEngine`], shuttles bytes while accounting for them per uid,
//! and — for UDP — maintains a NAT table with single-flight dial semantics
//! so concurrent first-packets for the same source never race into two
//! outbound dials.

mod bridge;
mod config;
mod conn;
mod dns;
mod error;
mod logger;
mod metadata;
mod nat;
mod proxy;
mod stats;
mod tcp_flow;
mod udp_flow;
mod uid;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use conn::{PacketConn, TcpConn, UdpPacket};
pub use error::BridgeError;
pub use logger::{install_sink, set_breadcrumb_mask, BreadcrumbFlags, LogLevel, LogSink};
pub use proxy::{Destination, InboundContext, ProxyEngine, SniffRequest, Tag};
pub use stats::UidStats;
pub use uid::{AppStatus, UidError, UidInfo, UidResolver};
