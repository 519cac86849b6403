//! The metadata resolver (spec §4.3): turns a 5-tuple into the inbound
//! descriptor the proxy engine needs.

use crate::config::BridgeConfig;
use crate::dns;
use crate::logger::{self, BreadcrumbFlags};
use crate::proxy::{SniffRequest, Tag};
use crate::uid::{AppStatus, UidRegistry};
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone)]
pub struct FlowMetadata {
    pub uid: u32,
    pub is_self: bool,
    pub app_status: AppStatus,
    pub is_dns: bool,
    pub tag: Tag,
    pub sniff: Option<SniffRequest>,
}

impl FlowMetadata {
    /// DNS flows are never accounted: they're internal plumbing for the
    /// hijacked resolver, not application traffic.
    pub fn should_account(&self) -> bool {
        !self.is_self && !self.is_dns
    }
}

pub struct ResolveParams<'a> {
    pub is_udp: bool,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub router_ip: IpAddr,
    /// The first datagram's payload, for UDP DNS-hijack inspection only.
    pub first_payload: Option<&'a [u8]>,
}

pub fn resolve_metadata(uid_registry: &UidRegistry, config: &BridgeConfig, params: ResolveParams<'_>) -> FlowMetadata {
    let raw_uid = if config.dump_uid || config.traffic_stats {
        match uid_registry.resolver() {
            Some(resolver) => match resolver.dump_uid(
                params.src.is_ipv6(),
                params.is_udp,
                params.src.ip(),
                params.src.port(),
                params.dst.ip(),
                params.dst.port(),
            ) {
                Ok(uid) => Some(uid),
                Err(error) => {
                    logger::breadcrumb(BreadcrumbFlags::UID, format!("uid resolve failed: {error}"));
                    None
                }
            },
            None => None,
        }
    } else {
        None
    };

    let (uid, is_self, app_status) = uid_registry.classify(raw_uid);

    let is_dns = params.dst.ip() == params.router_ip
        || (!params.is_udp && params.dst.port() == 53)
        || (params.is_udp
            && config.hijack_dns
            && params.first_payload.is_some_and(dns::is_dns_query));

    let tag = if is_dns { Tag::DnsIn } else { Tag::Socks };

    let sniff = if config.sniffing && !is_dns {
        Some(SniffRequest::new(config.fakedns))
    } else {
        None
    };

    FlowMetadata {
        uid,
        is_self,
        app_status,
        is_dns,
        tag,
        sniff,
    }
}
