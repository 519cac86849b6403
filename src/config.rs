use crate::error::BridgeError;
use std::net::IpAddr;

pub const MIN_MTU: u32 = 576;
pub const MAX_MTU: u32 = 9000;
pub const DEFAULT_MTU: u32 = 1500;

/// Construction-time configuration for a [`crate::bridge::Bridge`].
///
/// Mirrors the embedder-supplied flags from the external-interfaces
/// contract: `new(fd, mtu, engine, router, hijackDns, sniffing, fakedns,
/// debug, dumpUid, trafficStats)`.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub tun_fd: i32,
    pub mtu: u32,
    pub router_ip: IpAddr,
    pub hijack_dns: bool,
    pub sniffing: bool,
    pub fakedns: bool,
    pub debug: bool,
    pub dump_uid: bool,
    pub traffic_stats: bool,
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.tun_fd < 0 {
            return Err(BridgeError::InvalidFd);
        }
        if self.mtu < MIN_MTU || self.mtu > MAX_MTU {
            return Err(BridgeError::InvalidMtu(self.mtu));
        }
        Ok(())
    }
}
