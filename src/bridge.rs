//! The bridge facade (spec §4.6): owns the shared subsystems and exposes
//! `add`/`add_packet`/`close` to the userspace TCP/IP stack.

use crate::conn::{TcpConn, UdpPacket};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::logger::{self, BreadcrumbFlags};
use crate::metadata::FlowMetadata;
use crate::nat::NatTable;
use crate::proxy::{Destination, InboundContext, ProxyEngine, Tag};
use crate::stats::StatsRegistry;
use crate::uid::{AppStatus, UidRegistry, UidResolver};
use crate::{tcp_flow, udp_flow};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

const DNS_OVERRIDE_DEST: &str = "1.0.0.1:53";

/// Dials the proxy engine for plain-TCP DNS at `1.0.0.1:53`, tagged
/// `dns-in`, on behalf of the process-wide DNS override (spec §4.6/§6).
pub struct DnsDialer {
    proxy: Arc<dyn ProxyEngine>,
}

impl DnsDialer {
    pub async fn dial(&self) -> std::io::Result<Box<dyn TcpConn>> {
        let ctx = InboundContext {
            source: "0.0.0.0:0".parse().unwrap(),
            tag: Tag::DnsIn,
            uid: 0,
            app_status: AppStatus::Background,
            sniff: None,
        };
        let dst: SocketAddr = DNS_OVERRIDE_DEST.parse().unwrap();
        self.proxy.dial_tcp(&ctx, Destination::Tcp(dst)).await
    }
}

/// While a bridge is alive the process default DNS dialer is replaced by
/// this one; closing the bridge restores the prior (absent) dialer.
/// Process-wide by design — only one bridge is expected to be active at a
/// time in the embedding process.
static PROCESS_DNS_DIALER: Lazy<RwLock<Option<Arc<DnsDialer>>>> = Lazy::new(|| RwLock::new(None));

pub fn process_dns_dialer() -> Option<Arc<DnsDialer>> {
    PROCESS_DNS_DIALER.read().clone()
}

/// Resources shared by every flow handler, bundled so `Bridge::add`/
/// `add_packet` don't have to thread half a dozen `Arc`s through.
pub struct FlowContext {
    pub proxy: Arc<dyn ProxyEngine>,
    pub uid_registry: Arc<UidRegistry>,
    pub stats: Arc<StatsRegistry>,
    pub nat: Arc<NatTable>,
    pub config: Arc<BridgeConfig>,
}

impl FlowContext {
    pub fn build_inbound_context(&self, source: SocketAddr, meta: FlowMetadata) -> InboundContext {
        InboundContext {
            source,
            tag: meta.tag,
            uid: meta.uid,
            app_status: meta.app_status,
            sniff: meta.sniff,
        }
    }
}

/// Owns the stack's flow sink plumbing: the NAT table, the stats
/// registry, the uid registry, and a handle to the outbound proxy engine.
///
/// Construction and `close` are serialized via `closed`/the runtime
/// handle; everything else (`add`, `add_packet`) is safe to call
/// concurrently from many stack-reader tasks.
pub struct Bridge {
    runtime: Handle,
    ctx: Arc<FlowContext>,
    closed: AtomicBool,
    close_lock: Mutex<()>,
}

impl Bridge {
    /// `new(fd, mtu, engine, router, hijackDns, sniffing, fakedns, debug,
    /// dumpUid, trafficStats)` per the external-interfaces contract. The
    /// runtime handle is supplied by the embedder rather than constructed
    /// here — a library should not assume ownership of the process's
    /// async runtime.
    pub fn new(
        runtime: Handle,
        config: BridgeConfig,
        proxy: Arc<dyn ProxyEngine>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!("bridge constructed (mtu={}, fd={})", config.mtu, config.tun_fd),
        );
        *PROCESS_DNS_DIALER.write() = Some(Arc::new(DnsDialer {
            proxy: proxy.clone(),
        }));
        Ok(Self {
            runtime,
            ctx: Arc::new(FlowContext {
                proxy,
                uid_registry: Arc::new(UidRegistry::new()),
                stats: Arc::new(StatsRegistry::new()),
                nat: Arc::new(NatTable::new()),
                config: Arc::new(config),
            }),
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
        })
    }

    pub fn set_uid_dumper(&self, resolver: Option<Arc<dyn UidResolver>>) {
        self.ctx.uid_registry.set_resolver(resolver);
    }

    pub fn set_foreground_uid(&self, uid: u32) {
        self.ctx.uid_registry.set_foreground_uid(uid);
    }

    pub fn set_foreground_ime_uid(&self, uid: u32) {
        self.ctx.uid_registry.set_foreground_ime_uid(uid);
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.ctx.stats
    }

    /// `add(tcp_conn)`: spawns the TCP flow handler. A no-op (packet
    /// dropped) once the bridge is closed.
    pub fn add(&self, tcp: Box<dyn TcpConn + 'static>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let ctx = self.ctx.clone();
        self.runtime.spawn(async move {
            tcp_flow::handle(&ctx, tcp).await;
        });
    }

    /// `add_packet(udp_packet)`: spawns the UDP flow handler on its own
    /// task so the stack's read loop is never blocked by NAT gating or a
    /// slow dial.
    pub fn add_packet(&self, packet: Box<dyn UdpPacket + 'static>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let ctx = self.ctx.clone();
        self.runtime.spawn(async move {
            udp_flow::handle(&ctx, packet).await;
        });
    }

    /// `close`: serialized against any further public calls. Once closed
    /// a bridge is unusable; construct a new one to resume. A second call
    /// is rejected with [`BridgeError::Closed`] rather than silently
    /// repeating teardown.
    pub fn close(&self) -> Result<(), BridgeError> {
        let _guard = self.close_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::Closed);
        }
        self.ctx.uid_registry.set_resolver(None);
        *PROCESS_DNS_DIALER.write() = None;
        logger::breadcrumb(BreadcrumbFlags::FLOW, "bridge closed".to_string());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Destination;
    use std::net::{IpAddr, Ipv4Addr};

    struct NeverDialedProxy;

    #[async_trait::async_trait]
    impl ProxyEngine for NeverDialedProxy {
        async fn dial_tcp(
            &self,
            _ctx: &InboundContext,
            _dst: Destination,
        ) -> std::io::Result<Box<dyn TcpConn>> {
            unimplemented!("not exercised by bridge lifecycle tests")
        }

        async fn dial_udp(&self, _ctx: &InboundContext) -> std::io::Result<Arc<dyn crate::conn::PacketConn>> {
            unimplemented!("not exercised by bridge lifecycle tests")
        }
    }

    fn test_bridge() -> Bridge {
        Bridge::new(
            Handle::current(),
            BridgeConfig {
                tun_fd: 3,
                mtu: 1500,
                router_ip: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                hijack_dns: false,
                sniffing: false,
                fakedns: false,
                debug: false,
                dump_uid: false,
                traffic_stats: false,
            },
            Arc::new(NeverDialedProxy),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_a_second_call() {
        let bridge = test_bridge();
        assert!(bridge.close().is_ok());
        assert!(bridge.is_closed());
        assert!(matches!(bridge.close(), Err(BridgeError::Closed)));
    }

    #[tokio::test]
    async fn add_after_close_does_not_panic() {
        let bridge = test_bridge();
        bridge.close().unwrap();
        // The handler task it would have spawned never runs; this only
        // checks that the call itself returns without crashing.
        let (_client, server) = tokio::io::duplex(8);
        struct DummyConn(tokio::io::DuplexStream);
        impl tokio::io::AsyncRead for DummyConn {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::pin::Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
            }
        }
        impl tokio::io::AsyncWrite for DummyConn {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                std::pin::Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::pin::Pin::new(&mut self.get_mut().0).poll_flush(cx)
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::pin::Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
            }
        }
        impl TcpConn for DummyConn {
            fn local_endpoint(&self) -> crate::conn::RawEndpoint {
                crate::conn::RawEndpoint {
                    host: "10.0.0.2".to_string(),
                    port: 1,
                }
            }
            fn remote_endpoint(&self) -> crate::conn::RawEndpoint {
                crate::conn::RawEndpoint {
                    host: "1.1.1.1".to_string(),
                    port: 1,
                }
            }
        }
        bridge.add(Box::new(DummyConn(server)));
    }
}
