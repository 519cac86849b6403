//! The TCP flow handler (spec §4.4): one task per proxied TCP connection.

use crate::bridge::FlowContext;
use crate::conn::RawEndpoint;
use crate::logger::{self, BreadcrumbFlags};
use crate::metadata::{resolve_metadata, ResolveParams};
use crate::proxy::Destination;
use crate::stats::{CountedStream, UidStats};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Parses a numeric `ip:port` style endpoint, rejecting anything that
/// isn't a literal address — including a domain name. Spec §4.4 step 1:
/// both endpoints of a TCP flow must be numeric; any parse failure or
/// domain address is logged and the flow is dropped (scenario S5).
pub fn parse_numeric_endpoint(host: &str, port: u16) -> Result<SocketAddr, ()> {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| ())
}

fn parse_or_drop(endpoint: &RawEndpoint, which: &str) -> Option<SocketAddr> {
    match parse_numeric_endpoint(&endpoint.host, endpoint.port) {
        Ok(addr) => Some(addr),
        Err(()) => {
            logger::breadcrumb(
                BreadcrumbFlags::FLOW,
                format!(
                    "tcp {which} endpoint {}:{} is not a numeric address, dropping",
                    endpoint.host, endpoint.port
                ),
            );
            None
        }
    }
}

/// Entry point from the stack: `add(tcp_conn)`.
pub async fn handle(ctx: &FlowContext, tcp: Box<dyn crate::conn::TcpConn>) {
    let Some(src) = parse_or_drop(&tcp.local_endpoint(), "local") else {
        return;
    };
    let Some(dst) = parse_or_drop(&tcp.remote_endpoint(), "remote") else {
        return;
    };

    let meta = resolve_metadata(
        &ctx.uid_registry,
        &ctx.config,
        ResolveParams {
            is_udp: false,
            src,
            dst,
            router_ip: ctx.config.router_ip,
            first_payload: None,
        },
    );

    let inbound = ctx.build_inbound_context(src, meta.clone());

    let outbound = match ctx.proxy.dial_tcp(&inbound, Destination::Tcp(dst)).await {
        Ok(conn) => conn,
        Err(error) => {
            logger::breadcrumb(BreadcrumbFlags::FLOW, format!("tcp dial to {dst} failed: {error}"));
            return;
        }
    };

    let accounting = ctx.config.traffic_stats && meta.should_account();
    let stats = if accounting {
        let record = ctx.stats.record(meta.uid);
        record.open_tcp();
        Some(record)
    } else {
        None
    };

    // Not-accounted flows still get wrapped, into a throwaway record whose
    // counters nobody reads — simpler than threading a second outbound type
    // through the splice for the unaccounted case.
    let record = stats.clone().unwrap_or_else(|| Arc::new(UidStats::default()));
    let mut inbound_io = tcp;
    let mut outbound_io = CountedStream::new(outbound, record);

    let copy_result = tokio::io::copy_bidirectional(&mut inbound_io, &mut outbound_io).await;
    if let Err(error) = copy_result {
        logger::breadcrumb(BreadcrumbFlags::FLOW, format!("tcp splice for {dst} ended: {error}"));
    }

    if let Some(stats) = stats {
        stats.close_tcp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::conn::{PacketConn, TcpConn};
    use crate::nat::NatTable;
    use crate::proxy::{InboundContext, ProxyEngine};
    use crate::stats::StatsRegistry;
    use crate::uid::UidRegistry;
    use serial_test::serial;
    use std::net::{IpAddr, Ipv4Addr};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    struct MockTcpConn {
        inner: DuplexStream,
        local: RawEndpoint,
        remote: RawEndpoint,
    }

    impl AsyncRead for MockTcpConn {
        fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for MockTcpConn {
        fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
        }
        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }
        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    impl TcpConn for MockTcpConn {
        fn local_endpoint(&self) -> RawEndpoint {
            self.local.clone()
        }
        fn remote_endpoint(&self) -> RawEndpoint {
            self.remote.clone()
        }
    }

    struct NeverDialedProxy {
        dial_count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ProxyEngine for NeverDialedProxy {
        async fn dial_tcp(
            &self,
            _ctx: &InboundContext,
            _dst: Destination,
        ) -> std::io::Result<Box<dyn TcpConn>> {
            self.dial_count.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::Other, "must not be dialed"))
        }

        async fn dial_udp(&self, _ctx: &InboundContext) -> std::io::Result<Arc<dyn PacketConn>> {
            unimplemented!("not exercised by tcp tests")
        }
    }

    fn test_ctx(proxy: Arc<NeverDialedProxy>) -> FlowContext {
        FlowContext {
            proxy,
            uid_registry: Arc::new(UidRegistry::new()),
            stats: Arc::new(StatsRegistry::new()),
            nat: Arc::new(NatTable::new()),
            config: Arc::new(BridgeConfig {
                tun_fd: 3,
                mtu: 1500,
                router_ip: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                hijack_dns: false,
                sniffing: false,
                fakedns: false,
                debug: false,
                dump_uid: false,
                traffic_stats: false,
            }),
        }
    }

    #[test]
    fn parse_numeric_endpoint_rejects_a_domain() {
        assert!(parse_numeric_endpoint("example.com", 443).is_err());
        assert!(parse_numeric_endpoint("93.184.216.34", 443).is_ok());
    }

    // Emits a FLOW breadcrumb on the global logger; serialized against
    // logger.rs's own test, which asserts an exact count off that global.
    #[tokio::test]
    #[serial]
    async fn s5_domain_remote_endpoint_is_dropped_without_dialing() {
        let proxy = Arc::new(NeverDialedProxy {
            dial_count: AtomicUsize::new(0),
        });
        let ctx = test_ctx(proxy.clone());
        let (_client, server) = tokio::io::duplex(64);
        let tcp = Box::new(MockTcpConn {
            inner: server,
            local: RawEndpoint {
                host: "10.0.0.2".to_string(),
                port: 44100,
            },
            remote: RawEndpoint {
                host: "example.com".to_string(),
                port: 443,
            },
        });

        handle(&ctx, tcp).await;

        assert_eq!(proxy.dial_count.load(Ordering::SeqCst), 0);
    }
}
