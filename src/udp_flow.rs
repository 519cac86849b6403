//! The UDP flow handler (spec §4.5): NAT-gated single-flight dial, then a
//! downstream pump for the lifetime of the flow.

use crate::bridge::FlowContext;
use crate::conn::{PacketConn, UdpPacket};
use crate::logger::{self, BreadcrumbFlags};
use crate::metadata::{resolve_metadata, ResolveParams};
use crate::nat::LockAttempt;
use crate::stats::CountedPacketConn;
use std::sync::Arc;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Entry point from the stack: `add_packet(udp_packet)`. Expected to run
/// on its own task so the stack's read loop is never blocked by NAT
/// gating or a slow dial.
pub async fn handle(ctx: &FlowContext, packet: Box<dyn UdpPacket>) {
    let src = packet.source();
    let dst = packet.destination();
    let nat_key = src.to_string();

    // Fast path: an outbound conn for this source already exists.
    if let Some(conn) = ctx.nat.get(&nat_key) {
        if let Err(error) = conn.send_to(packet.payload(), dst).await {
            logger::breadcrumb(BreadcrumbFlags::NAT, format!("udp fast path write failed for {nat_key}: {error}"));
            ctx.nat.delete(&nat_key);
        }
        return;
    }

    // Gated creation: single-flight the dial for concurrent first-packets.
    if ctx.nat.try_create_lock(&nat_key) == LockAttempt::Waiter {
        ctx.nat.wait_for_release(&nat_key).await;
        if let Some(conn) = ctx.nat.get(&nat_key) {
            let _ = conn.send_to(packet.payload(), dst).await;
        }
        return;
    }
    // We are the creator: broadcast before dialing so waiters never stall
    // on a slow dial (spec §9).
    ctx.nat.release_lock(&nat_key);

    let meta = resolve_metadata(
        &ctx.uid_registry,
        &ctx.config,
        ResolveParams {
            is_udp: true,
            src,
            dst,
            router_ip: ctx.config.router_ip,
            first_payload: Some(packet.payload()),
        },
    );
    let inbound = ctx.build_inbound_context(src, meta.clone());

    let outbound = match ctx.proxy.dial_udp(&inbound).await {
        Ok(conn) => conn,
        Err(error) => {
            logger::breadcrumb(BreadcrumbFlags::NAT, format!("udp dial for {nat_key} failed: {error}"));
            return;
        }
    };

    let accounting = ctx.config.traffic_stats && meta.should_account();
    let stats = if accounting {
        let record = ctx.stats.record(meta.uid);
        record.open_udp();
        Some(record)
    } else {
        None
    };

    let conn: Arc<dyn PacketConn> = match &stats {
        Some(record) => Arc::new(CountedPacketConn::new(outbound, record.clone())),
        None => outbound,
    };

    ctx.nat.set(&nat_key, conn.clone());

    if let Err(error) = conn.send_to(packet.payload(), dst).await {
        logger::breadcrumb(BreadcrumbFlags::NAT, format!("udp first-packet write failed for {nat_key}: {error}"));
    }

    downstream_pump(ctx, &nat_key, conn, packet, meta.is_dns).await;

    if let Some(stats) = stats {
        stats.close_udp();
    }
}

/// Reads replies from the outbound conn and writes them back into the
/// TUN via the held first packet's `write_back`, until either side errors.
async fn downstream_pump(
    ctx: &FlowContext,
    nat_key: &str,
    conn: Arc<dyn PacketConn>,
    packet: Box<dyn UdpPacket>,
    is_dns: bool,
) {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let (len, from) = match conn.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(error) => {
                logger::breadcrumb(BreadcrumbFlags::NAT, format!("udp downstream read for {nat_key} ended: {error}"));
                break;
            }
        };
        // A DNS reply must appear to come from the address the host
        // originally queried, not wherever the proxy engine resolved it.
        let source = if is_dns { None } else { Some(from) };
        if let Err(error) = packet.write_back(&buf[..len], source) {
            logger::breadcrumb(BreadcrumbFlags::NAT, format!("udp write_back for {nat_key} failed: {error}"));
            break;
        }
    }
    ctx.nat.delete(nat_key);
    // `packet` drops here; its ownership has been held for the pump's
    // entire lifetime, so there is exactly one drop regardless of how
    // many datagrams the fast path served for this flow key.
}
