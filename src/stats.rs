//! Per-uid traffic stats (spec §4.2): a registry of atomically-updated
//! counters plus byte-counting wrappers around outbound connections.

use crate::conn::PacketConn;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Default)]
pub struct UidStats {
    pub active_tcp: AtomicU32,
    pub active_udp: AtomicU32,
    pub cumulative_tcp: AtomicU64,
    pub cumulative_udp: AtomicU64,
    pub uplink_bytes: AtomicU64,
    pub downlink_bytes: AtomicU64,
    /// 0 while any flow is active; the wall-clock second the last flow of
    /// this uid closed, otherwise.
    pub deactivate_at: AtomicI64,
}

impl UidStats {
    pub fn open_tcp(&self) {
        self.active_tcp.fetch_add(1, Ordering::Relaxed);
        self.cumulative_tcp.fetch_add(1, Ordering::Relaxed);
        self.deactivate_at.store(0, Ordering::Relaxed);
    }

    pub fn open_udp(&self) {
        self.active_udp.fetch_add(1, Ordering::Relaxed);
        self.cumulative_udp.fetch_add(1, Ordering::Relaxed);
        self.deactivate_at.store(0, Ordering::Relaxed);
    }

    pub fn close_tcp(&self) {
        self.active_tcp.fetch_sub(1, Ordering::Relaxed);
        self.mark_if_idle();
    }

    pub fn close_udp(&self) {
        self.active_udp.fetch_sub(1, Ordering::Relaxed);
        self.mark_if_idle();
    }

    fn mark_if_idle(&self) {
        let tcp = self.active_tcp.load(Ordering::Relaxed);
        let udp = self.active_udp.load(Ordering::Relaxed);
        if tcp == 0 && udp == 0 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            self.deactivate_at.store(now, Ordering::Relaxed);
        }
    }

    pub fn add_uplink(&self, bytes: u64) {
        self.uplink_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downlink(&self, bytes: u64) {
        self.downlink_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// `record(uid)` creates a record lazily; the registry's lock is only ever
/// held to materialize a new entry, never across counter updates.
#[derive(Default)]
pub struct StatsRegistry {
    records: Mutex<FxHashMap<u32, Arc<UidStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, uid: u32) -> Arc<UidStats> {
        let mut guard = self.records.lock();
        guard.entry(uid).or_default().clone()
    }

    pub fn get(&self, uid: u32) -> Option<Arc<UidStats>> {
        self.records.lock().get(&uid).cloned()
    }
}

/// Delegating stream wrapper that adds each successfully transferred byte
/// count straight to the uid's counters. Uplink is writes (TUN toward
/// outbound); downlink is reads (outbound toward TUN). Holds a reference
/// to the record rather than copying bytes anywhere for accounting.
pub struct CountedStream<S> {
    inner: S,
    stats: Arc<UidStats>,
}

impl<S> CountedStream<S> {
    pub fn new(inner: S, stats: Arc<UidStats>) -> Self {
        Self { inner, stats }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if result.is_ready() {
            let added = buf.filled().len() - before;
            if added > 0 {
                this.stats.add_downlink(added as u64);
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &result {
            this.stats.add_uplink(*written as u64);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Delegating packet-conn wrapper, the UDP analogue of [`CountedStream`].
pub struct CountedPacketConn {
    inner: Arc<dyn PacketConn>,
    stats: Arc<UidStats>,
}

impl CountedPacketConn {
    pub fn new(inner: Arc<dyn PacketConn>, stats: Arc<UidStats>) -> Self {
        Self { inner, stats }
    }
}

#[async_trait::async_trait]
impl PacketConn for CountedPacketConn {
    async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> std::io::Result<usize> {
        let written = self.inner.send_to(payload, dest).await?;
        self.stats.add_uplink(written as u64);
        Ok(written)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let (read, from) = self.inner.recv_from(buf).await?;
        self.stats.add_downlink(read as u64);
        Ok((read, from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deactivate_at_is_zero_while_active_and_set_when_idle() {
        let stats = UidStats::default();
        stats.open_tcp();
        assert_eq!(stats.deactivate_at.load(Ordering::Relaxed), 0);
        stats.open_udp();
        stats.close_tcp();
        assert_eq!(
            stats.deactivate_at.load(Ordering::Relaxed),
            0,
            "udp flow still active"
        );
        stats.close_udp();
        assert!(stats.deactivate_at.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn registry_returns_the_same_record_for_repeated_lookups() {
        let registry = StatsRegistry::new();
        let first = registry.record(42);
        first.add_uplink(100);
        let second = registry.record(42);
        assert_eq!(second.uplink_bytes.load(Ordering::Relaxed), 100);
    }
}
