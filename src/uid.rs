//! Uid resolver contract, process-wide foreground markers, and the
//! normalization/self-detection rules from spec §4.3.

use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Sub-10000 uids are system identifiers; they collapse to this sentinel
/// so the stats registry does not fragment across them.
pub const NORMALIZED_SYSTEM_UID: u32 = 1000;
const NORMALIZATION_THRESHOLD: u32 = 10000;

#[derive(Debug, Error)]
pub enum UidError {
    #[error("uid lookup failed: {0}")]
    LookupFailed(String),
}

#[derive(Debug, Clone)]
pub struct UidInfo {
    pub package_name: String,
    pub label: String,
}

/// Maps a 5-tuple to the owning application uid. Implemented by the
/// embedding platform (e.g. by reading `/proc/net/{tcp,udp}` on Android).
pub trait UidResolver: Send + Sync {
    fn dump_uid(
        &self,
        ipv6: bool,
        udp: bool,
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
    ) -> Result<u32, UidError>;

    fn get_uid_info(&self, uid: u32) -> Result<UidInfo, UidError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Foreground,
    Background,
}

/// Process-wide singletons set by the embedder and read lock-free, per
/// spec §9's design note. The resolver itself is swapped rarely (once,
/// typically) so a `RwLock` is adequate there; the foreground markers are
/// read on every flow so they are plain relaxed atomics.
pub struct UidRegistry {
    resolver: RwLock<Option<Arc<dyn UidResolver>>>,
    foreground_uid: AtomicU32,
    foreground_ime_uid: AtomicU32,
    self_uid: u32,
}

impl UidRegistry {
    pub fn new() -> Self {
        let self_uid = current_process_uid();
        Self {
            resolver: RwLock::new(None),
            foreground_uid: AtomicU32::new(0),
            foreground_ime_uid: AtomicU32::new(0),
            self_uid,
        }
    }

    pub fn set_resolver(&self, resolver: Option<Arc<dyn UidResolver>>) {
        *self.resolver.write() = resolver;
    }

    pub fn resolver(&self) -> Option<Arc<dyn UidResolver>> {
        self.resolver.read().clone()
    }

    pub fn set_foreground_uid(&self, uid: u32) {
        self.foreground_uid.store(uid, Ordering::Relaxed);
    }

    pub fn set_foreground_ime_uid(&self, uid: u32) {
        self.foreground_ime_uid.store(uid, Ordering::Relaxed);
    }

    /// Resolves, normalizes, and tags a raw uid lookup result. Returns
    /// `(normalized_uid, is_self, app_status)`. A resolver error or a
    /// disabled lookup both yield uid `0`.
    pub fn classify(&self, raw_uid: Option<u32>) -> (u32, bool, AppStatus) {
        let Some(raw_uid) = raw_uid else {
            return (0, false, AppStatus::Background);
        };
        let is_self = raw_uid == self.self_uid;
        let normalized = normalize_uid(raw_uid);
        let foreground = self.foreground_uid.load(Ordering::Relaxed);
        let foreground_ime = self.foreground_ime_uid.load(Ordering::Relaxed);
        let status = if normalized == foreground || normalized == foreground_ime {
            AppStatus::Foreground
        } else {
            AppStatus::Background
        };
        (normalized, is_self, status)
    }
}

impl Default for UidRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Any resolved uid in `[1, 10000)` collapses to [`NORMALIZED_SYSTEM_UID`].
/// Uid `0` (disabled/failed) passes through unchanged.
pub fn normalize_uid(uid: u32) -> u32 {
    if uid > 0 && uid < NORMALIZATION_THRESHOLD {
        NORMALIZED_SYSTEM_UID
    } else {
        uid
    }
}

#[cfg(unix)]
fn current_process_uid() -> u32 {
    // Safety: getuid takes no arguments and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_process_uid() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_sub_threshold_uids() {
        assert_eq!(normalize_uid(42), NORMALIZED_SYSTEM_UID);
        assert_eq!(normalize_uid(9999), NORMALIZED_SYSTEM_UID);
        assert_eq!(normalize_uid(0), 0);
        assert_eq!(normalize_uid(10000), 10000);
        assert_eq!(normalize_uid(12345), 12345);
    }

    #[test]
    fn foreground_tagging_follows_either_marker() {
        let registry = UidRegistry::new();
        registry.set_foreground_uid(12345);
        registry.set_foreground_ime_uid(55555);
        let (uid, _, status) = registry.classify(Some(12345));
        assert_eq!(uid, 12345);
        assert_eq!(status, AppStatus::Foreground);
        let (uid, _, status) = registry.classify(Some(55555));
        assert_eq!(uid, 55555);
        assert_eq!(status, AppStatus::Foreground);
        let (uid, _, status) = registry.classify(Some(99999));
        assert_eq!(uid, 99999);
        assert_eq!(status, AppStatus::Background);
    }

    #[test]
    fn disabled_lookup_yields_uid_zero() {
        let registry = UidRegistry::new();
        let (uid, is_self, status) = registry.classify(None);
        assert_eq!(uid, 0);
        assert!(!is_self);
        assert_eq!(status, AppStatus::Background);
    }
}
