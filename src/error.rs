use thiserror::Error;

/// Fatal errors surfaced to the embedder. Per-flow errors (parse, dial,
/// copy, resolver, DNS-parse) never reach this type — they are logged at
/// the flow boundary and only ever drop the one flow.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid mtu {0}: must be in [{min}, {max}]", min = crate::config::MIN_MTU, max = crate::config::MAX_MTU)]
    InvalidMtu(u32),
    #[error("invalid tun file descriptor")]
    InvalidFd,
    #[error("bridge is already closed")]
    Closed,
}
