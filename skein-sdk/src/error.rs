//! Error types surfaced to SDK callers.

use std::path::PathBuf;

/// Why an outbound send did not reach the wire.
///
/// Flood-protection delays are not errors: those sends are retried
/// internally and only resolve once written (or once they hit one of the
/// terminal cases below).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("rate limit exceeded ({sent} sends in the last {window_ms} ms)")]
    RateLimited { sent: usize, window_ms: u64 },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not connected to network {0}")]
    NotConnected(String),
    #[error("command queue full")]
    QueueFull,
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bad config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("can't write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("can't serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unknown network '{0}'")]
    UnknownNetwork(String),
}
