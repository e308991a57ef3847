// Error types for the tunnel supervisor

use std::time::Duration;

use thiserror::Error;
use tunnel9_common::TunnelId;

/// Why a connection attempt or a live connection failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Transient network failure, retried with backoff
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection establishment exceeded its time budget, retried with backoff
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Credentials or host key rejected; needs a manual start
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The tunnel spec cannot work as configured; needs a manual start
    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),
}

impl TunnelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TunnelError::Connection(_) | TunnelError::Timeout(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Tunnel not found: {0}")]
    UnknownTunnel(TunnelId),

    #[error("Shutdown timed out after {timeout:?}; force-terminated {forced} tunnel(s)")]
    ShutdownTimeout { timeout: Duration, forced: usize },
}
