//! Seam between the supervisor and whatever carries the bytes

use async_trait::async_trait;
use tunnel9_common::TunnelSpec;

use crate::error::TunnelError;

/// Establishes the forwarding session for a tunnel
///
/// A successful `connect` means the local address is bound and traffic is being
/// relayed. The supervisor bounds each call with its connect timeout and drops the
/// future when the tunnel is stopped, so implementations must be cancel-safe.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, spec: &TunnelSpec) -> Result<Box<dyn TunnelConnection>, TunnelError>;
}

/// A live forwarding session, exclusively owned by one tunnel task
#[async_trait]
pub trait TunnelConnection: Send {
    /// Resolves once the session is lost, with the reason
    async fn closed(&mut self) -> TunnelError;

    /// Tear the session down; dropping the connection must also release it
    async fn close(self: Box<Self>);
}
